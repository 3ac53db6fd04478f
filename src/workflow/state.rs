//! Execution State Persistence
//!
//! The engine saves every execution at wave boundaries through the
//! [`ExecutionStore`] interface so a crashed or restarted process can
//! resume from the last completed wave.
//!
//! - [`MemoryStore`]: in-process snapshots (the default)
//! - [`FileStore`]: one pretty-printed JSON file per execution at
//!   `{state_dir}/{execution_id}.state`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use log::{debug, info};
use tokio::fs;

use crate::config::DEFAULT_STATE_DIR;
use crate::error::StoreError;
use crate::execution::context::ExecutionContext;

/// Save/load interface for execution snapshots.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn save(&self, context: &ExecutionContext) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] when nothing was saved.
    async fn load(&self, execution_id: &str) -> Result<ExecutionContext, StoreError>;

    async fn delete(&self, execution_id: &str) -> Result<(), StoreError>;
}

/// Keeps serialized snapshots in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn save(&self, context: &ExecutionContext) -> Result<(), StoreError> {
        let json = serde_json::to_string(context)?;
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(context.execution_id.clone(), json);
        Ok(())
    }

    async fn load(&self, execution_id: &str) -> Result<ExecutionContext, StoreError> {
        let json = self
            .snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))?;
        Ok(serde_json::from_str(&json)?)
    }

    async fn delete(&self, execution_id: &str) -> Result<(), StoreError> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(execution_id);
        Ok(())
    }
}

/// Stores each execution as a JSON file in a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// A store rooted at `FLOWRUNNER_STATE_DIR` or `.flowrunner`.
    pub fn default_location() -> Self {
        Self::new(DEFAULT_STATE_DIR.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the state file path for an execution.
    ///
    /// Bytes outside `[A-Za-z0-9_-]` are percent-encoded, so the name never
    /// contains a path separator or a leading dot and distinct IDs never
    /// share a file.
    pub fn state_file_path(&self, execution_id: &str) -> PathBuf {
        let mut name = String::with_capacity(execution_id.len() + ".state".len());
        for byte in execution_id.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
                name.push(char::from(byte));
            } else {
                name.push_str(&format!("%{:02X}", byte));
            }
        }
        name.push_str(".state");
        self.dir.join(name)
    }
}

#[async_trait]
impl ExecutionStore for FileStore {
    async fn save(&self, context: &ExecutionContext) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;

        let state_file = self.state_file_path(&context.execution_id);
        let staging = state_file.with_extension("state.tmp");
        let json = serde_json::to_string_pretty(context)?;
        fs::write(&staging, json).await?;
        fs::rename(&staging, &state_file).await?;

        debug!("Saved execution state to {}", state_file.display());
        Ok(())
    }

    async fn load(&self, execution_id: &str) -> Result<ExecutionContext, StoreError> {
        let state_file = self.state_file_path(execution_id);
        let content = match fs::read_to_string(&state_file).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(execution_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let context: ExecutionContext = serde_json::from_str(&content)?;
        if context.execution_id != execution_id {
            return Err(StoreError::IdMismatch {
                expected: execution_id.to_string(),
                found: context.execution_id,
            });
        }

        info!("Loaded execution state from {}", state_file.display());
        Ok(context)
    }

    async fn delete(&self, execution_id: &str) -> Result<(), StoreError> {
        let state_file = self.state_file_path(execution_id);
        match fs::remove_file(&state_file).await {
            Ok(()) => {
                info!("Deleted state file: {}", state_file.display());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
