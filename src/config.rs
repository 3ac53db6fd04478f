//! Engine Configuration
//!
//! Tunables for the scheduling loop and worker pool, with environment
//! overrides. The CLI layers its flags on top of [`EngineConfig::from_env`].

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use log::warn;
use once_cell::sync::Lazy;

/// Directory used by the file store unless configured otherwise.
pub static DEFAULT_STATE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    env::var_os("FLOWRUNNER_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".flowrunner"))
});

/// Default number of finished executions kept for queries.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Default upper bound on steps dispatched per wave per execution.
pub const DEFAULT_WAVE_WIDTH: usize = 32;

/// Default subflow nesting bound.
pub const DEFAULT_MAX_SUBFLOW_DEPTH: usize = 8;

/// Workflow engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine-wide worker pool size shared by all executions
    pub max_concurrent_steps: usize,
    /// Steps dispatched per wave for one execution
    pub max_wave_width: usize,
    /// Timeout for steps with no step- or type-level timeout
    pub default_step_timeout: Option<Duration>,
    /// Per step-type timeouts
    pub step_type_timeouts: HashMap<String, Duration>,
    /// Finished executions retained in memory
    pub history_limit: usize,
    pub max_subflow_depth: usize,
    pub state_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: num_cpus::get().max(1) * 4,
            max_wave_width: DEFAULT_WAVE_WIDTH,
            default_step_timeout: None,
            step_type_timeouts: HashMap::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_subflow_depth: DEFAULT_MAX_SUBFLOW_DEPTH,
            state_dir: DEFAULT_STATE_DIR.clone(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `FLOWRUNNER_MAX_CONCURRENCY`,
    /// `FLOWRUNNER_WAVE_WIDTH` and `FLOWRUNNER_STEP_TIMEOUT_SECS`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_number::<usize>("FLOWRUNNER_MAX_CONCURRENCY") {
            config.max_concurrent_steps = n.max(1);
        }
        if let Some(n) = env_number::<usize>("FLOWRUNNER_WAVE_WIDTH") {
            config.max_wave_width = n.max(1);
        }
        if let Some(secs) = env_number::<f64>("FLOWRUNNER_STEP_TIMEOUT_SECS") {
            config.default_step_timeout = Duration::try_from_secs_f64(secs)
                .ok()
                .filter(|d| !d.is_zero());
        }

        config
    }

    pub fn with_max_concurrent_steps(mut self, max: usize) -> Self {
        self.max_concurrent_steps = max.max(1);
        self
    }

    pub fn with_max_wave_width(mut self, max: usize) -> Self {
        self.max_wave_width = max.max(1);
        self
    }

    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = Some(timeout);
        self
    }

    pub fn with_step_type_timeout(mut self, step_type: impl Into<String>, timeout: Duration) -> Self {
        self.step_type_timeouts.insert(step_type.into(), timeout);
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn with_max_subflow_depth(mut self, depth: usize) -> Self {
        self.max_subflow_depth = depth;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Timeout for a step: step setting, then step type, then the default.
    pub fn timeout_for(&self, step_type: &str, step_timeout: Option<Duration>) -> Option<Duration> {
        step_timeout
            .or_else(|| self.step_type_timeouts.get(step_type).copied())
            .or(self.default_step_timeout)
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value for {}: '{}'", key, raw);
            None
        }
    }
}
