//! FlowRunner - Workflow Execution Engine
//!
//! Runs workflows described as directed acyclic graphs of typed steps.
//! Steps are dispatched in waves: every step whose dependencies are
//! satisfied runs concurrently, and the engine re-plans after each wave.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`workflow`]: Data structures, parsing, validation and persistence
//! - [`execution`]: Wave scheduler, step registry and pause/resume
//! - [`steps`]: Built-in step kinds (input, output, trigger, merge, subflow, approval)
//! - [`monitoring`]: Execution timeline
//! - [`config`]: Engine configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use flowrunner::execution::{UserContext, WorkflowEngine};
//! use flowrunner::load_workflow;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let workflow = load_workflow("pipeline.yaml")?;
//!
//!     // Create execution engine with the built-in steps
//!     let engine = WorkflowEngine::builder().build();
//!
//!     // Execute the workflow and wait for it to finish or pause
//!     let summary = engine
//!         .execute(workflow, None, json!({}), UserContext::default(), true)
//!         .await?;
//!     println!("{} finished as {}", summary.execution_id, summary.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod steps;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, StepError};
pub use execution::{ExecutionStatus, StepRegistry, WorkflowEngine};
pub use workflow::model::{StepConfig, WorkflowConfig};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";
