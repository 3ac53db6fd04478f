//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing,
//! validating and persisting workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (StepConfig, WorkflowConfig)
//! - [`parser`]: YAML/JSON loading and step-id normalization
//! - [`validator`]: Validation rules and dependency checking
//! - [`planner`]: Wave readiness computation
//! - [`condition`]: Step conditions
//! - [`selector`]: Dotted-path lookup into step data
//! - [`state`]: Execution persistence

pub mod condition;
pub mod model;
pub mod parser;
pub mod planner;
pub mod selector;
pub mod state;
pub mod validator;

pub use condition::{Condition, Operator};
pub use model::{CombineMode, GatingMode, RetryPolicy, RetryStrategy, StepConfig, WorkflowConfig};
pub use parser::load_workflow;
pub use planner::ExecutionPlanner;
pub use state::{ExecutionStore, FileStore, MemoryStore};
pub use validator::validate_workflow;
