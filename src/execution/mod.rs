//! Workflow Execution Module
//!
//! Provides the core execution engine for running workflow steps,
//! including wave scheduling, the step registry, and pause/resume.
//!
//! # Architecture
//!
//! - [`engine`]: Main execution engine orchestrating workflow runs
//! - [`context`]: Per-execution state, results and summaries
//! - [`registry`]: Step executor trait and step-type registry
//! - [`step`]: Individual step invocation (worker slot, timeout, retries)
//! - [`events`]: Execution events and notifiers
//! - [`messaging`]: Decision topics for paused steps

pub mod context;
pub mod engine;
pub mod events;
pub mod messaging;
pub mod registry;
pub mod step;

pub use context::{
    ExecutionContext, ExecutionStatus, ExecutionSummary, StepResult, StepStatus, UserContext,
};
pub use engine::{EngineBuilder, EngineHandle, ExecutionAnalytics, WorkflowEngine};
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use messaging::{is_valid_execution_id, make_decision_topic, DecisionTopic};
pub use registry::{step_fn, StepExecutor, StepOutput, StepRegistry};
