//! Error Types
//!
//! One error enum per concern:
//!
//! - [`ValidationError`]: workflow graph rejected before any dispatch
//! - [`RegistryError`]: step-type lookup and executor failures
//! - [`StepError`]: what a step executor returns
//! - [`SubflowError`]: nested execution configuration and propagation
//! - [`StoreError`]: persistence failures
//! - [`ParseError`]: workflow file loading
//! - [`EngineError`]: everything the engine's public API can reject

use thiserror::Error;

use crate::execution::context::ExecutionStatus;

/// Structural problems found in a workflow definition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Workflow has no steps")]
    EmptyWorkflow,

    #[error("Step has empty or whitespace-only ID")]
    EmptyStepId,

    #[error("Step '{0}' has no step type")]
    EmptyStepType(String),

    #[error("Duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    #[error("Step ID '{0}' is reserved for engine-staged data")]
    ReservedStepId(String),

    #[error("Step '{step}' references unknown step '{reference}'")]
    InvalidReference { step: String, reference: String },

    #[error("Entry step '{0}' does not exist")]
    UnknownEntry(String),

    #[error("Step '{step}': invalid value for '{parameter}': {message}")]
    InvalidParameter {
        step: String,
        parameter: String,
        message: String,
    },

    #[error("Workflow contains a dependency cycle through: {}", .steps.join(", "))]
    CyclicWorkflow { steps: Vec<String> },
}

/// Failures reported by a step executor.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// Permanent failure; never retried.
    #[error("{0}")]
    Failed(String),

    /// Transient failure; retried according to the step's retry policy.
    #[error("{0}")]
    Retryable(String),

    #[error("timeout")]
    Timeout,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Subflow(#[from] SubflowError),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    /// Returns true if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_) | Self::Timeout)
    }
}

/// Subflow configuration and propagation errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubflowError {
    #[error("subflow step is missing required parameter '{missing}'")]
    Configuration { missing: String },

    #[error("subflow workflow '{0}' is not registered with the engine")]
    WorkflowNotFound(String),

    #[error("no workflow engine is attached to the execution context")]
    EngineUnavailable,

    #[error("subflow nesting exceeds the maximum depth of {0}")]
    DepthExceeded(usize),

    #[error("Subflow execution failed (child {child_execution_id}): {cause}")]
    Execution {
        child_execution_id: String,
        cause: String,
    },
}

/// Step registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("step type '{0}' is already registered")]
    DuplicateStepType(String),

    #[error("unknown step type '{0}'")]
    UnknownStepType(String),

    #[error("step '{step_id}' failed: {cause}")]
    StepExecution {
        step_id: String,
        #[source]
        cause: StepError,
    },
}

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no saved state for execution '{0}'")]
    NotFound(String),

    #[error("state for execution '{expected}' holds execution '{found}'")]
    IdMismatch { expected: String, found: String },
}

/// Workflow file loading errors.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by the [`WorkflowEngine`](crate::execution::WorkflowEngine) API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("execution '{0}' already exists")]
    DuplicateExecution(String),

    #[error("invalid execution id '{0}': ':' is reserved for decision topics")]
    InvalidExecutionId(String),

    #[error("execution '{execution_id}' is not paused (status: {status})")]
    ExecutionNotPaused {
        execution_id: String,
        status: ExecutionStatus,
    },

    #[error("step '{step_id}' is not awaiting input in execution '{execution_id}'")]
    UnknownPausedStep {
        execution_id: String,
        step_id: String,
    },

    #[error("invalid decision topic '{0}'")]
    InvalidTopic(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}
