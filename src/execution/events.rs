//! Execution events and notifiers for observability.
//!
//! The engine emits an event for every step and execution transition.
//! Consumers decide what to do with them (stream to a UI, forward to a
//! message bus, count them); the engine never waits on a consumer.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted during workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    WorkflowStarted {
        execution_id: String,
        workflow_id: String,
    },

    StepStarted {
        execution_id: String,
        step_id: String,
    },

    StepCompleted {
        execution_id: String,
        step_id: String,
        output: serde_json::Value,
    },

    /// Condition evaluated false.
    StepSkipped {
        execution_id: String,
        step_id: String,
    },

    StepFailed {
        execution_id: String,
        step_id: String,
        error: String,
        optional: bool,
    },

    /// A step suspended the execution; `topic` is where the decision goes.
    StepAwaitingInput {
        execution_id: String,
        step_id: String,
        topic: String,
    },

    WorkflowPaused {
        execution_id: String,
        awaiting_steps: Vec<String>,
    },

    WorkflowResumed {
        execution_id: String,
        step_id: String,
    },

    WorkflowCompleted {
        execution_id: String,
    },

    WorkflowFailed {
        execution_id: String,
        error: String,
    },

    WorkflowCancelled {
        execution_id: String,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::WorkflowStarted { execution_id, .. }
            | Self::StepStarted { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::StepSkipped { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::StepAwaitingInput { execution_id, .. }
            | Self::WorkflowPaused { execution_id, .. }
            | Self::WorkflowResumed { execution_id, .. }
            | Self::WorkflowCompleted { execution_id }
            | Self::WorkflowFailed { execution_id, .. }
            | Self::WorkflowCancelled { execution_id } => execution_id,
        }
    }
}

/// Receives execution events.
pub trait ExecutionNotifier: Send + Sync {
    fn notify(&self, event: ExecutionEvent);
}

/// A notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
    fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
///
/// Unbounded so a slow consumer never stalls a scheduling loop; event
/// volume is a handful per step.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
    pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        Self { sender }
    }

    /// Creates a notifier together with its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl ExecutionNotifier for ChannelNotifier {
    fn notify(&self, event: ExecutionEvent) {
        // Receiver may have been dropped
        let _ = self.sender.send(event);
    }
}
