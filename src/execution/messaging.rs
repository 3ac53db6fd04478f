//! Decision topics.
//!
//! A paused step is addressed by `wf:{execution_id}:{step_id}:{suffix}`.
//! External actors publish their decision to that channel on whatever
//! transport the host application uses; the host calls
//! [`WorkflowEngine::resume_topic`](super::WorkflowEngine::resume_topic)
//! with the topic and payload.

use std::fmt;

/// Topic prefix shared by all workflow decision channels.
pub const TOPIC_PREFIX: &str = "wf";

/// Suffix used when none is given.
pub const DEFAULT_DECISION_SUFFIX: &str = "user_msg";

/// Separator between topic parts; not allowed in execution IDs.
pub const TOPIC_SEPARATOR: char = ':';

/// Whether `execution_id` can be addressed unambiguously by a topic.
pub fn is_valid_execution_id(execution_id: &str) -> bool {
    !execution_id.is_empty() && !execution_id.contains(TOPIC_SEPARATOR)
}

/// Returns `wf:{execution_id}:{step_id}:{suffix}`.
pub fn make_decision_topic(execution_id: &str, step_id: &str, suffix: Option<&str>) -> String {
    format!(
        "{}:{}:{}:{}",
        TOPIC_PREFIX,
        execution_id,
        step_id,
        suffix.unwrap_or(DEFAULT_DECISION_SUFFIX)
    )
}

/// The parts of a decision topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionTopic {
    pub execution_id: String,
    pub step_id: String,
    pub suffix: String,
}

impl DecisionTopic {
    /// Parses a topic built by [`make_decision_topic`].
    ///
    /// Execution IDs may not contain `:` (the engine rejects them at
    /// launch); step IDs may, so the suffix is taken from the right.
    pub fn parse(topic: &str) -> Option<Self> {
        let rest = topic.strip_prefix(TOPIC_PREFIX)?.strip_prefix(':')?;
        let (execution_id, rest) = rest.split_once(':')?;
        let (step_id, suffix) = rest.rsplit_once(':')?;
        if execution_id.is_empty() || step_id.is_empty() || suffix.is_empty() {
            return None;
        }
        Some(Self {
            execution_id: execution_id.to_string(),
            step_id: step_id.to_string(),
            suffix: suffix.to_string(),
        })
    }
}

impl fmt::Display for DecisionTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&make_decision_topic(
            &self.execution_id,
            &self.step_id,
            Some(&self.suffix),
        ))
    }
}
