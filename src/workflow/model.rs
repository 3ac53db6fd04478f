//! Workflow Data Model
//!
//! Declarative graph structures: steps, their dependency edges and the
//! per-step policies (gating, retries, timeouts, conditions) the engine reads.
//! No execution behavior lives here.
//!
//! # Example YAML Format
//!
//! ```yaml
//! workflow_id: support_triage
//! steps:
//!   - step_id: webhook
//!     step_type: input
//!     parameters:
//!       kind: webhook
//!
//!   - step_id: chat
//!     step_type: trigger
//!
//!   - step_id: combine
//!     step_type: merge
//!     dependencies: [webhook, chat]
//!     parameters:
//!       mode: first_available
//!       combine_mode: first
//!
//!   - step_id: done
//!     step_type: output
//!     dependencies: combine
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::condition::Condition;

/// Names of the built-in step types.
pub mod step_types {
    pub const INPUT: &str = "input";
    pub const OUTPUT: &str = "output";
    pub const TRIGGER: &str = "trigger";
    pub const MERGE: &str = "merge";
    pub const SUBFLOW: &str = "subflow";
    pub const HUMAN_APPROVAL: &str = "human_approval";
}

/// Readiness predicate applied to a step's dependencies.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GatingMode {
    /// Ready once every dependency has completed.
    #[default]
    WaitAll,
    /// Ready as soon as any one dependency has completed.
    FirstAvailable,
}

impl GatingMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "wait_all" => Some(Self::WaitAll),
            "first_available" => Some(Self::FirstAvailable),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitAll => "wait_all",
            Self::FirstAvailable => "first_available",
        }
    }
}

/// Shape in which a merge step packages its dependencies' outputs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CombineMode {
    First,
    Array,
    #[default]
    Object,
}

impl CombineMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "first" => Some(Self::First),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// Delay progression between retry attempts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    None,
    FixedDelay,
    #[default]
    ExponentialBackoff,
    LinearBackoff,
}

/// Retry configuration for a single step.
///
/// Only transient failures (retryable errors and timeouts) are retried.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub max_retries: u32,
    pub strategy: RetryStrategy,
    pub delay_seconds: f64,
    pub max_delay_seconds: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            strategy: RetryStrategy::default(),
            delay_seconds: 1.0,
            max_delay_seconds: 60.0,
        }
    }
}

impl RetryPolicy {
    /// A policy retrying `max_retries` times with a fixed delay.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            strategy: RetryStrategy::FixedDelay,
            delay_seconds: delay.as_secs_f64(),
            ..Self::default()
        }
    }

    /// Delay to wait before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay_seconds.max(0.0);
        let secs = match self.strategy {
            RetryStrategy::None => 0.0,
            RetryStrategy::FixedDelay => base,
            RetryStrategy::ExponentialBackoff => {
                base * 2f64.powi(attempt.saturating_sub(1).min(30) as i32)
            }
            RetryStrategy::LinearBackoff => base * attempt as f64,
        };
        let capped = secs.min(self.max_delay_seconds.max(0.0));
        Duration::try_from_secs_f64(capped).unwrap_or_default()
    }
}

/// A single node in a workflow graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepConfig {
    /// Unique identifier within the workflow (assigned on load if omitted)
    #[serde(default)]
    pub step_id: String,

    /// Tag dispatched through the step registry
    pub step_type: String,

    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Opaque parameters interpreted by the step implementation
    #[serde(default)]
    pub parameters: Map<String, Value>,

    /// IDs of steps that must be considered before this step may run
    #[serde(deserialize_with = "single_or_vec", default)]
    pub dependencies: Vec<String>,

    /// Target key -> dotted source path used to build this step's input
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, String>,

    /// Failure of an optional step does not fail the execution
    #[serde(default)]
    pub optional: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Skips the step when it evaluates to false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    /// Explicit gating mode; merge steps otherwise read `parameters.mode`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gating: Option<GatingMode>,
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in dependency list")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

impl StepConfig {
    /// Creates a step with no parameters or dependencies.
    ///
    /// # Example
    ///
    /// ```
    /// use flowrunner::workflow::StepConfig;
    /// use serde_json::json;
    ///
    /// let step = StepConfig::new("combine", "merge")
    ///     .depends_on("a")
    ///     .depends_on("b")
    ///     .with_parameter("combine_mode", json!("array"));
    /// ```
    pub fn new(step_id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into().trim().to_string(),
            step_type: step_type.into().trim().to_string(),
            name: None,
            parameters: Map::new(),
            dependencies: Vec::new(),
            input_mapping: BTreeMap::new(),
            optional: false,
            timeout_seconds: None,
            retry: RetryPolicy::default(),
            condition: None,
            gating: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    pub fn with_input_mapping(mut self, target: impl Into<String>, path: impl Into<String>) -> Self {
        self.input_mapping.insert(target.into(), path.into());
        self
    }

    /// Marks the step optional: its failure is recorded but not fatal.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_gating(mut self, gating: GatingMode) -> Self {
        self.gating = Some(gating);
        self
    }

    /// Returns a string parameter, if present.
    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// Returns a boolean parameter, or `default` when absent or not a bool.
    pub fn parameter_bool(&self, key: &str, default: bool) -> bool {
        self.parameters
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// Effective gating mode for readiness.
    pub fn gating_mode(&self) -> GatingMode {
        if let Some(mode) = self.gating {
            return mode;
        }
        if self.step_type == step_types::MERGE {
            if let Some(mode) = self.parameter_str("mode").and_then(GatingMode::parse) {
                return mode;
            }
        }
        GatingMode::WaitAll
    }

    /// Combine mode for merge steps (`object` when unspecified).
    pub fn combine_mode(&self) -> CombineMode {
        self.parameter_str("combine_mode")
            .and_then(CombineMode::parse)
            .unwrap_or_default()
    }

    /// Step-level timeout, if configured with a positive value.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Name used in logs and reports.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.step_id)
    }
}

/// A complete workflow: an ordered collection of steps plus metadata.
///
/// Immutable once an execution starts; the engine holds it behind an `Arc`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct WorkflowConfig {
    /// Assigned on load if omitted
    #[serde(default)]
    pub workflow_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Steps in declaration order
    #[serde(default)]
    pub steps: Vec<StepConfig>,

    /// Steps that receive an un-keyed trigger payload
    #[serde(deserialize_with = "single_or_vec", default)]
    pub entry: Vec<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl WorkflowConfig {
    /// Creates an empty workflow.
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            ..Self::default()
        }
    }

    /// Creates a workflow from a list of steps.
    pub fn from_steps(workflow_id: impl Into<String>, steps: Vec<StepConfig>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            steps,
            ..Self::default()
        }
    }

    /// Builder-style step append; duplicates are caught by validation.
    pub fn with_step(mut self, step: StepConfig) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_entry(mut self, step_id: impl Into<String>) -> Self {
        self.entry.push(step_id.into());
        self
    }

    /// Adds a step, rejecting duplicate IDs.
    pub fn add_step(&mut self, step: StepConfig) -> Result<(), String> {
        if self.get_step(&step.step_id).is_some() {
            return Err(format!("Step '{}' already exists", step.step_id));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Gets a step by ID.
    pub fn get_step(&self, step_id: &str) -> Option<&StepConfig> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Position of a step in declaration order.
    pub fn position(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.step_id == step_id)
    }

    /// Returns steps with no dependencies.
    pub fn root_steps(&self) -> Vec<&StepConfig> {
        self.steps
            .iter()
            .filter(|s| s.dependencies.is_empty())
            .collect()
    }

    /// Steps that declare `step_id` as a dependency.
    pub fn dependents(&self, step_id: &str) -> Vec<&StepConfig> {
        self.steps
            .iter()
            .filter(|s| s.dependencies.iter().any(|d| d == step_id))
            .collect()
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_creation() {
        let step = StepConfig::new(" fetch ", "tool")
            .with_name("Fetch")
            .depends_on("trigger")
            .with_parameter("url", json!("https://example.com"))
            .optional();

        assert_eq!(step.step_id, "fetch");
        assert_eq!(step.step_type, "tool");
        assert_eq!(step.dependencies, vec!["trigger"]);
        assert_eq!(step.parameter_str("url"), Some("https://example.com"));
        assert!(step.optional);
        assert_eq!(step.display_name(), "Fetch");
    }

    #[test]
    fn test_merge_gating_from_parameters() {
        let step = StepConfig::new("m", step_types::MERGE)
            .with_parameter("mode", json!("first_available"));
        assert_eq!(step.gating_mode(), GatingMode::FirstAvailable);

        let default = StepConfig::new("m", step_types::MERGE);
        assert_eq!(default.gating_mode(), GatingMode::WaitAll);
    }

    #[test]
    fn test_mode_parameter_ignored_on_other_types() {
        let step = StepConfig::new("t", "tool").with_parameter("mode", json!("first_available"));
        assert_eq!(step.gating_mode(), GatingMode::WaitAll);

        let explicit = StepConfig::new("t", "tool").with_gating(GatingMode::FirstAvailable);
        assert_eq!(explicit.gating_mode(), GatingMode::FirstAvailable);
    }

    #[test]
    fn test_combine_mode_defaults_to_object() {
        let step = StepConfig::new("m", step_types::MERGE);
        assert_eq!(step.combine_mode(), CombineMode::Object);

        let array = step.with_parameter("combine_mode", json!("array"));
        assert_eq!(array.combine_mode(), CombineMode::Array);
    }

    #[test]
    fn test_retry_delays() {
        let mut policy = RetryPolicy {
            max_retries: 5,
            strategy: RetryStrategy::ExponentialBackoff,
            delay_seconds: 1.0,
            max_delay_seconds: 5.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));

        policy.strategy = RetryStrategy::LinearBackoff;
        assert_eq!(policy.delay_for(3), Duration::from_secs(3));

        policy.strategy = RetryStrategy::None;
        assert_eq!(policy.delay_for(3), Duration::ZERO);
    }

    #[test]
    fn test_dependencies_accept_single_string() {
        let step: StepConfig = serde_yaml::from_str(
            "step_id: out\nstep_type: output\ndependencies: combine\n",
        )
        .unwrap();
        assert_eq!(step.dependencies, vec!["combine"]);
        assert_eq!(step.retry, RetryPolicy::default());
    }

    #[test]
    fn test_timeout_ignores_non_positive() {
        let mut step = StepConfig::new("s", "tool");
        step.timeout_seconds = Some(0.0);
        assert!(step.timeout().is_none());

        let step = step.with_timeout(Duration::from_millis(250));
        assert_eq!(step.timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_workflow_add_step() {
        let mut workflow = WorkflowConfig::new("wf");
        assert!(workflow.add_step(StepConfig::new("a", "input")).is_ok());
        assert!(workflow.add_step(StepConfig::new("a", "input")).is_err());
        assert_eq!(workflow.len(), 1);
    }

    #[test]
    fn test_workflow_roots_and_dependents() {
        let workflow = WorkflowConfig::new("wf")
            .with_step(StepConfig::new("a", "input"))
            .with_step(StepConfig::new("b", "input"))
            .with_step(StepConfig::new("m", "merge").depends_on("a").depends_on("b"));

        let roots: Vec<_> = workflow.root_steps().iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(roots, vec!["a", "b"]);
        assert_eq!(workflow.dependents("a")[0].step_id, "m");
        assert_eq!(workflow.position("m"), Some(2));
        assert!(workflow.get_step("zzz").is_none());
    }

    #[test]
    fn test_workflow_default_is_empty() {
        let workflow = WorkflowConfig::default();
        assert!(workflow.is_empty());
        assert_eq!(workflow.len(), 0);
    }
}
