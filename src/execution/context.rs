//! Execution Context
//!
//! Mutable state of one workflow run. The engine's scheduling loop is the
//! only writer; step executors receive a read-only snapshot taken at the
//! start of their wave.
//!
//! # Data layout
//!
//! - `step_io_data`: per-step staged payloads before a step runs, replaced by
//!   the step's output once it succeeds. Two engine-owned keys live here too:
//!   `trigger_raw` (the whole trigger payload) and `subflow_input` (the
//!   mapped input of a nested execution).
//! - `step_results`: the latest [`StepResult`] per step; retries replace it.
//! - `completed_steps`: steps that will not run again in this execution.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::engine::{EngineHandle, WorkflowEngine};
use super::registry::StepOutput;
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::workflow::model::{StepConfig, WorkflowConfig};
use crate::workflow::selector;

/// `step_io_data` key holding the raw trigger payload.
pub const TRIGGER_RAW_KEY: &str = "trigger_raw";

/// `step_io_data` key holding a subflow's mapped input.
pub const SUBFLOW_INPUT_KEY: &str = "subflow_input";

/// Lifecycle status of an execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Completed, failed and cancelled executions never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one step attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    AwaitingInput,
    /// Condition evaluated false; the executor was not called
    Skipped,
    /// Interrupted because the execution was cancelled
    Cancelled,
}

/// Result of a step, as recorded by the scheduling loop.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output_data: StepOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Retry attempts made before this result
    #[serde(default)]
    pub retry_count: u32,
    /// Scheduling tick in which the result was recorded
    #[serde(default)]
    pub wave: u64,
}

impl StepResult {
    fn new(step_id: impl Into<String>, status: StepStatus, output_data: StepOutput) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            status,
            output_data,
            error: None,
            started_at: now,
            completed_at: now,
            retry_count: 0,
            wave: 0,
        }
    }

    pub fn success(step_id: impl Into<String>, output_data: StepOutput) -> Self {
        Self::new(step_id, StepStatus::Success, output_data)
    }

    pub fn failed(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        let mut result = Self::new(step_id, StepStatus::Failed, StepOutput::new());
        result.error = Some(error.into());
        result
    }

    pub fn awaiting_input(step_id: impl Into<String>, output_data: StepOutput) -> Self {
        Self::new(step_id, StepStatus::AwaitingInput, output_data)
    }

    pub fn skipped(step_id: impl Into<String>) -> Self {
        Self::new(step_id, StepStatus::Skipped, StepOutput::new())
    }

    pub fn cancelled(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut result = Self::new(step_id, StepStatus::Cancelled, StepOutput::new());
        result.error = Some(reason.into());
        result
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds()
    }
}

/// Identity and tenant attributes of whoever started an execution.
///
/// Propagated unchanged to every step and every nested execution.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UserContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }
}

/// State of one workflow run.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    /// Subflow nesting level; zero for top-level executions
    #[serde(default)]
    pub depth: usize,
    pub status: ExecutionStatus,
    /// Snapshot of the workflow this execution runs
    pub workflow: Arc<WorkflowConfig>,
    pub completed_steps: BTreeSet<String>,
    pub step_results: BTreeMap<String, StepResult>,
    pub step_io_data: Map<String, Value>,
    #[serde(default)]
    pub user_context: UserContext,
    /// Steps whose result suspended the execution
    #[serde(default)]
    pub awaiting_steps: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Scheduling ticks performed so far
    #[serde(default)]
    pub waves: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeline: ExecutionTimeline,
    /// Back-reference used by steps that start nested executions
    #[serde(skip)]
    pub workflow_engine: Option<EngineHandle>,
}

impl ExecutionContext {
    /// Creates a `pending` context for a workflow.
    pub fn new(
        execution_id: impl Into<String>,
        workflow: Arc<WorkflowConfig>,
        user_context: UserContext,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow.workflow_id.clone(),
            parent_execution_id: None,
            depth: 0,
            status: ExecutionStatus::Pending,
            workflow,
            completed_steps: BTreeSet::new(),
            step_results: BTreeMap::new(),
            step_io_data: Map::new(),
            user_context,
            awaiting_steps: BTreeSet::new(),
            error_message: None,
            waves: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeline: ExecutionTimeline::new(),
            workflow_engine: None,
        }
    }

    /// The engine running this execution, if it is still alive.
    pub fn engine(&self) -> Option<WorkflowEngine> {
        self.workflow_engine.as_ref().and_then(EngineHandle::upgrade)
    }

    /// The raw trigger payload, if any was supplied.
    pub fn trigger_raw(&self) -> Option<&Value> {
        self.step_io_data
            .get(TRIGGER_RAW_KEY)
            .filter(|value| !value.is_null())
    }

    /// Payload staged for a step before it runs (or its output after).
    pub fn staged_data(&self, step_id: &str) -> Option<&Value> {
        self.step_io_data.get(step_id)
    }

    /// Seeds `step_io_data` from a trigger payload.
    ///
    /// The whole payload is kept under `trigger_raw`. Object keys matching
    /// step IDs stage that value for the step. When no key matches, the
    /// payload is staged for the entry steps (or the single root step).
    pub fn seed_trigger_payload(&mut self, payload: Value) {
        if payload.is_null() {
            return;
        }

        let mut keyed = false;
        if let Value::Object(fields) = &payload {
            for step in &self.workflow.steps {
                if let Some(value) = fields.get(&step.step_id) {
                    self.step_io_data.insert(step.step_id.clone(), value.clone());
                    keyed = true;
                }
            }
        }

        if !keyed {
            let targets: Vec<String> = if !self.workflow.entry.is_empty() {
                self.workflow.entry.clone()
            } else {
                match self.workflow.root_steps().as_slice() {
                    [only] => vec![only.step_id.clone()],
                    _ => Vec::new(),
                }
            };
            for target in targets {
                self.step_io_data.insert(target, payload.clone());
            }
        }

        self.step_io_data.insert(TRIGGER_RAW_KEY.to_string(), payload);
    }

    /// Builds the input map handed to a step's executor.
    ///
    /// With an `input_mapping`, each target key is resolved from a dotted
    /// path (first segment a step ID, falling back to the trigger payload);
    /// unresolved paths are omitted. Otherwise the staged payload is used,
    /// wrapped as `{"value": ...}` when it is not an object.
    pub fn step_input(&self, step: &StepConfig) -> StepOutput {
        if !step.input_mapping.is_empty() {
            let trigger = self.trigger_raw();
            return step
                .input_mapping
                .iter()
                .filter_map(|(target, path)| {
                    selector::resolve(&self.step_io_data, trigger, path)
                        .map(|value| (target.clone(), value.clone()))
                })
                .collect();
        }

        match self.step_io_data.get(&step.step_id) {
            Some(Value::Object(fields)) => fields.clone(),
            Some(Value::Null) | None => StepOutput::new(),
            Some(other) => {
                let mut wrapped = StepOutput::new();
                wrapped.insert("value".to_string(), other.clone());
                wrapped
            }
        }
    }

    /// Records a result that finishes a step: success, skip, or an
    /// absorbed optional failure.
    ///
    /// A success replaces the step's `step_io_data` entry with its output
    /// rather than merging into it. The staged value is the step's raw
    /// input (a trigger payload or a resume decision) and input steps
    /// already wrap it under `data`, so keeping its keys beside the output
    /// would hand downstream steps the same payload twice.
    pub fn complete_step(&mut self, result: StepResult) {
        let event = match result.status {
            StepStatus::Success => EventType::Completed,
            StepStatus::Skipped => EventType::Skipped,
            StepStatus::Failed => EventType::Failed,
            StepStatus::AwaitingInput => EventType::AwaitingInput,
            StepStatus::Cancelled => EventType::Cancelled,
        };
        self.finish_step(result, event);
    }

    /// Completes a suspended step with the decision delivered on resume.
    pub fn resume_step(&mut self, result: StepResult) {
        self.finish_step(result, EventType::Resumed);
    }

    /// Replaces the staged entry on success; see [`complete_step`](Self::complete_step).
    fn finish_step(&mut self, result: StepResult, event: EventType) {
        self.timeline
            .add_event_at(result.step_id.clone(), event, result.completed_at);

        if result.status == StepStatus::Success {
            self.step_io_data.insert(
                result.step_id.clone(),
                Value::Object(result.output_data.clone()),
            );
        }
        self.awaiting_steps.remove(&result.step_id);
        self.completed_steps.insert(result.step_id.clone());
        self.step_results.insert(result.step_id.clone(), result);
    }

    /// Records a fatal failure or a cancelled step without completing it.
    pub fn record_failure(&mut self, result: StepResult) {
        let event = match result.status {
            StepStatus::Cancelled => EventType::Cancelled,
            _ => EventType::Failed,
        };
        self.timeline
            .add_event_at(result.step_id.clone(), event, result.completed_at);
        self.step_results.insert(result.step_id.clone(), result);
    }

    /// Records a suspension; the step stays out of `completed_steps`.
    pub fn mark_awaiting(&mut self, result: StepResult) {
        self.timeline.add_event_at(
            result.step_id.clone(),
            EventType::AwaitingInput,
            result.completed_at,
        );
        self.awaiting_steps.insert(result.step_id.clone());
        self.step_results.insert(result.step_id.clone(), result);
    }

    /// Moves to `status` and stamps the completion time for terminal states.
    pub fn transition(&mut self, status: ExecutionStatus) {
        self.status = status;
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }

    /// Marks the execution failed with a top-level cause.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
        self.transition(ExecutionStatus::Failed);
    }

    pub fn get_step_result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.get(step_id)
    }

    pub fn is_step_completed(&self, step_id: &str) -> bool {
        self.completed_steps.contains(step_id)
    }

    /// Read-only projection for callers.
    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary::from_context(self)
    }
}

/// Read-only projection of an [`ExecutionContext`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    pub status: ExecutionStatus,
    /// Top-level cause when the execution failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub total_steps: usize,
    pub succeeded_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub awaiting_steps: Vec<String>,
    pub pending_steps: usize,
    pub waves: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl ExecutionSummary {
    fn from_context(context: &ExecutionContext) -> Self {
        let count = |status: StepStatus| {
            context
                .step_results
                .values()
                .filter(|r| r.status == status)
                .count()
        };
        let total_steps = context.workflow.steps.len();
        let pending_steps = context
            .workflow
            .steps
            .iter()
            .filter(|s| {
                !context.completed_steps.contains(&s.step_id)
                    && !context.awaiting_steps.contains(&s.step_id)
            })
            .count();
        let duration_ms = context.started_at.map(|start| {
            (context.completed_at.unwrap_or_else(Utc::now) - start).num_milliseconds()
        });

        Self {
            execution_id: context.execution_id.clone(),
            workflow_id: context.workflow_id.clone(),
            parent_execution_id: context.parent_execution_id.clone(),
            status: context.status,
            error_message: context.error_message.clone(),
            total_steps,
            succeeded_steps: count(StepStatus::Success),
            failed_steps: count(StepStatus::Failed),
            skipped_steps: count(StepStatus::Skipped),
            awaiting_steps: context.awaiting_steps.iter().cloned().collect(),
            pending_steps,
            waves: context.waves,
            created_at: context.created_at,
            started_at: context.started_at,
            completed_at: context.completed_at,
            duration_ms,
        }
    }

    /// True when the run finished without any failed step.
    pub fn is_clean_success(&self) -> bool {
        self.status == ExecutionStatus::Completed && self.failed_steps == 0
    }
}
