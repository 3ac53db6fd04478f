//! Subflow step: runs a registered workflow as one step of the parent.
//!
//! # Parameters
//!
//! - `workflow_id` (required): catalog entry registered with
//!   [`WorkflowEngine::register_workflow`](crate::execution::WorkflowEngine::register_workflow)
//! - `input_mapping`: `{child_key: "dotted.path"}` resolved against the
//!   step's input, then the parent's `step_io_data` and trigger payload
//! - `output_mapping`: `{parent_key: "child_step.path"}` resolved against
//!   the child's `step_io_data`; without it the child's whole data is returned
//!
//! The parent step waits for the child to reach a terminal or paused status.
//! Subflow calls do not hold a worker slot while they wait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::{json, Map, Value};

use crate::error::{StepError, SubflowError};
use crate::execution::context::{ExecutionContext, ExecutionStatus};
use crate::execution::messaging::make_decision_topic;
use crate::execution::registry::{StepExecutor, StepOutput};
use crate::workflow::model::StepConfig;
use crate::workflow::selector;

#[derive(Debug, Clone, Copy, Default)]
pub struct SubflowStep;

#[async_trait]
impl StepExecutor for SubflowStep {
    async fn execute(
        &self,
        step: &StepConfig,
        input: &StepOutput,
        context: &ExecutionContext,
    ) -> Result<StepOutput, StepError> {
        let started_at = Utc::now();

        let Some(workflow_id) = step
            .parameter_str("workflow_id")
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            let err = SubflowError::Configuration {
                missing: "workflow_id".to_string(),
            };
            warn!("Subflow step '{}': {}", step.step_id, err);
            let mut output = StepOutput::new();
            output.insert("success".into(), json!(false));
            output.insert("subflow_id".into(), Value::Null);
            output.insert("error".into(), json!(err.to_string()));
            return Ok(output);
        };

        let engine = context.engine().ok_or(SubflowError::EngineUnavailable)?;
        let max_depth = engine.config().max_subflow_depth;
        if context.depth >= max_depth {
            return Err(SubflowError::DepthExceeded(max_depth).into());
        }
        let workflow = engine
            .workflow(workflow_id)
            .ok_or_else(|| SubflowError::WorkflowNotFound(workflow_id.to_string()))?;

        let child_input = map_input(step, input, context);
        info!(
            "Subflow step '{}' starting workflow '{}' (depth {})",
            step.step_id,
            workflow_id,
            context.depth + 1
        );

        let child = engine
            .execute_child(workflow, context, Value::Object(child_input))
            .await
            .map_err(|err| {
                StepError::failed(format!("subflow '{}' could not start: {}", workflow_id, err))
            })?;

        let mut output = base_output(workflow_id, &child, started_at);
        match child.status {
            ExecutionStatus::Completed => {
                output.insert("success".into(), json!(true));
                output.insert("subflow_output".into(), map_output(step, &child));
            }
            ExecutionStatus::Paused => {
                let topics: Vec<Value> = child
                    .awaiting_steps
                    .iter()
                    .map(|id| json!(make_decision_topic(&child.execution_id, id, None)))
                    .collect();
                info!(
                    "Subflow step '{}' waiting on child execution '{}'",
                    step.step_id, child.execution_id
                );
                output.insert("success".into(), json!(true));
                output.insert("awaiting_input".into(), json!(true));
                output.insert(
                    "awaiting_steps".into(),
                    json!(child.awaiting_steps.iter().collect::<Vec<_>>()),
                );
                output.insert("decision_topics".into(), Value::Array(topics));
            }
            status => {
                let err = SubflowError::Execution {
                    child_execution_id: child.execution_id.clone(),
                    cause: child
                        .error_message
                        .clone()
                        .unwrap_or_else(|| format!("child execution ended as {}", status)),
                };
                warn!("Subflow step '{}': {}", step.step_id, err);
                output.insert("success".into(), json!(false));
                output.insert("failed_at".into(), json!(Utc::now().to_rfc3339()));
                output.insert("error".into(), json!(err.to_string()));
            }
        }
        Ok(output)
    }

    fn uses_worker_slot(&self) -> bool {
        false
    }
}

fn base_output(workflow_id: &str, child: &ExecutionContext, started_at: DateTime<Utc>) -> StepOutput {
    let completed_at = child.completed_at.unwrap_or_else(Utc::now);
    let elapsed = (completed_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;

    let mut output = StepOutput::new();
    output.insert("subflow_id".into(), json!(workflow_id));
    output.insert("subflow_execution_id".into(), json!(child.execution_id));
    output.insert("subflow_status".into(), json!(child.status.as_str()));
    output.insert("execution_time_seconds".into(), json!(elapsed));
    output.insert("started_at".into(), json!(started_at.to_rfc3339()));
    output.insert("completed_at".into(), json!(completed_at.to_rfc3339()));
    output
}

/// Builds the child's input from `parameters.input_mapping`, or passes the
/// step input through unchanged.
fn map_input(step: &StepConfig, input: &StepOutput, context: &ExecutionContext) -> Map<String, Value> {
    let Some(Value::Object(mapping)) = step.parameters.get("input_mapping") else {
        return input.clone();
    };

    mapping
        .iter()
        .filter_map(|(target, path)| {
            let path = path.as_str()?;
            selector::resolve(input, None, path)
                .or_else(|| selector::resolve(&context.step_io_data, context.trigger_raw(), path))
                .map(|value| (target.clone(), value.clone()))
        })
        .collect()
}

/// Folds child data back per `parameters.output_mapping`.
fn map_output(step: &StepConfig, child: &ExecutionContext) -> Value {
    let Some(Value::Object(mapping)) = step.parameters.get("output_mapping") else {
        return Value::Object(child.step_io_data.clone());
    };

    Value::Object(
        mapping
            .iter()
            .filter_map(|(target, path)| {
                let path = path.as_str()?;
                selector::resolve(&child.step_io_data, None, path)
                    .map(|value| (target.clone(), value.clone()))
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::{StepResult, UserContext};
    use crate::workflow::WorkflowConfig;
    use std::sync::Arc;

    fn parent(step: &StepConfig) -> ExecutionContext {
        let workflow = Arc::new(WorkflowConfig::from_steps(
            "parent",
            vec![StepConfig::new("fetch", "tool"), step.clone()],
        ));
        ExecutionContext::new("p", workflow, UserContext::new("u1"))
    }

    #[tokio::test]
    async fn test_missing_workflow_id_is_reported_in_output() {
        let step = StepConfig::new("sub", "subflow");
        let ctx = parent(&step);

        let output = SubflowStep.execute(&step, &StepOutput::new(), &ctx).await.unwrap();
        assert_eq!(output["success"], json!(false));
        assert_eq!(output["subflow_id"], Value::Null);
        assert!(output["error"].as_str().unwrap().contains("workflow_id"));
    }

    #[tokio::test]
    async fn test_detached_context_has_no_engine() {
        let step = StepConfig::new("sub", "subflow").with_parameter("workflow_id", json!("child"));
        let ctx = parent(&step);

        let err = SubflowStep
            .execute(&step, &StepOutput::new(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Subflow(SubflowError::EngineUnavailable)));
    }

    #[test]
    fn test_input_mapping_prefers_step_input() {
        let step = StepConfig::new("sub", "subflow").with_parameter(
            "input_mapping",
            json!({"query": "q", "title": "fetch.items.0.title", "user": "user.name", "gone": "nope.x"}),
        );
        let mut ctx = parent(&step);
        ctx.seed_trigger_payload(json!({"user": {"name": "ada"}}));
        ctx.complete_step(StepResult::success(
            "fetch",
            json!({"items": [{"title": "hello"}]}).as_object().cloned().unwrap(),
        ));

        let input = json!({"q": "rust"}).as_object().cloned().unwrap();
        let mapped = map_input(&step, &input, &ctx);
        assert_eq!(mapped["query"], json!("rust"));
        assert_eq!(mapped["title"], json!("hello"));
        assert_eq!(mapped["user"], json!("ada"));
        assert!(!mapped.contains_key("gone"));
    }

    #[test]
    fn test_output_mapping() {
        let step = StepConfig::new("sub", "subflow")
            .with_parameter("output_mapping", json!({"answer": "final.data.text"}));
        let child_workflow = Arc::new(WorkflowConfig::from_steps(
            "child",
            vec![StepConfig::new("final", "output")],
        ));
        let mut child = ExecutionContext::new("c", child_workflow, UserContext::default());
        child.complete_step(StepResult::success(
            "final",
            json!({"data": {"text": "42"}, "success": true}).as_object().cloned().unwrap(),
        ));

        assert_eq!(map_output(&step, &child), json!({"answer": "42"}));

        let unmapped = StepConfig::new("sub", "subflow");
        assert_eq!(map_output(&unmapped, &child)["final"]["data"]["text"], json!("42"));
    }

    #[test]
    fn test_subflow_does_not_hold_worker_slot() {
        assert!(!SubflowStep.uses_worker_slot());
    }
}
