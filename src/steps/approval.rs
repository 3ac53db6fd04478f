//! Human approval step.
//!
//! Suspends the execution and publishes where the approver's decision is
//! expected. The decision itself arrives through
//! [`WorkflowEngine::resume`](crate::execution::WorkflowEngine::resume),
//! typically `{"approved": true, "comment": "..."}`.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::StepError;
use crate::execution::context::ExecutionContext;
use crate::execution::messaging::make_decision_topic;
use crate::execution::registry::{StepExecutor, StepOutput};
use crate::workflow::model::StepConfig;

const DEFAULT_PROMPT: &str = "Approval required";

#[derive(Debug, Clone, Copy, Default)]
pub struct HumanApprovalStep;

#[async_trait]
impl StepExecutor for HumanApprovalStep {
    async fn execute(
        &self,
        step: &StepConfig,
        _input: &StepOutput,
        context: &ExecutionContext,
    ) -> Result<StepOutput, StepError> {
        let prompt = step.parameter_str("prompt").unwrap_or(DEFAULT_PROMPT);
        let topic = make_decision_topic(&context.execution_id, &step.step_id, None);

        let mut output = StepOutput::new();
        output.insert("awaiting_input".into(), json!(true));
        output.insert("step_id".into(), json!(step.step_id));
        output.insert("prompt".into(), json!(prompt));
        output.insert(
            "approver_role".into(),
            step.parameters.get("approver_role").cloned().unwrap_or(Value::Null),
        );
        output.insert(
            "require_comment".into(),
            json!(step.parameter_bool("require_comment", false)),
        );
        output.insert(
            "timeout_seconds".into(),
            step.parameters.get("timeout_seconds").cloned().unwrap_or(Value::Null),
        );
        output.insert("decision_topic".into(), json!(topic));
        Ok(output)
    }
}
