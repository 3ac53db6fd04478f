//! Input step: surfaces the payload staged for an entry point.
//!
//! Resolution order is the step's own staged value, then the whole trigger
//! payload. With neither, the step reports `awaiting_input` so a
//! multi-entry workflow can wait for data to be delivered on resume.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::StepError;
use crate::execution::context::ExecutionContext;
use crate::execution::registry::{StepExecutor, StepOutput};
use crate::workflow::model::StepConfig;

const DEFAULT_KIND: &str = "manual";

#[derive(Debug, Clone, Copy, Default)]
pub struct InputStep;

#[async_trait]
impl StepExecutor for InputStep {
    async fn execute(
        &self,
        step: &StepConfig,
        _input: &StepOutput,
        context: &ExecutionContext,
    ) -> Result<StepOutput, StepError> {
        let kind = step.parameter_str("kind").unwrap_or(DEFAULT_KIND);

        let (data, source) = match context.staged_data(&step.step_id) {
            Some(staged) if !staged.is_null() => (staged.clone(), "direct"),
            _ => match context.trigger_raw() {
                Some(raw) => (raw.clone(), "trigger_raw"),
                None => (Value::Object(Default::default()), "none"),
            },
        };

        let mut output = StepOutput::new();
        output.insert("kind".into(), json!(kind));
        output.insert("step_id".into(), json!(step.step_id));
        output.insert("data".into(), data);
        output.insert("source".into(), json!(source));
        if source == "none" {
            output.insert("awaiting_input".into(), json!(true));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::UserContext;
    use crate::workflow::WorkflowConfig;
    use std::sync::Arc;

    fn context(steps: Vec<StepConfig>) -> ExecutionContext {
        let workflow = Arc::new(WorkflowConfig::from_steps("wf", steps));
        ExecutionContext::new("e", workflow, UserContext::default())
    }

    #[tokio::test]
    async fn test_direct_staged_value() {
        let step = StepConfig::new("a", "input").with_parameter("kind", json!("form"));
        let mut ctx = context(vec![step.clone(), StepConfig::new("b", "input")]);
        ctx.seed_trigger_payload(json!({"a": {"name": "ada"}}));

        let output = InputStep.execute(&step, &StepOutput::new(), &ctx).await.unwrap();
        assert_eq!(output["source"], json!("direct"));
        assert_eq!(output["kind"], json!("form"));
        assert_eq!(output["data"], json!({"name": "ada"}));
        assert!(!output.contains_key("awaiting_input"));
    }

    #[tokio::test]
    async fn test_falls_back_to_trigger_raw() {
        let step = StepConfig::new("a", "input");
        let mut ctx = context(vec![step.clone(), StepConfig::new("b", "input")]);
        ctx.seed_trigger_payload(json!({"unrelated": 1}));

        let output = InputStep.execute(&step, &StepOutput::new(), &ctx).await.unwrap();
        assert_eq!(output["source"], json!("trigger_raw"));
        assert_eq!(output["data"], json!({"unrelated": 1}));
        assert_eq!(output["kind"], json!("manual"));
    }

    #[tokio::test]
    async fn test_no_data_awaits_input() {
        let step = StepConfig::new("a", "input");
        let ctx = context(vec![step.clone()]);

        let output = InputStep.execute(&step, &StepOutput::new(), &ctx).await.unwrap();
        assert_eq!(output["source"], json!("none"));
        assert_eq!(output["data"], json!({}));
        assert_eq!(output["awaiting_input"], json!(true));
    }
}
