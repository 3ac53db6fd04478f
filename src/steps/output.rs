//! Output step: a labelled terminal node.
//!
//! Always returns exactly `{"data": ..., "success": true}`. Parameters such
//! as `label` or `format` are display hints and never change the output.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::error::StepError;
use crate::execution::context::ExecutionContext;
use crate::execution::registry::{StepExecutor, StepOutput};
use crate::workflow::model::StepConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct OutputStep;

#[async_trait]
impl StepExecutor for OutputStep {
    async fn execute(
        &self,
        step: &StepConfig,
        input: &StepOutput,
        context: &ExecutionContext,
    ) -> Result<StepOutput, StepError> {
        let data = if !input.is_empty() {
            Value::Object(input.clone())
        } else {
            collect_dependencies(step, context)
        };

        let mut output = StepOutput::new();
        output.insert("data".into(), data);
        output.insert("success".into(), json!(true));
        Ok(output)
    }
}

/// One dependency forwards its data; several are nested by step ID.
fn collect_dependencies(step: &StepConfig, context: &ExecutionContext) -> Value {
    match step.dependencies.as_slice() {
        [] => Value::Object(Map::new()),
        [only] => context.staged_data(only).cloned().unwrap_or(Value::Null),
        many => Value::Object(
            many.iter()
                .filter_map(|dep| {
                    context
                        .staged_data(dep)
                        .map(|data| (dep.clone(), data.clone()))
                })
                .collect(),
        ),
    }
}
