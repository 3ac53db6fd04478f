//! Merge step: fan-in of dependency outputs.
//!
//! Gating (`parameters.mode`: `wait_all` or `first_available`) is applied by
//! the planner before the step runs. This executor only packages whatever
//! dependencies have succeeded, per `parameters.combine_mode`:
//!
//! - `first`: the earliest completed dependency, with `source_step`
//! - `array`: outputs in declaration order, with `sources`
//! - `object` (default): outputs keyed by step ID, with `sources`
//!
//! "Earliest" means the lowest wave; dependencies completed in the same wave
//! are ordered by declaration.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::error::StepError;
use crate::execution::context::{ExecutionContext, StepResult};
use crate::execution::registry::{StepExecutor, StepOutput};
use crate::workflow::model::{CombineMode, StepConfig};

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeStep;

#[async_trait]
impl StepExecutor for MergeStep {
    async fn execute(
        &self,
        step: &StepConfig,
        _input: &StepOutput,
        context: &ExecutionContext,
    ) -> Result<StepOutput, StepError> {
        Ok(merge(step, context))
    }
}

/// Combines the successful dependency results visible in `context`.
pub fn merge(step: &StepConfig, context: &ExecutionContext) -> StepOutput {
    let completed: Vec<&StepResult> = step
        .dependencies
        .iter()
        .filter_map(|dep| context.get_step_result(dep))
        .filter(|result| result.is_success())
        .collect();

    let combine_mode = step.combine_mode();
    let mut output = StepOutput::new();

    match combine_mode {
        CombineMode::First => {
            // min_by_key keeps the first of equal keys, i.e. declaration order
            let first = completed.iter().min_by_key(|result| result.wave);
            output.insert(
                "data".into(),
                first
                    .map(|result| Value::Object(result.output_data.clone()))
                    .unwrap_or(Value::Null),
            );
            output.insert(
                "source_step".into(),
                first
                    .map(|result| Value::String(result.step_id.clone()))
                    .unwrap_or(Value::Null),
            );
        }
        CombineMode::Array => {
            let data: Vec<Value> = completed
                .iter()
                .map(|result| Value::Object(result.output_data.clone()))
                .collect();
            output.insert("data".into(), Value::Array(data));
            output.insert("sources".into(), sources(&completed));
        }
        CombineMode::Object => {
            let data: Map<String, Value> = completed
                .iter()
                .map(|result| {
                    (
                        result.step_id.clone(),
                        Value::Object(result.output_data.clone()),
                    )
                })
                .collect();
            output.insert("data".into(), Value::Object(data));
            output.insert("sources".into(), sources(&completed));
        }
    }

    output.insert("mode".into(), json!(step.gating_mode().as_str()));
    output.insert("combine_mode".into(), json!(combine_mode.as_str()));
    output.insert("completed_count".into(), json!(completed.len()));
    output.insert("total_dependencies".into(), json!(step.dependencies.len()));
    output
}

fn sources(completed: &[&StepResult]) -> Value {
    Value::Array(
        completed
            .iter()
            .map(|result| Value::String(result.step_id.clone()))
            .collect(),
    )
}
