//! Individual Step Execution
//!
//! Runs one dispatched step to a [`StepResult`]:
//! - Worker-slot acquisition from the engine-wide pool
//! - Timeout enforcement
//! - Retries with the step's backoff policy
//! - Classification of the returned output map
//!
//! Runs inside its own tokio task; the scheduling loop records the result.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::context::{ExecutionContext, StepResult};
use super::registry::{StepOutput, StepRegistry};
use crate::error::{RegistryError, StepError};
use crate::workflow::model::StepConfig;

/// Everything a step task needs, owned so it can move into `tokio::spawn`.
pub(crate) struct StepInvocation {
    pub step: StepConfig,
    pub input: StepOutput,
    /// Snapshot of the execution at the start of the wave
    pub context: Arc<ExecutionContext>,
    pub registry: Arc<StepRegistry>,
    pub workers: Arc<Semaphore>,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

/// Executes a single step, retrying retryable errors.
///
/// Never returns an error: every outcome is folded into the result's status.
pub(crate) async fn execute_step(invocation: StepInvocation) -> StepResult {
    let step_id = invocation.step.step_id.clone();
    let policy = invocation.step.retry.clone();
    let started_at = Utc::now();
    let mut retries = 0;

    loop {
        let outcome = attempt(&invocation).await;

        let mut result = match outcome {
            Ok(output) => classify_output(&step_id, output),
            Err(err) if err.is_retryable() && retries < policy.max_retries => {
                retries += 1;
                let delay = policy.delay_for(retries);
                warn!(
                    "Step '{}' attempt {} failed: {} (retrying in {:?})",
                    step_id, retries, err, delay
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = invocation.cancel.cancelled() => {
                        StepResult::cancelled(&step_id, format!("cancelled while retrying: {}", err))
                    }
                }
            }
            Err(err) => StepResult::failed(&step_id, err.to_string()),
        };

        result.started_at = started_at;
        result.retry_count = retries;
        debug!(
            "Step '{}' finished as {:?} after {} retries",
            step_id, result.status, retries
        );
        return result;
    }
}

/// One call to the step's executor under the worker pool and timeout.
async fn attempt(invocation: &StepInvocation) -> Result<StepOutput, StepError> {
    let StepInvocation {
        step,
        input,
        context,
        registry,
        workers,
        timeout,
        ..
    } = invocation;

    let executor = registry
        .get(&step.step_type)
        .map_err(|err| StepError::failed(err.to_string()))?;

    let _permit = if executor.uses_worker_slot() {
        let permit = Arc::clone(workers)
            .acquire_owned()
            .await
            .map_err(|_| StepError::failed("worker pool closed"))?;
        Some(permit)
    } else {
        None
    };

    let call = registry.execute_step(&step.step_type, step, input, context);
    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(*limit, call)
            .await
            .map_err(|_| StepError::Timeout)?,
        None => call.await,
    };

    outcome.map_err(|err| match err {
        RegistryError::StepExecution { cause, .. } => cause,
        other => StepError::failed(other.to_string()),
    })
}

/// Maps an executor's output to a result.
///
/// `awaiting_input: true` suspends; `success: false` fails with the output's
/// `error` field. The output is kept in both cases.
pub(crate) fn classify_output(step_id: &str, output: StepOutput) -> StepResult {
    if output.get("awaiting_input").and_then(Value::as_bool) == Some(true) {
        return StepResult::awaiting_input(step_id, output);
    }

    if output.get("success").and_then(Value::as_bool) == Some(false) {
        let error = match output.get("error") {
            Some(Value::String(message)) => message.clone(),
            Some(Value::Null) | None => "step reported failure".to_string(),
            Some(other) => other.to_string(),
        };
        let mut result = StepResult::failed(step_id, error);
        result.output_data = output;
        return result;
    }

    StepResult::success(step_id, output)
}
