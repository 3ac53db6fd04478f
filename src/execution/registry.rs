//! Step Registry
//!
//! Maps a step-type tag to the executor that implements it. The engine
//! only ever dispatches through [`StepRegistry::execute_step`], so new step
//! kinds are added by registration rather than by touching the engine.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde_json::{Map, Value};

use super::context::ExecutionContext;
use crate::error::{RegistryError, StepError};
use crate::steps;
use crate::workflow::model::{step_types, StepConfig};

/// Opaque key/value map passed into and returned from steps.
pub type StepOutput = Map<String, Value>;

/// Capability implemented by every step kind.
///
/// The context is a snapshot taken when the step's wave started.
/// Returning `awaiting_input: true` suspends the execution; returning
/// `success: false` records a failure with the output's `error` field.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        step: &StepConfig,
        input: &StepOutput,
        context: &ExecutionContext,
    ) -> Result<StepOutput, StepError>;

    /// Whether a call holds one of the engine's worker slots.
    ///
    /// Steps that only wait on nested executions return false so nested
    /// steps can never be starved by their own parents.
    fn uses_worker_slot(&self) -> bool {
        true
    }
}

/// Adapts an async closure over `(step, input)` into a [`StepExecutor`].
pub struct FnStep<F> {
    func: F,
}

/// Wraps a closure as a step executor.
///
/// # Example
///
/// ```
/// use flowrunner::execution::{step_fn, StepOutput, StepRegistry};
/// use serde_json::json;
///
/// let mut registry = StepRegistry::with_builtins();
/// registry
///     .register("uppercase", step_fn(|_step, input: StepOutput| async move {
///         let text = input.get("text").and_then(|v| v.as_str()).unwrap_or_default();
///         let mut out = StepOutput::new();
///         out.insert("text".into(), json!(text.to_uppercase()));
///         Ok(out)
///     }))
///     .unwrap();
/// ```
pub fn step_fn<F, Fut>(func: F) -> FnStep<F>
where
    F: Fn(StepConfig, StepOutput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, StepError>> + Send,
{
    FnStep { func }
}

#[async_trait]
impl<F, Fut> StepExecutor for FnStep<F>
where
    F: Fn(StepConfig, StepOutput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, StepError>> + Send,
{
    async fn execute(
        &self,
        step: &StepConfig,
        input: &StepOutput,
        _context: &ExecutionContext,
    ) -> Result<StepOutput, StepError> {
        (self.func)(step.clone(), input.clone()).await
    }
}

/// Registry of step executors by step type.
#[derive(Default)]
pub struct StepRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in step kinds registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.insert(step_types::INPUT, Arc::new(steps::InputStep));
        registry.insert(step_types::OUTPUT, Arc::new(steps::OutputStep));
        registry.insert(step_types::TRIGGER, Arc::new(steps::TriggerStep));
        registry.insert(step_types::MERGE, Arc::new(steps::MergeStep));
        registry.insert(step_types::SUBFLOW, Arc::new(steps::SubflowStep));
        registry.insert(step_types::HUMAN_APPROVAL, Arc::new(steps::HumanApprovalStep));
        registry
    }

    fn insert(&mut self, step_type: &str, executor: Arc<dyn StepExecutor>) -> Option<Arc<dyn StepExecutor>> {
        self.executors.insert(step_type.to_string(), executor)
    }

    /// Binds a step type to an executor.
    ///
    /// Fails with [`RegistryError::DuplicateStepType`] if the type is taken.
    pub fn register(
        &mut self,
        step_type: impl Into<String>,
        executor: impl StepExecutor + 'static,
    ) -> Result<(), RegistryError> {
        let step_type = step_type.into();
        if self.executors.contains_key(&step_type) {
            return Err(RegistryError::DuplicateStepType(step_type));
        }
        debug!("Registered step type '{}'", step_type);
        self.executors.insert(step_type, Arc::new(executor));
        Ok(())
    }

    /// Binds a step type, replacing any existing executor.
    pub fn register_override(
        &mut self,
        step_type: impl Into<String>,
        executor: impl StepExecutor + 'static,
    ) -> Option<Arc<dyn StepExecutor>> {
        let step_type = step_type.into();
        debug!("Registered step type '{}' (override)", step_type);
        self.executors.insert(step_type, Arc::new(executor))
    }

    /// Removes a binding. Returns true if one existed.
    pub fn unregister(&mut self, step_type: &str) -> bool {
        self.executors.remove(step_type).is_some()
    }

    /// Returns the executor bound to `step_type`.
    pub fn get(&self, step_type: &str) -> Result<Arc<dyn StepExecutor>, RegistryError> {
        self.executors
            .get(step_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownStepType(step_type.to_string()))
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.executors.contains_key(step_type)
    }

    /// Registered step types, sorted.
    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Looks up and invokes the executor for `step_type`.
    ///
    /// Executor errors come back wrapped as [`RegistryError::StepExecution`].
    pub async fn execute_step(
        &self,
        step_type: &str,
        step: &StepConfig,
        input: &StepOutput,
        context: &ExecutionContext,
    ) -> Result<StepOutput, RegistryError> {
        let executor = self.get(step_type)?;
        executor
            .execute(step, input, context)
            .await
            .map_err(|cause| RegistryError::StepExecution {
                step_id: step.step_id.clone(),
                cause,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::UserContext;
    use crate::workflow::WorkflowConfig;
    use serde_json::json;

    fn context() -> ExecutionContext {
        let workflow = Arc::new(WorkflowConfig::from_steps(
            "wf",
            vec![StepConfig::new("s", "echo")],
        ));
        ExecutionContext::new("exec", workflow, UserContext::default())
    }

    fn echo() -> impl StepExecutor {
        step_fn(|_step, input: StepOutput| async move { Ok(input) })
    }

    #[test]
    fn test_builtins_registered() {
        let registry = StepRegistry::with_builtins();
        assert_eq!(
            registry.step_types(),
            vec!["human_approval", "input", "merge", "output", "subflow", "trigger"]
        );
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = StepRegistry::new();
        registry.register("echo", echo()).unwrap();
        assert!(matches!(
            registry.register("echo", echo()),
            Err(RegistryError::DuplicateStepType(t)) if t == "echo"
        ));
        assert!(registry.register_override("echo", echo()).is_some());
    }

    #[test]
    fn test_unknown_step_type() {
        let registry = StepRegistry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(RegistryError::UnknownStepType(t)) if t == "nope"
        ));
    }

    #[test]
    fn test_unregister() {
        let mut registry = StepRegistry::new();
        registry.register("echo", echo()).unwrap();
        assert!(registry.unregister("echo"));
        assert!(!registry.contains("echo"));
        assert!(!registry.unregister("echo"));
    }

    #[tokio::test]
    async fn test_execute_step_passes_input() {
        let mut registry = StepRegistry::new();
        registry.register("echo", echo()).unwrap();
        let ctx = context();
        let step = StepConfig::new("s", "echo");
        let mut input = StepOutput::new();
        input.insert("x".into(), json!(1));

        let output = registry.execute_step("echo", &step, &input, &ctx).await.unwrap();
        assert_eq!(output.get("x"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_execute_step_wraps_errors() {
        let mut registry = StepRegistry::new();
        registry
            .register(
                "boom",
                step_fn(|_step, _input| async { Err(StepError::failed("kaput")) }),
            )
            .unwrap();
        let ctx = context();
        let step = StepConfig::new("s", "boom");

        let err = registry
            .execute_step("boom", &step, &StepOutput::new(), &ctx)
            .await
            .unwrap_err();
        match err {
            RegistryError::StepExecution { step_id, cause } => {
                assert_eq!(step_id, "s");
                assert_eq!(cause.to_string(), "kaput");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
