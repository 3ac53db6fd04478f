//! Workflow Execution Engine
//!
//! The core engine that orchestrates workflow execution including:
//! - Wave-based scheduling with dependency gating
//! - Concurrent step dispatch over an engine-wide worker pool
//! - Pause/resume for steps awaiting an external decision
//! - Cooperative cancellation between waves
//! - State persistence after every wave for crash recovery
//!
//! # Ownership
//!
//! Each execution's [`ExecutionContext`] sits behind its own async mutex.
//! Whoever holds the lock owns the scheduling loop: `execute`, `resume`
//! and `recover` for the same execution serialize on it, while different
//! executions proceed independently.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use chrono::Utc;
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::{
    ExecutionContext, ExecutionStatus, ExecutionSummary, StepResult, StepStatus, UserContext,
    SUBFLOW_INPUT_KEY,
};
use super::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use super::messaging::{is_valid_execution_id, make_decision_topic, DecisionTopic};
use super::registry::StepRegistry;
use super::step::{execute_step, StepInvocation};
use crate::config::EngineConfig;
use crate::error::{EngineError, RegistryError, StoreError};
use crate::monitoring::EventType;
use crate::workflow::model::{StepConfig, WorkflowConfig};
use crate::workflow::parser::normalize_workflow;
use crate::workflow::planner::ExecutionPlanner;
use crate::workflow::state::{ExecutionStore, MemoryStore};
use crate::workflow::validator::validate_workflow;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-execution bookkeeping held by the engine.
struct ExecutionSlot {
    context: Arc<AsyncMutex<ExecutionContext>>,
    cancel: CancellationToken,
    /// Last published summary, readable without waiting on the loop
    latest: Mutex<ExecutionSummary>,
}

impl ExecutionSlot {
    fn new(context: ExecutionContext) -> Self {
        let summary = context.summary();
        Self {
            context: Arc::new(AsyncMutex::new(context)),
            cancel: CancellationToken::new(),
            latest: Mutex::new(summary),
        }
    }

    fn publish(&self, summary: ExecutionSummary) {
        *lock(&self.latest) = summary;
    }

    fn latest(&self) -> ExecutionSummary {
        lock(&self.latest).clone()
    }
}

struct EngineInner {
    registry: Arc<StepRegistry>,
    config: EngineConfig,
    store: Arc<dyn ExecutionStore>,
    notifier: Arc<dyn ExecutionNotifier>,
    workers: Arc<Semaphore>,
    executions: Mutex<HashMap<String, Arc<ExecutionSlot>>>,
    /// Finished executions, oldest first
    history: Mutex<VecDeque<String>>,
    catalog: RwLock<HashMap<String, Arc<WorkflowConfig>>>,
}

/// Non-owning reference to an engine, stored in execution contexts.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Weak<EngineInner>,
}

impl EngineHandle {
    pub fn upgrade(&self) -> Option<WorkflowEngine> {
        self.inner.upgrade().map(|inner| WorkflowEngine { inner })
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// Status distribution and a page of execution summaries.
#[derive(Serialize, Debug, Clone)]
pub struct ExecutionAnalytics {
    pub total_executions: usize,
    pub status_distribution: BTreeMap<String, usize>,
    /// Executions matching the status filter
    pub matching: usize,
    /// Newest first
    pub executions: Vec<ExecutionSummary>,
}

/// Builder for [`WorkflowEngine`].
pub struct EngineBuilder {
    registry: StepRegistry,
    config: EngineConfig,
    store: Arc<dyn ExecutionStore>,
    notifier: Arc<dyn ExecutionNotifier>,
}

impl EngineBuilder {
    pub fn registry(mut self, registry: StepRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: impl ExecutionStore + 'static) -> Self {
        self.store = Arc::new(store);
        self
    }

    pub fn shared_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn notifier(mut self, notifier: impl ExecutionNotifier + 'static) -> Self {
        self.notifier = Arc::new(notifier);
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let workers = Arc::new(Semaphore::new(self.config.max_concurrent_steps.max(1)));
        WorkflowEngine {
            inner: Arc::new(EngineInner {
                registry: Arc::new(self.registry),
                config: self.config,
                store: self.store,
                notifier: self.notifier,
                workers,
                executions: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                catalog: RwLock::new(HashMap::new()),
            }),
        }
    }
}

/// Workflow execution engine.
///
/// Cheap to clone; clones share executions, registry, store and workers.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::execution::{UserContext, WorkflowEngine};
/// use flowrunner::load_workflow;
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("pipeline.yaml")?;
///     let engine = WorkflowEngine::builder().build();
///
///     let summary = engine
///         .execute(workflow, None, json!({"kind": "webhook"}), UserContext::default(), true)
///         .await?;
///     println!("{}", summary.status);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Starts a builder with built-in steps, default config and a memory store.
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            registry: StepRegistry::with_builtins(),
            config: EngineConfig::default(),
            store: Arc::new(MemoryStore::new()),
            notifier: Arc::new(NoopNotifier),
        }
    }

    /// Creates an engine over `registry` with default settings.
    pub fn new(registry: StepRegistry) -> Self {
        Self::builder().registry(registry).build()
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Adds a workflow to the catalog used by subflow steps.
    ///
    /// The workflow is normalized and validated first; an existing entry
    /// with the same ID is replaced.
    pub fn register_workflow(
        &self,
        mut workflow: WorkflowConfig,
    ) -> Result<Arc<WorkflowConfig>, EngineError> {
        normalize_workflow(&mut workflow);
        self.check_workflow(&workflow)?;

        let workflow = Arc::new(workflow);
        self.inner
            .catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(workflow.workflow_id.clone(), Arc::clone(&workflow));
        info!("Registered workflow '{}'", workflow.workflow_id);
        Ok(workflow)
    }

    /// Looks up a catalog entry.
    pub fn workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowConfig>> {
        self.inner
            .catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .cloned()
    }

    /// Rejects invalid graphs and unregistered step types.
    fn check_workflow(&self, workflow: &WorkflowConfig) -> Result<(), EngineError> {
        validate_workflow(workflow)?;
        if let Some(step) = workflow
            .steps
            .iter()
            .find(|step| !self.inner.registry.contains(&step.step_type))
        {
            return Err(RegistryError::UnknownStepType(step.step_type.clone()).into());
        }
        Ok(())
    }

    /// Runs a workflow.
    ///
    /// The graph is validated before anything is dispatched. A caller-supplied
    /// `execution_id` must not contain `:`, which delimits decision topics;
    /// when omitted a UUID is generated. With `wait`
    /// the call returns once the execution is terminal or paused; without
    /// it, once the execution is registered and its loop spawned.
    pub async fn execute(
        &self,
        mut workflow: WorkflowConfig,
        execution_id: Option<String>,
        trigger_payload: Value,
        user_context: UserContext,
        wait: bool,
    ) -> Result<ExecutionSummary, EngineError> {
        normalize_workflow(&mut workflow);
        self.check_workflow(&workflow)?;

        let execution_id = execution_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if !is_valid_execution_id(&execution_id) {
            return Err(EngineError::InvalidExecutionId(execution_id));
        }

        let mut context = ExecutionContext::new(execution_id, Arc::new(workflow), user_context);
        context.seed_trigger_payload(trigger_payload);
        self.launch(context, wait).await
    }

    /// Runs `workflow` as a child of `parent` and returns the child's final
    /// context. Used by subflow steps.
    pub async fn execute_child(
        &self,
        workflow: Arc<WorkflowConfig>,
        parent: &ExecutionContext,
        input: Value,
    ) -> Result<ExecutionContext, EngineError> {
        self.check_workflow(&workflow)?;

        let mut context = ExecutionContext::new(
            Uuid::new_v4().to_string(),
            workflow,
            parent.user_context.clone(),
        );
        context.parent_execution_id = Some(parent.execution_id.clone());
        context.depth = parent.depth + 1;
        context.seed_trigger_payload(input.clone());
        context
            .step_io_data
            .insert(SUBFLOW_INPUT_KEY.to_string(), input);

        let execution_id = context.execution_id.clone();
        self.launch(context, true).await?;
        self.get_execution(&execution_id).await
    }

    async fn launch(
        &self,
        mut context: ExecutionContext,
        wait: bool,
    ) -> Result<ExecutionSummary, EngineError> {
        let execution_id = context.execution_id.clone();
        context.workflow_engine = Some(self.handle());
        context.started_at = Some(Utc::now());
        context.transition(ExecutionStatus::Running);

        let slot = Arc::new(ExecutionSlot::new(context));
        {
            let mut executions = lock(&self.inner.executions);
            if executions.contains_key(&execution_id) {
                return Err(EngineError::DuplicateExecution(execution_id));
            }
            executions.insert(execution_id.clone(), Arc::clone(&slot));
        }

        let guard = Arc::clone(&slot.context).lock_owned().await;
        info!(
            "Starting execution '{}' of workflow '{}' ({} steps)",
            execution_id,
            guard.workflow_id,
            guard.workflow.steps.len()
        );
        self.notify(ExecutionEvent::WorkflowStarted {
            execution_id: execution_id.clone(),
            workflow_id: guard.workflow_id.clone(),
        });
        self.persist(&guard).await;

        Ok(self.run_or_spawn(guard, slot, wait).await)
    }

    async fn run_or_spawn(
        &self,
        guard: OwnedMutexGuard<ExecutionContext>,
        slot: Arc<ExecutionSlot>,
        wait: bool,
    ) -> ExecutionSummary {
        if wait {
            return self.drive(guard, slot).await;
        }

        let summary = guard.summary();
        let engine = self.clone();
        tokio::spawn(async move {
            engine.drive(guard, slot).await;
        });
        summary
    }

    /// The scheduling loop. Runs waves until the execution leaves `running`.
    async fn drive(
        &self,
        mut guard: OwnedMutexGuard<ExecutionContext>,
        slot: Arc<ExecutionSlot>,
    ) -> ExecutionSummary {
        let context = &mut *guard;
        while self.run_wave(context, &slot).await {}

        self.persist(context).await;
        let summary = context.summary();
        slot.publish(summary.clone());

        info!(
            "Execution '{}' is {} after {} waves",
            summary.execution_id, summary.status, summary.waves
        );
        if summary.status.is_terminal() {
            self.archive(&summary.execution_id);
        }
        summary
    }

    /// One scheduling tick. Returns false once the execution stopped running.
    async fn run_wave(&self, context: &mut ExecutionContext, slot: &ExecutionSlot) -> bool {
        if slot.cancel.is_cancelled() {
            self.mark_cancelled(context);
            return false;
        }

        let workflow = Arc::clone(&context.workflow);
        let (ready, pending) = {
            let planner = ExecutionPlanner::new(
                &workflow,
                &context.completed_steps,
                &context.awaiting_steps,
                self.inner.config.max_wave_width,
            );
            let ready: Vec<StepConfig> = planner.get_ready_steps().into_iter().cloned().collect();
            let pending: Vec<String> = planner
                .pending_steps()
                .into_iter()
                .map(str::to_string)
                .collect();
            (ready, pending)
        };

        if ready.is_empty() {
            if !context.awaiting_steps.is_empty() {
                self.mark_paused(context);
            } else if !pending.is_empty() {
                let message = format!("Workflow stalled: no runnable steps among {:?}", pending);
                error!("Execution '{}': {}", context.execution_id, message);
                self.mark_failed(context, message);
            } else {
                info!("Execution '{}' completed", context.execution_id);
                context.transition(ExecutionStatus::Completed);
                self.notify(ExecutionEvent::WorkflowCompleted {
                    execution_id: context.execution_id.clone(),
                });
            }
            return false;
        }

        context.waves += 1;
        let wave = context.waves;

        let mut dispatch = Vec::with_capacity(ready.len());
        for step in ready {
            let runnable = step.condition.as_ref().map_or(true, |condition| {
                condition.evaluate(&context.step_io_data, context.trigger_raw())
            });
            if runnable {
                dispatch.push(step);
                continue;
            }

            info!("Step '{}' skipped: condition not met", step.step_id);
            let mut result = StepResult::skipped(&step.step_id);
            result.wave = wave;
            context.complete_step(result);
            self.notify(ExecutionEvent::StepSkipped {
                execution_id: context.execution_id.clone(),
                step_id: step.step_id.clone(),
            });
        }

        if !dispatch.is_empty() {
            debug!(
                "Execution '{}' wave {}: {:?}",
                context.execution_id,
                wave,
                dispatch.iter().map(|s| s.step_id.as_str()).collect::<Vec<_>>()
            );
            if !self.dispatch_wave(context, slot, dispatch, wave).await {
                return false;
            }
        }

        if slot.cancel.is_cancelled() {
            self.mark_cancelled(context);
            return false;
        }
        if !context.awaiting_steps.is_empty() {
            self.mark_paused(context);
            return false;
        }

        self.persist(context).await;
        slot.publish(context.summary());
        true
    }

    /// Runs `steps` concurrently and records every result.
    ///
    /// Returns false if a non-optional step failed. Failures in a wave that
    /// was cancelled are recorded but left for the caller to end as cancelled.
    async fn dispatch_wave(
        &self,
        context: &mut ExecutionContext,
        slot: &ExecutionSlot,
        steps: Vec<StepConfig>,
        wave: u64,
    ) -> bool {
        let snapshot = Arc::new(context.clone());
        let mut handles = Vec::with_capacity(steps.len());

        for step in &steps {
            context
                .timeline
                .add_event(step.step_id.clone(), EventType::Started);
            self.notify(ExecutionEvent::StepStarted {
                execution_id: context.execution_id.clone(),
                step_id: step.step_id.clone(),
            });

            let invocation = StepInvocation {
                step: step.clone(),
                input: context.step_input(step),
                context: Arc::clone(&snapshot),
                registry: Arc::clone(&self.inner.registry),
                workers: Arc::clone(&self.inner.workers),
                timeout: self.inner.config.timeout_for(&step.step_type, step.timeout()),
                cancel: slot.cancel.clone(),
            };
            handles.push(tokio::spawn(execute_step(invocation)));
        }

        let results = join_all(handles).await;
        let cancelled = slot.cancel.is_cancelled();

        let mut fatal: Option<(String, String)> = None;
        for (step, joined) in steps.iter().zip(results) {
            let mut result = joined.unwrap_or_else(|err| {
                error!("Step '{}' task aborted: {}", step.step_id, err);
                StepResult::failed(&step.step_id, format!("step task aborted: {}", err))
            });
            result.wave = wave;

            match result.status {
                StepStatus::Success | StepStatus::Skipped => {
                    self.notify(ExecutionEvent::StepCompleted {
                        execution_id: context.execution_id.clone(),
                        step_id: step.step_id.clone(),
                        output: Value::Object(result.output_data.clone()),
                    });
                    context.complete_step(result);
                }
                StepStatus::Failed => {
                    let error = result
                        .error
                        .clone()
                        .unwrap_or_else(|| "step failed".to_string());
                    self.notify(ExecutionEvent::StepFailed {
                        execution_id: context.execution_id.clone(),
                        step_id: step.step_id.clone(),
                        error: error.clone(),
                        optional: step.optional,
                    });

                    if step.optional {
                        warn!("Optional step '{}' failed: {}", step.step_id, error);
                        context.complete_step(result);
                    } else if cancelled {
                        info!(
                            "Step '{}' failed after cancellation was requested: {}",
                            step.step_id, error
                        );
                        context.record_failure(result);
                    } else {
                        error!("Step '{}' failed: {}", step.step_id, error);
                        context.record_failure(result);
                        if fatal.is_none() {
                            fatal = Some((step.step_id.clone(), error));
                        }
                    }
                }
                StepStatus::Cancelled => {
                    let error = result
                        .error
                        .clone()
                        .unwrap_or_else(|| "cancelled".to_string());
                    info!("Step '{}' interrupted: {}", step.step_id, error);
                    self.notify(ExecutionEvent::StepFailed {
                        execution_id: context.execution_id.clone(),
                        step_id: step.step_id.clone(),
                        error,
                        optional: step.optional,
                    });
                    context.record_failure(result);
                }
                StepStatus::AwaitingInput => {
                    let topic = make_decision_topic(&context.execution_id, &step.step_id, None);
                    result
                        .output_data
                        .entry("decision_topic")
                        .or_insert_with(|| Value::String(topic.clone()));
                    info!("Step '{}' awaiting input on '{}'", step.step_id, topic);
                    self.notify(ExecutionEvent::StepAwaitingInput {
                        execution_id: context.execution_id.clone(),
                        step_id: step.step_id.clone(),
                        topic,
                    });
                    context.mark_awaiting(result);
                }
            }
        }

        // A cancelled wave is finished by the caller as Cancelled, never Failed.
        match fatal.filter(|_| !cancelled) {
            Some((step_id, error)) => {
                self.mark_failed(
                    context,
                    format!("Critical step '{}' failed: {}", step_id, error),
                );
                false
            }
            None => true,
        }
    }

    fn mark_paused(&self, context: &mut ExecutionContext) {
        context.transition(ExecutionStatus::Paused);
        let awaiting_steps: Vec<String> = context.awaiting_steps.iter().cloned().collect();
        info!(
            "Execution '{}' paused awaiting input on {:?}",
            context.execution_id, awaiting_steps
        );
        self.notify(ExecutionEvent::WorkflowPaused {
            execution_id: context.execution_id.clone(),
            awaiting_steps,
        });
    }

    fn mark_failed(&self, context: &mut ExecutionContext, message: String) {
        context.fail(message.clone());
        self.notify(ExecutionEvent::WorkflowFailed {
            execution_id: context.execution_id.clone(),
            error: message,
        });
    }

    fn mark_cancelled(&self, context: &mut ExecutionContext) {
        info!("Execution '{}' cancelled", context.execution_id);
        context.transition(ExecutionStatus::Cancelled);
        self.notify(ExecutionEvent::WorkflowCancelled {
            execution_id: context.execution_id.clone(),
        });
    }

    /// Injects a decision for a paused step and continues the execution in
    /// the background. Returns whether the resume was accepted.
    pub async fn resume(&self, execution_id: &str, step_id: &str, decision_output: Value) -> bool {
        match self
            .try_resume(execution_id, step_id, decision_output, false)
            .await
        {
            Ok(_) => true,
            Err(err) => {
                warn!("Resume of '{}' rejected: {}", execution_id, err);
                false
            }
        }
    }

    /// Like [`resume`](Self::resume) but reports why a resume was rejected.
    ///
    /// Executions not in memory are loaded from the store. A rejected
    /// resume leaves the execution untouched.
    pub async fn try_resume(
        &self,
        execution_id: &str,
        step_id: &str,
        decision_output: Value,
        wait: bool,
    ) -> Result<ExecutionSummary, EngineError> {
        let slot = self.find_slot(execution_id).await?;
        let mut guard = Arc::clone(&slot.context).lock_owned().await;

        if guard.status != ExecutionStatus::Paused {
            return Err(EngineError::ExecutionNotPaused {
                execution_id: execution_id.to_string(),
                status: guard.status,
            });
        }
        if !guard.awaiting_steps.contains(step_id) {
            return Err(EngineError::UnknownPausedStep {
                execution_id: execution_id.to_string(),
                step_id: step_id.to_string(),
            });
        }

        let output = match decision_output {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("decision".to_string(), other);
                wrapped
            }
        };

        let mut result = StepResult::success(step_id, output);
        if let Some(previous) = guard.get_step_result(step_id) {
            result.started_at = previous.started_at;
            result.retry_count = previous.retry_count;
        }
        result.wave = guard.waves;
        guard.resume_step(result);
        guard.transition(ExecutionStatus::Running);

        info!("Resuming execution '{}' at step '{}'", execution_id, step_id);
        self.notify(ExecutionEvent::WorkflowResumed {
            execution_id: execution_id.to_string(),
            step_id: step_id.to_string(),
        });
        self.persist(&guard).await;
        slot.publish(guard.summary());

        Ok(self.run_or_spawn(guard, slot, wait).await)
    }

    /// Resumes using a decision topic (`wf:{execution_id}:{step_id}:{suffix}`).
    pub async fn resume_topic(
        &self,
        topic: &str,
        decision_output: Value,
    ) -> Result<ExecutionSummary, EngineError> {
        let parsed =
            DecisionTopic::parse(topic).ok_or_else(|| EngineError::InvalidTopic(topic.to_string()))?;
        self.try_resume(&parsed.execution_id, &parsed.step_id, decision_output, false)
            .await
    }

    /// Continues an execution that was persisted while `running`, e.g.
    /// after a crash. Completed waves are not repeated.
    pub async fn recover(&self, execution_id: &str, wait: bool) -> Result<ExecutionSummary, EngineError> {
        let slot = self.find_slot(execution_id).await?;
        let guard = Arc::clone(&slot.context).lock_owned().await;
        if guard.status != ExecutionStatus::Running {
            return Ok(guard.summary());
        }

        info!(
            "Recovering execution '{}' after wave {}",
            execution_id, guard.waves
        );
        Ok(self.run_or_spawn(guard, slot, wait).await)
    }

    /// Requests cancellation. Returns false for unknown or finished executions.
    ///
    /// A running execution stops before its next wave; one that is paused
    /// or otherwise idle is cancelled immediately.
    pub async fn cancel(&self, execution_id: &str) -> bool {
        let Ok(slot) = self.find_slot(execution_id).await else {
            return false;
        };
        if slot.latest().status.is_terminal() {
            return false;
        }

        slot.cancel.cancel();
        if let Ok(mut context) = slot.context.try_lock() {
            if context.status.is_terminal() {
                return false;
            }
            self.mark_cancelled(&mut context);
            self.persist(&context).await;
            slot.publish(context.summary());
            drop(context);
            self.archive(execution_id);
        }
        true
    }

    /// Latest summary of an execution held in memory, without waiting.
    pub fn summary(&self, execution_id: &str) -> Option<ExecutionSummary> {
        self.slot(execution_id).map(|slot| slot.latest())
    }

    /// A copy of the execution's context.
    ///
    /// Waits for the current scheduling loop to release it; falls back to
    /// the store for executions no longer held in memory.
    pub async fn get_execution(&self, execution_id: &str) -> Result<ExecutionContext, EngineError> {
        if let Some(slot) = self.slot(execution_id) {
            return Ok(slot.context.lock().await.clone());
        }
        self.load(execution_id).await
    }

    /// Waits for a background scheduling loop and returns the summary.
    pub async fn wait(&self, execution_id: &str) -> Result<ExecutionSummary, EngineError> {
        Ok(self.get_execution(execution_id).await?.summary())
    }

    /// Status distribution over executions in memory, plus a page of
    /// summaries (newest first) optionally filtered by status.
    pub fn analytics(
        &self,
        status: Option<ExecutionStatus>,
        limit: usize,
        offset: usize,
    ) -> ExecutionAnalytics {
        let mut summaries: Vec<ExecutionSummary> = lock(&self.inner.executions)
            .values()
            .map(|slot| slot.latest())
            .collect();

        let mut status_distribution = BTreeMap::new();
        for summary in &summaries {
            *status_distribution
                .entry(summary.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        let total_executions = summaries.len();

        summaries.retain(|summary| status.map_or(true, |wanted| summary.status == wanted));
        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        let matching = summaries.len();

        ExecutionAnalytics {
            total_executions,
            status_distribution,
            matching,
            executions: summaries.into_iter().skip(offset).take(limit).collect(),
        }
    }

    fn slot(&self, execution_id: &str) -> Option<Arc<ExecutionSlot>> {
        lock(&self.inner.executions).get(execution_id).cloned()
    }

    async fn load(&self, execution_id: &str) -> Result<ExecutionContext, EngineError> {
        match self.inner.store.load(execution_id).await {
            Ok(context) => Ok(context),
            Err(StoreError::NotFound(_)) => {
                Err(EngineError::ExecutionNotFound(execution_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The in-memory slot, rehydrating from the store if needed.
    async fn find_slot(&self, execution_id: &str) -> Result<Arc<ExecutionSlot>, EngineError> {
        if let Some(slot) = self.slot(execution_id) {
            return Ok(slot);
        }

        let mut context = self.load(execution_id).await?;
        validate_workflow(&context.workflow)?;
        context.workflow_engine = Some(self.handle());
        info!(
            "Loaded execution '{}' ({}) from store",
            execution_id, context.status
        );

        let slot = Arc::new(ExecutionSlot::new(context));
        let mut executions = lock(&self.inner.executions);
        Ok(Arc::clone(
            executions
                .entry(execution_id.to_string())
                .or_insert(slot),
        ))
    }

    /// Records a finished execution and evicts the oldest beyond the limit.
    fn archive(&self, execution_id: &str) {
        let mut history = lock(&self.inner.history);
        history.push_back(execution_id.to_string());

        while history.len() > self.inner.config.history_limit {
            if let Some(evicted) = history.pop_front() {
                debug!("Evicting execution '{}' from memory", evicted);
                lock(&self.inner.executions).remove(&evicted);
            }
        }
    }

    async fn persist(&self, context: &ExecutionContext) {
        if let Err(err) = self.inner.store.save(context).await {
            error!(
                "Failed to persist execution '{}': {}",
                context.execution_id, err
            );
        }
    }

    fn notify(&self, event: ExecutionEvent) {
        self.inner.notifier.notify(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StepError, ValidationError};
    use crate::execution::events::ChannelNotifier;
    use crate::execution::registry::{step_fn, StepExecutor, StepOutput};
    use crate::workflow::condition::{Condition, Operator};
    use crate::workflow::model::RetryPolicy;
    use crate::workflow::state::FileStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn out(value: Value) -> StepOutput {
        value.as_object().cloned().unwrap_or_default()
    }

    /// Echoes its input merged with `parameters.value`.
    fn emit() -> impl StepExecutor {
        step_fn(|step: StepConfig, input: StepOutput| async move {
            let mut output = input;
            if let Some(Value::Object(value)) = step.parameters.get("value") {
                output.extend(value.clone());
            }
            Ok(output)
        })
    }

    fn fail() -> impl StepExecutor {
        step_fn(|_step, _input| async { Err(StepError::failed("boom")) })
    }

    fn sleepy() -> impl StepExecutor {
        step_fn(|_step, _input| async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(StepOutput::new())
        })
    }

    /// Reports the user the step ran as.
    struct WhoAmI;

    #[async_trait]
    impl StepExecutor for WhoAmI {
        async fn execute(
            &self,
            _step: &StepConfig,
            _input: &StepOutput,
            context: &ExecutionContext,
        ) -> Result<StepOutput, StepError> {
            Ok(out(json!({
                "user": context.user_context.user_id,
                "parent": context.parent_execution_id,
                "depth": context.depth,
            })))
        }
    }

    fn registry() -> StepRegistry {
        let mut registry = StepRegistry::with_builtins();
        registry.register("emit", emit()).unwrap();
        registry.register("fail", fail()).unwrap();
        registry.register("sleepy", sleepy()).unwrap();
        registry.register("whoami", WhoAmI).unwrap();
        registry
    }

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(registry())
    }

    fn emit_step(id: &str, value: Value) -> StepConfig {
        StepConfig::new(id, "emit").with_parameter("value", value)
    }

    async fn run(engine: &WorkflowEngine, workflow: WorkflowConfig, payload: Value) -> ExecutionSummary {
        engine
            .execute(workflow, None, payload, UserContext::new("tester"), true)
            .await
            .unwrap()
    }

    fn approval_workflow() -> WorkflowConfig {
        WorkflowConfig::from_steps(
            "approval",
            vec![
                emit_step("draft", json!({"text": "hello"})),
                StepConfig::new("approve", "human_approval").depends_on("draft"),
                emit_step("publish", json!({"published": true})).depends_on("approve"),
            ],
        )
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_dispatch() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = registry();
        registry
            .register(
                "count",
                step_fn(move |_step, input| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(input) }
                }),
            )
            .unwrap();
        let engine = WorkflowEngine::new(registry);

        let workflow = WorkflowConfig::from_steps(
            "cyclic",
            vec![
                StepConfig::new("free", "count"),
                StepConfig::new("a", "count").depends_on("b"),
                StepConfig::new("b", "count").depends_on("a"),
            ],
        );
        let err = engine
            .execute(workflow, None, Value::Null, UserContext::default(), true)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::CyclicWorkflow { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.analytics(None, 10, 0).total_executions, 0);
    }

    #[tokio::test]
    async fn test_unknown_step_type_rejected() {
        let workflow = WorkflowConfig::from_steps("wf", vec![StepConfig::new("a", "teleport")]);
        let err = engine()
            .execute(workflow, None, Value::Null, UserContext::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Registry(RegistryError::UnknownStepType(t)) if t == "teleport"
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_array_merge() {
        let engine = engine();
        let workflow = WorkflowConfig::from_steps(
            "fan_in",
            vec![
                StepConfig::new("A", "input"),
                StepConfig::new("B", "input"),
                StepConfig::new("M", "merge")
                    .depends_on("A")
                    .depends_on("B")
                    .with_parameter("mode", json!("wait_all"))
                    .with_parameter("combine_mode", json!("array")),
            ],
        );

        let summary = run(&engine, workflow, json!({"A": {"v": 1}, "B": {"v": 2}})).await;
        assert_eq!(summary.status, ExecutionStatus::Completed);
        assert_eq!(summary.succeeded_steps, 3);
        assert!(summary.is_clean_success());

        let ctx = engine.get_execution(&summary.execution_id).await.unwrap();
        let merged = &ctx.get_step_result("M").unwrap().output_data;
        let data = merged["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["data"], json!({"v": 1}));
        assert_eq!(data[1]["data"], json!({"v": 2}));
        assert_eq!(merged["sources"], json!(["A", "B"]));
    }

    #[tokio::test]
    async fn test_wait_all_merge_waits_for_slow_branch() {
        let engine = engine();
        let workflow = WorkflowConfig::from_steps(
            "and",
            vec![
                emit_step("A", json!({"a": 1})),
                emit_step("B0", json!({})),
                emit_step("B", json!({"b": 2})).depends_on("B0"),
                StepConfig::new("M", "merge")
                    .depends_on("A")
                    .depends_on("B")
                    .with_parameter("mode", json!("wait_all")),
            ],
        );

        let summary = run(&engine, workflow, Value::Null).await;
        assert_eq!(summary.status, ExecutionStatus::Completed);

        let ctx = engine.get_execution(&summary.execution_id).await.unwrap();
        let merge = ctx.get_step_result("M").unwrap();
        assert!(merge.wave > ctx.get_step_result("B").unwrap().wave);
        assert_eq!(merge.output_data["completed_count"], json!(2));
    }

    #[tokio::test]
    async fn test_first_available_merge_runs_on_first_dependency() {
        let engine = engine();
        let workflow = WorkflowConfig::from_steps(
            "or",
            vec![
                emit_step("A", json!({"from": "A"})),
                emit_step("X", json!({})),
                emit_step("B", json!({"from": "B"})).depends_on("X"),
                StepConfig::new("M", "merge")
                    .depends_on("A")
                    .depends_on("B")
                    .with_parameter("mode", json!("first_available"))
                    .with_parameter("combine_mode", json!("first")),
            ],
        );

        let summary = run(&engine, workflow, Value::Null).await;
        assert_eq!(summary.status, ExecutionStatus::Completed);

        let ctx = engine.get_execution(&summary.execution_id).await.unwrap();
        let merge = ctx.get_step_result("M").unwrap();
        assert_eq!(merge.wave, 2);
        assert_eq!(merge.output_data["source_step"], json!("A"));
        assert_eq!(merge.output_data["data"], json!({"from": "A"}));
        assert_eq!(merge.output_data["completed_count"], json!(1));
    }

    #[tokio::test]
    async fn test_output_step_forwards_single_dependency() {
        let engine = engine();
        let workflow = WorkflowConfig::from_steps(
            "out",
            vec![
                emit_step("A", json!({"x": 1})),
                StepConfig::new("done", "output")
                    .depends_on("A")
                    .with_parameter("label", json!("Final")),
            ],
        );

        let summary = run(&engine, workflow, Value::Null).await;
        let ctx = engine.get_execution(&summary.execution_id).await.unwrap();
        assert_eq!(
            Value::Object(ctx.get_step_result("done").unwrap().output_data.clone()),
            json!({"data": {"x": 1}, "success": true})
        );
    }

    #[tokio::test]
    async fn test_pause_resume_round_trip() {
        let engine = engine();
        let summary = run(&engine, approval_workflow(), Value::Null).await;

        assert_eq!(summary.status, ExecutionStatus::Paused);
        assert_eq!(summary.awaiting_steps, vec!["approve"]);
        let ctx = engine.get_execution(&summary.execution_id).await.unwrap();
        assert!(!ctx.is_step_completed("approve"));
        assert!(ctx.get_step_result("publish").is_none());
        assert_eq!(
            ctx.get_step_result("approve").unwrap().output_data["decision_topic"],
            json!(format!("wf:{}:approve:user_msg", summary.execution_id))
        );

        assert!(
            engine
                .resume(&summary.execution_id, "approve", json!({"approved": true}))
                .await
        );
        let finished = engine.wait(&summary.execution_id).await.unwrap();
        assert_eq!(finished.status, ExecutionStatus::Completed);

        let ctx = engine.get_execution(&summary.execution_id).await.unwrap();
        let approve = ctx.get_step_result("approve").unwrap();
        assert_eq!(approve.status, StepStatus::Success);
        assert_eq!(Value::Object(approve.output_data.clone()), json!({"approved": true}));
        assert!(ctx.is_step_completed("publish"));
    }

    #[tokio::test]
    async fn test_resume_protocol_errors() {
        let engine = engine();
        let paused = run(&engine, approval_workflow(), Value::Null).await;

        let err = engine
            .try_resume(&paused.execution_id, "draft", json!({}), true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownPausedStep { .. }));

        let err = engine
            .try_resume("missing", "approve", json!({}), true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ExecutionNotFound(_)));

        let done = engine
            .try_resume(&paused.execution_id, "approve", json!(true), true)
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);

        let err = engine
            .try_resume(&paused.execution_id, "approve", json!({}), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::ExecutionNotPaused { status: ExecutionStatus::Completed, .. }
        ));
        assert!(!engine.resume(&paused.execution_id, "approve", json!({})).await);

        let ctx = engine.get_execution(&paused.execution_id).await.unwrap();
        assert_eq!(ctx.get_step_result("approve").unwrap().output_data["decision"], json!(true));
    }

    #[tokio::test]
    async fn test_resume_by_topic() {
        let engine = engine();
        let paused = run(&engine, approval_workflow(), Value::Null).await;
        let topic = make_decision_topic(&paused.execution_id, "approve", None);

        engine.resume_topic(&topic, json!({"approved": false})).await.unwrap();
        assert_eq!(
            engine.wait(&paused.execution_id).await.unwrap().status,
            ExecutionStatus::Completed
        );
        assert!(matches!(
            engine.resume_topic("not-a-topic", json!({})).await,
            Err(EngineError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_subflow_failure_propagates() {
        let engine = engine();
        engine
            .register_workflow(WorkflowConfig::from_steps(
                "child",
                vec![StepConfig::new("explode", "fail")],
            ))
            .unwrap();

        let workflow = WorkflowConfig::from_steps(
            "parent",
            vec![StepConfig::new("sub", "subflow").with_parameter("workflow_id", json!("child"))],
        );
        let summary = run(&engine, workflow, Value::Null).await;

        assert_eq!(summary.status, ExecutionStatus::Failed);
        let message = summary.error_message.unwrap();
        assert!(message.starts_with("Critical step 'sub' failed: Subflow execution failed"));
        assert!(message.contains("Critical step 'explode' failed: boom"));

        let ctx = engine.get_execution(&summary.execution_id).await.unwrap();
        let sub = ctx.get_step_result("sub").unwrap();
        assert_eq!(sub.status, StepStatus::Failed);
        assert_eq!(sub.output_data["success"], json!(false));
        assert_eq!(sub.output_data["subflow_status"], json!("failed"));
    }

    #[tokio::test]
    async fn test_subflow_inherits_user_context_and_maps_output() {
        let engine = engine();
        engine
            .register_workflow(WorkflowConfig::from_steps(
                "child",
                vec![StepConfig::new("who", "whoami")],
            ))
            .unwrap();

        let workflow = WorkflowConfig::from_steps(
            "parent",
            vec![StepConfig::new("sub", "subflow")
                .with_parameter("workflow_id", json!("child"))
                .with_parameter("output_mapping", json!({"user": "who.user", "depth": "who.depth"}))],
        );
        let summary = run(&engine, workflow, Value::Null).await;
        assert_eq!(summary.status, ExecutionStatus::Completed);

        let ctx = engine.get_execution(&summary.execution_id).await.unwrap();
        let sub = &ctx.get_step_result("sub").unwrap().output_data;
        assert_eq!(sub["success"], json!(true));
        assert_eq!(sub["subflow_output"], json!({"user": "tester", "depth": 1}));

        let child_id = sub["subflow_execution_id"].as_str().unwrap();
        let child = engine.get_execution(child_id).await.unwrap();
        assert_eq!(child.parent_execution_id.as_deref(), Some(summary.execution_id.as_str()));
    }

    #[tokio::test]
    async fn test_step_timeout_fails_execution() {
        let engine = engine();
        let workflow = WorkflowConfig::from_steps(
            "slow",
            vec![StepConfig::new("nap", "sleepy").with_timeout(Duration::from_millis(10))],
        );

        let summary = run(&engine, workflow, Value::Null).await;
        assert_eq!(summary.status, ExecutionStatus::Failed);
        assert_eq!(
            summary.error_message.as_deref(),
            Some("Critical step 'nap' failed: timeout")
        );
        let ctx = engine.get_execution(&summary.execution_id).await.unwrap();
        assert_eq!(ctx.get_step_result("nap").unwrap().error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_optional_failure_is_absorbed() {
        let engine = engine();
        let workflow = WorkflowConfig::from_steps(
            "partial",
            vec![
                StepConfig::new("flaky", "fail").optional(),
                emit_step("after", json!({"ok": true})).depends_on("flaky"),
            ],
        );

        let summary = run(&engine, workflow, Value::Null).await;
        assert_eq!(summary.status, ExecutionStatus::Completed);
        assert_eq!(summary.failed_steps, 1);
        assert_eq!(summary.succeeded_steps, 1);
        assert!(!summary.is_clean_success());
    }

    #[tokio::test]
    async fn test_fatal_failure_stops_scheduling() {
        let engine = engine();
        let workflow = WorkflowConfig::from_steps(
            "fatal",
            vec![
                StepConfig::new("bad", "fail"),
                emit_step("after", json!({})).depends_on("bad"),
            ],
        );

        let summary = run(&engine, workflow, Value::Null).await;
        assert_eq!(summary.status, ExecutionStatus::Failed);
        assert_eq!(summary.pending_steps, 2);
        assert_eq!(summary.waves, 1);
    }

    #[tokio::test]
    async fn test_false_condition_skips_step() {
        let engine = engine();
        let workflow = WorkflowConfig::from_steps(
            "conditional",
            vec![
                emit_step("score", json!({"value": 3})),
                emit_step("celebrate", json!({}))
                    .depends_on("score")
                    .with_condition(Condition::compare("score.value", Operator::GreaterThan, json!(5))),
                emit_step("report", json!({"done": true})).depends_on("celebrate"),
            ],
        );

        let summary = run(&engine, workflow, Value::Null).await;
        assert_eq!(summary.status, ExecutionStatus::Completed);
        assert_eq!(summary.skipped_steps, 1);

        let ctx = engine.get_execution(&summary.execution_id).await.unwrap();
        assert_eq!(ctx.get_step_result("celebrate").unwrap().status, StepStatus::Skipped);
        assert!(ctx.get_step_result("report").unwrap().is_success());
    }

    #[tokio::test]
    async fn test_retryable_step_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = registry();
        registry
            .register(
                "flaky",
                step_fn(move |_step, _input| {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt == 0 {
                            Err(StepError::retryable("connection reset"))
                        } else {
                            Ok(out(json!({"attempt": attempt})))
                        }
                    }
                }),
            )
            .unwrap();
        let engine = WorkflowEngine::new(registry);

        let workflow = WorkflowConfig::from_steps(
            "retry",
            vec![StepConfig::new("call", "flaky")
                .with_retry(RetryPolicy::fixed(2, Duration::from_millis(1)))],
        );
        let summary = run(&engine, workflow, Value::Null).await;
        assert_eq!(summary.status, ExecutionStatus::Completed);

        let ctx = engine.get_execution(&summary.execution_id).await.unwrap();
        assert_eq!(ctx.get_step_result("call").unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_wave_width_limits_dispatch() {
        let engine = WorkflowEngine::builder()
            .registry(registry())
            .config(EngineConfig::default().with_max_wave_width(1))
            .build();
        let workflow = WorkflowConfig::from_steps(
            "narrow",
            vec![
                emit_step("a", json!({})),
                emit_step("b", json!({})),
                emit_step("c", json!({})),
            ],
        );

        let summary = run(&engine, workflow, Value::Null).await;
        assert_eq!(summary.status, ExecutionStatus::Completed);
        assert_eq!(summary.waves, 3);
    }

    #[tokio::test]
    async fn test_cancel_running_execution() {
        let engine = engine();
        let workflow = WorkflowConfig::from_steps(
            "long",
            vec![
                StepConfig::new("nap", "sleepy"),
                emit_step("after", json!({})).depends_on("nap"),
            ],
        );

        let started = engine
            .execute(workflow, Some("run-1".into()), Value::Null, UserContext::default(), false)
            .await
            .unwrap();
        assert_eq!(started.status, ExecutionStatus::Running);
        assert!(engine.cancel("run-1").await);

        let summary = engine.wait("run-1").await.unwrap();
        assert_eq!(summary.status, ExecutionStatus::Cancelled);
        let ctx = engine.get_execution("run-1").await.unwrap();
        assert!(ctx.get_step_result("after").is_none());
        assert!(!engine.cancel("run-1").await);
    }

    #[tokio::test]
    async fn test_cancel_paused_execution() {
        let engine = engine();
        let paused = run(&engine, approval_workflow(), Value::Null).await;

        assert!(engine.cancel(&paused.execution_id).await);
        assert_eq!(
            engine.summary(&paused.execution_id).unwrap().status,
            ExecutionStatus::Cancelled
        );
        assert!(!engine.resume(&paused.execution_id, "approve", json!({})).await);
    }

    #[tokio::test]
    async fn test_duplicate_execution_id_rejected() {
        let engine = engine();
        let workflow = WorkflowConfig::from_steps("wf", vec![emit_step("a", json!({}))]);
        engine
            .execute(workflow.clone(), Some("same".into()), Value::Null, UserContext::default(), true)
            .await
            .unwrap();

        let err = engine
            .execute(workflow, Some("same".into()), Value::Null, UserContext::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateExecution(id) if id == "same"));
    }

    #[tokio::test]
    async fn test_resume_after_restart_from_file_store() {
        let temp_dir = tempdir().unwrap();

        let first = WorkflowEngine::builder()
            .registry(registry())
            .store(FileStore::new(temp_dir.path()))
            .build();
        let paused = run(&first, approval_workflow(), json!({"draft": {"topic": "rust"}})).await;
        assert_eq!(paused.status, ExecutionStatus::Paused);
        drop(first);

        let second = WorkflowEngine::builder()
            .registry(registry())
            .store(FileStore::new(temp_dir.path()))
            .build();
        let done = second
            .try_resume(&paused.execution_id, "approve", json!({"approved": true}), true)
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);

        let ctx = second.get_execution(&paused.execution_id).await.unwrap();
        assert_eq!(ctx.get_step_result("draft").unwrap().output_data["topic"], json!("rust"));
        assert!(ctx.is_step_completed("publish"));
    }

    #[tokio::test]
    async fn test_events_are_emitted_in_order() {
        let (notifier, mut receiver) = ChannelNotifier::channel();
        let engine = WorkflowEngine::builder()
            .registry(registry())
            .notifier(notifier)
            .build();
        let workflow = WorkflowConfig::from_steps("wf", vec![emit_step("a", json!({"x": 1}))]);
        run(&engine, workflow, Value::Null).await;

        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(ExecutionEvent::WorkflowStarted { .. })));
        assert!(matches!(events.get(1), Some(ExecutionEvent::StepStarted { step_id, .. }) if step_id == "a"));
        assert!(matches!(events.get(2), Some(ExecutionEvent::StepCompleted { .. })));
        assert!(matches!(events.last(), Some(ExecutionEvent::WorkflowCompleted { .. })));
    }

    #[tokio::test]
    async fn test_analytics_and_history_limit() {
        let engine = WorkflowEngine::builder()
            .registry(registry())
            .config(EngineConfig::default().with_history_limit(2))
            .build();

        for _ in 0..3 {
            let workflow = WorkflowConfig::from_steps("ok", vec![emit_step("a", json!({}))]);
            run(&engine, workflow, Value::Null).await;
        }
        let paused = run(&engine, approval_workflow(), Value::Null).await;

        let analytics = engine.analytics(None, 10, 0);
        assert_eq!(analytics.total_executions, 3);
        assert_eq!(analytics.status_distribution.get("completed"), Some(&2));
        assert_eq!(analytics.status_distribution.get("paused"), Some(&1));

        let paused_only = engine.analytics(Some(ExecutionStatus::Paused), 10, 0);
        assert_eq!(paused_only.matching, 1);
        assert_eq!(paused_only.executions[0].execution_id, paused.execution_id);

        let page = engine.analytics(None, 1, 1);
        assert_eq!(page.executions.len(), 1);
    }

    #[tokio::test]
    async fn test_recover_running_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let workflow = Arc::new(WorkflowConfig::from_steps(
            "crashy",
            vec![
                emit_step("a", json!({"a": 1})),
                emit_step("b", json!({"b": 2})).depends_on("a"),
            ],
        ));

        // Snapshot of a run that finished wave 1 and then lost its process
        let mut context = ExecutionContext::new("crashed", workflow, UserContext::default());
        context.transition(ExecutionStatus::Running);
        context.waves = 1;
        let mut first = StepResult::success("a", out(json!({"a": 1})));
        first.wave = 1;
        context.complete_step(first);
        store.save(&context).await.unwrap();

        let engine = WorkflowEngine::builder()
            .registry(registry())
            .shared_store(store)
            .build();
        let summary = engine.recover("crashed", true).await.unwrap();

        assert_eq!(summary.status, ExecutionStatus::Completed);
        assert_eq!(summary.waves, 2);
    }

    #[tokio::test]
    async fn test_cancel_during_retry_backoff_ends_cancelled() {
        let mut registry = registry();
        registry
            .register("down", step_fn(|_s, _i| async { Err(StepError::retryable("503")) }))
            .unwrap();
        let engine = WorkflowEngine::new(registry);
        let workflow = WorkflowConfig::from_steps(
            "backoff",
            vec![
                StepConfig::new("call", "down")
                    .with_retry(RetryPolicy::fixed(5, Duration::from_secs(5))),
                emit_step("after", json!({})).depends_on("call"),
            ],
        );

        engine
            .execute(workflow, Some("backoff-1".into()), Value::Null, UserContext::default(), false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.cancel("backoff-1").await);

        let summary = tokio::time::timeout(Duration::from_secs(2), engine.wait("backoff-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.status, ExecutionStatus::Cancelled);
        assert!(summary.error_message.is_none());

        let ctx = engine.get_execution("backoff-1").await.unwrap();
        let call = ctx.get_step_result("call").unwrap();
        assert_eq!(call.status, StepStatus::Cancelled);
        assert_eq!(call.error.as_deref(), Some("cancelled while retrying: 503"));
        assert!(ctx.get_step_result("after").is_none());
    }

    #[tokio::test]
    async fn test_cancel_with_failing_inflight_step_ends_cancelled() {
        let mut registry = registry();
        registry
            .register(
                "late",
                step_fn(|_s, _i| async {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Err(StepError::failed("late"))
                }),
            )
            .unwrap();
        let engine = WorkflowEngine::new(registry);
        let workflow = WorkflowConfig::from_steps(
            "inflight",
            vec![
                StepConfig::new("work", "late"),
                emit_step("after", json!({})).depends_on("work"),
            ],
        );

        engine
            .execute(workflow, Some("inflight-1".into()), Value::Null, UserContext::default(), false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.cancel("inflight-1").await);

        let summary = engine.wait("inflight-1").await.unwrap();
        assert_eq!(summary.status, ExecutionStatus::Cancelled);
        assert!(summary.error_message.is_none());

        let ctx = engine.get_execution("inflight-1").await.unwrap();
        let work = ctx.get_step_result("work").unwrap();
        assert_eq!(work.status, StepStatus::Failed);
        assert_eq!(work.error.as_deref(), Some("late"));
        assert!(ctx.get_step_result("after").is_none());
    }

    #[tokio::test]
    async fn test_wave_steps_run_in_parallel() {
        let engine = engine();
        let workflow = WorkflowConfig::from_steps(
            "parallel",
            vec![StepConfig::new("a", "sleepy"), StepConfig::new("b", "sleepy")],
        );

        let started = Instant::now();
        let summary = run(&engine, workflow, Value::Null).await;
        let elapsed = started.elapsed();

        assert_eq!(summary.status, ExecutionStatus::Completed);
        assert_eq!(summary.waves, 1);
        assert!(elapsed < Duration::from_millis(280), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_slow_execution_does_not_block_others() {
        let mut registry = registry();
        registry
            .register(
                "stall",
                step_fn(|_s, _i| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(StepOutput::new())
                }),
            )
            .unwrap();
        let engine = WorkflowEngine::new(registry);

        let slow = WorkflowConfig::from_steps("slow", vec![StepConfig::new("wait", "stall")]);
        engine
            .execute(slow, Some("slow-1".into()), Value::Null, UserContext::default(), false)
            .await
            .unwrap();

        let fast = WorkflowConfig::from_steps("fast", vec![emit_step("a", json!({"x": 1}))]);
        let summary = tokio::time::timeout(
            Duration::from_secs(1),
            engine.execute(fast, None, Value::Null, UserContext::default(), true),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(summary.status, ExecutionStatus::Completed);
        assert_eq!(
            engine.summary("slow-1").unwrap().status,
            ExecutionStatus::Running
        );
        assert!(engine.cancel("slow-1").await);
    }

    #[tokio::test]
    async fn test_concurrent_resumes_are_serialized() {
        let engine = engine();
        let paused = run(&engine, approval_workflow(), Value::Null).await;
        let id = paused.execution_id.as_str();

        let (first, second) = tokio::join!(
            engine.try_resume(id, "approve", json!({"approved": true}), true),
            engine.try_resume(id, "approve", json!({"approved": false}), true),
        );

        let (accepted, rejected): (Vec<_>, Vec<_>) =
            [first, second].into_iter().partition(Result::is_ok);
        assert_eq!(accepted.len(), 1);
        assert_eq!(rejected.len(), 1);
        assert_eq!(
            accepted[0].as_ref().unwrap().status,
            ExecutionStatus::Completed
        );
        assert!(matches!(
            rejected[0],
            Err(EngineError::ExecutionNotPaused { status: ExecutionStatus::Completed, .. })
        ));

        let ctx = engine.get_execution(id).await.unwrap();
        assert!(ctx.is_step_completed("publish"));
        assert_eq!(ctx.get_step_result("publish").unwrap().wave, 3);
    }

    #[tokio::test]
    async fn test_wait_all_merge_waits_when_first_branch_is_slower() {
        let engine = engine();
        let workflow = WorkflowConfig::from_steps(
            "and_slow_a",
            vec![
                emit_step("A0", json!({})),
                emit_step("A", json!({"a": 1})).depends_on("A0"),
                emit_step("B", json!({"b": 2})),
                StepConfig::new("M", "merge")
                    .depends_on("A")
                    .depends_on("B")
                    .with_parameter("mode", json!("wait_all")),
            ],
        );

        let summary = run(&engine, workflow, Value::Null).await;
        assert_eq!(summary.status, ExecutionStatus::Completed);

        let ctx = engine.get_execution(&summary.execution_id).await.unwrap();
        let merge = ctx.get_step_result("M").unwrap();
        assert_eq!(ctx.get_step_result("A").unwrap().wave, 2);
        assert_eq!(merge.wave, 3);
        assert_eq!(merge.output_data["completed_count"], json!(2));
    }

    #[tokio::test]
    async fn test_resume_with_other_steps_still_awaiting() {
        let engine = engine();
        let workflow = WorkflowConfig::from_steps(
            "two_approvals",
            vec![
                StepConfig::new("p1", "human_approval"),
                StepConfig::new("p2", "human_approval"),
                emit_step("after1", json!({"one": true})).depends_on("p1"),
                emit_step("after2", json!({"two": true})).depends_on("after1"),
            ],
        );

        let paused = run(&engine, workflow, Value::Null).await;
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.awaiting_steps, vec!["p1", "p2"]);

        // One more wave runs, then the execution pauses again on p2
        let again = engine
            .try_resume(&paused.execution_id, "p1", json!({"approved": true}), true)
            .await
            .unwrap();
        assert_eq!(again.status, ExecutionStatus::Paused);
        assert_eq!(again.awaiting_steps, vec!["p2"]);
        let ctx = engine.get_execution(&paused.execution_id).await.unwrap();
        assert!(ctx.is_step_completed("after1"));
        assert!(ctx.get_step_result("after2").is_none());

        let done = engine
            .try_resume(&paused.execution_id, "p2", json!({"approved": true}), true)
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        let ctx = engine.get_execution(&paused.execution_id).await.unwrap();
        assert!(ctx.is_step_completed("after2"));
    }

    #[tokio::test]
    async fn test_execution_id_with_topic_separator_rejected() {
        let engine = engine();
        let workflow = WorkflowConfig::from_steps("wf", vec![emit_step("a", json!({}))]);

        let err = engine
            .execute(workflow, Some("tenant:42".into()), Value::Null, UserContext::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidExecutionId(id) if id == "tenant:42"));
        assert!(engine.summary("tenant:42").is_none());
    }

    #[tokio::test]
    async fn test_file_store_keeps_similar_execution_ids_apart() {
        let temp_dir = tempdir().unwrap();
        let first = WorkflowEngine::builder()
            .registry(registry())
            .store(FileStore::new(temp_dir.path()))
            .build();
        for id in ["tenant/1", "tenant_1"] {
            let paused = first
                .execute(approval_workflow(), Some(id.into()), Value::Null, UserContext::new(id), true)
                .await
                .unwrap();
            assert_eq!(paused.status, ExecutionStatus::Paused);
        }
        drop(first);

        let second = WorkflowEngine::builder()
            .registry(registry())
            .store(FileStore::new(temp_dir.path()))
            .build();
        let done = second
            .try_resume("tenant/1", "approve", json!({"approved": true}), true)
            .await
            .unwrap();
        assert_eq!(done.execution_id, "tenant/1");
        assert_eq!(done.status, ExecutionStatus::Completed);

        let other = second.get_execution("tenant_1").await.unwrap();
        assert_eq!(other.status, ExecutionStatus::Paused);
        assert_eq!(other.user_context.user_id.as_deref(), Some("tenant_1"));
    }
}
