//! Execution Planner
//!
//! Computes which steps may run in the next wave:
//! - Dependency gating (AND by default, OR for `first_available`)
//! - Exclusion of completed and suspended steps
//! - Wave width limit
//!
//! The planner borrows execution state and never mutates it; the engine's
//! scheduling loop owns all transitions.

use std::collections::BTreeSet;

use log::debug;

use super::model::{GatingMode, StepConfig, WorkflowConfig};

/// Read-only view used to pick the next wave.
pub struct ExecutionPlanner<'a> {
    workflow: &'a WorkflowConfig,
    completed_steps: &'a BTreeSet<String>,
    awaiting_steps: &'a BTreeSet<String>,
    max_wave_width: usize,
}

impl<'a> ExecutionPlanner<'a> {
    /// Creates a planner over the given execution state.
    ///
    /// A `max_wave_width` of zero is treated as one.
    pub fn new(
        workflow: &'a WorkflowConfig,
        completed_steps: &'a BTreeSet<String>,
        awaiting_steps: &'a BTreeSet<String>,
        max_wave_width: usize,
    ) -> Self {
        Self {
            workflow,
            completed_steps,
            awaiting_steps,
            max_wave_width: max_wave_width.max(1),
        }
    }

    /// Returns true if the step's dependency predicate holds.
    ///
    /// Steps with no dependencies are ready immediately.
    pub fn dependencies_satisfied(&self, step: &StepConfig) -> bool {
        if step.dependencies.is_empty() {
            return true;
        }
        let mut done = step
            .dependencies
            .iter()
            .map(|dep| self.completed_steps.contains(dep));
        match step.gating_mode() {
            GatingMode::WaitAll => done.all(|d| d),
            GatingMode::FirstAvailable => done.any(|d| d),
        }
    }

    /// Returns steps that may be dispatched in the next wave.
    ///
    /// A step is ready if:
    /// - It hasn't completed
    /// - It isn't suspended awaiting input
    /// - Its dependency predicate holds
    ///
    /// Steps come back in declaration order, at most `max_wave_width` of them.
    pub fn get_ready_steps(&self) -> Vec<&'a StepConfig> {
        let mut ready_steps = Vec::new();

        for step in &self.workflow.steps {
            if self.completed_steps.contains(&step.step_id)
                || self.awaiting_steps.contains(&step.step_id)
            {
                continue;
            }

            if !self.dependencies_satisfied(step) {
                continue;
            }

            if ready_steps.len() >= self.max_wave_width {
                debug!(
                    "Wave width {} reached; '{}' deferred to a later wave",
                    self.max_wave_width, step.step_id
                );
                break;
            }

            ready_steps.push(step);
        }

        ready_steps
    }

    /// Steps neither completed nor suspended.
    pub fn pending_steps(&self) -> Vec<&'a str> {
        self.workflow
            .steps
            .iter()
            .filter(|s| {
                !self.completed_steps.contains(&s.step_id)
                    && !self.awaiting_steps.contains(&s.step_id)
            })
            .map(|s| s.step_id.as_str())
            .collect()
    }

    /// Returns true if there are more steps to execute.
    pub fn has_work_remaining(&self) -> bool {
        self.workflow
            .steps
            .iter()
            .any(|s| !self.completed_steps.contains(&s.step_id))
    }

    /// Returns the current progress as (completed, total).
    pub fn progress(&self) -> (usize, usize) {
        let completed = self
            .workflow
            .steps
            .iter()
            .filter(|s| self.completed_steps.contains(&s.step_id))
            .count();
        (completed, self.workflow.steps.len())
    }
}
