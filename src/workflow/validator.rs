//! Workflow Validation
//!
//! Structural checks run before an execution dispatches anything:
//! - Step field validation
//! - Reference integrity (dependencies, entry steps)
//! - Merge parameter values
//! - Dependency graph validation (no cycles) via topological sorting
//!
//! Step-type registration is checked by the engine, which owns the registry.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use log::{debug, info};
use serde_json::Value;

use super::model::{step_types, CombineMode, GatingMode, StepConfig, WorkflowConfig};
use crate::error::ValidationError;

/// Step IDs the engine uses for its own staged data.
pub const RESERVED_STEP_IDS: &[&str] = &["trigger_raw", "subflow_input"];

/// Validates a single step's own fields.
fn validate_step(step: &StepConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.step_id.trim().is_empty() {
        errors.push(ValidationError::EmptyStepId);
        return errors;
    }

    if RESERVED_STEP_IDS.contains(&step.step_id.as_str()) {
        errors.push(ValidationError::ReservedStepId(step.step_id.clone()));
    }

    if step.step_type.trim().is_empty() {
        errors.push(ValidationError::EmptyStepType(step.step_id.clone()));
    }

    if step.step_type == step_types::MERGE {
        if let Some(mode) = step.parameters.get("mode") {
            if !mode.as_str().is_some_and(|m| GatingMode::parse(m).is_some()) {
                errors.push(invalid_parameter(step, "mode", mode, "wait_all, first_available"));
            }
        }
        if let Some(combine) = step.parameters.get("combine_mode") {
            if !combine.as_str().is_some_and(|m| CombineMode::parse(m).is_some()) {
                errors.push(invalid_parameter(step, "combine_mode", combine, "first, array, object"));
            }
        }
    }

    if step.dependencies.is_empty() {
        debug!("Step '{}' is a root step (no dependencies)", step.step_id);
    }

    errors
}

fn invalid_parameter(step: &StepConfig, parameter: &str, value: &Value, expected: &str) -> ValidationError {
    ValidationError::InvalidParameter {
        step: step.step_id.clone(),
        parameter: parameter.to_string(),
        message: format!("got {}, expected one of: {}", value, expected),
    }
}

/// Collects every structural problem in the workflow.
///
/// Cycle detection only runs when references are intact.
pub fn collect_errors(workflow: &WorkflowConfig) -> Vec<ValidationError> {
    if workflow.steps.is_empty() {
        return vec![ValidationError::EmptyWorkflow];
    }

    let mut errors = Vec::new();
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if !step.step_id.trim().is_empty() && !seen_ids.insert(step.step_id.as_str()) {
            errors.push(ValidationError::DuplicateStepId(step.step_id.clone()));
        }
    }

    for step in &workflow.steps {
        errors.extend(validate_step(step));

        for dependency in &step.dependencies {
            if !seen_ids.contains(dependency.as_str()) {
                errors.push(ValidationError::InvalidReference {
                    step: step.step_id.clone(),
                    reference: dependency.clone(),
                });
            }
        }
    }

    for entry in &workflow.entry {
        if !seen_ids.contains(entry.as_str()) {
            errors.push(ValidationError::UnknownEntry(entry.clone()));
        }
    }

    if errors.is_empty() {
        if let Err(cycle) = topological_order(workflow) {
            errors.push(cycle);
        }
    }

    errors
}

/// Validates the workflow and returns its steps in topological order.
///
/// Performs the following checks:
/// 1. Workflow is not empty
/// 2. No duplicate or reserved step IDs
/// 3. All steps have valid fields
/// 4. All references point to existing steps
/// 5. No cyclic dependencies
pub fn validate_workflow(workflow: &WorkflowConfig) -> Result<Vec<String>, ValidationError> {
    info!(
        "Validating workflow '{}' with {} steps",
        workflow.workflow_id,
        workflow.steps.len()
    );

    if let Some(first) = collect_errors(workflow).into_iter().next() {
        return Err(first);
    }

    let order = topological_order(workflow)?;
    debug!("Topological order: {:?}", order);
    Ok(order)
}

/// Orders step IDs so dependencies come before dependents (Kahn's algorithm).
///
/// Ties keep declaration order. Unknown dependency IDs are ignored here;
/// reference checks report them.
pub fn topological_order(workflow: &WorkflowConfig) -> Result<Vec<String>, ValidationError> {
    let known: HashSet<&str> = workflow.steps.iter().map(|s| s.step_id.as_str()).collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &workflow.steps {
        let deps: BTreeSet<&str> = step
            .dependencies
            .iter()
            .map(String::as_str)
            .filter(|d| known.contains(d))
            .collect();
        in_degree.insert(step.step_id.as_str(), deps.len());
        for dep in deps {
            successors.entry(dep).or_default().push(step.step_id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = workflow
        .steps
        .iter()
        .map(|s| s.step_id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    let mut sorted_order = Vec::with_capacity(workflow.steps.len());
    while let Some(current) = queue.pop_front() {
        sorted_order.push(current.to_string());
        for successor in successors.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(successor) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*successor);
                }
            }
        }
    }

    if sorted_order.len() != workflow.steps.len() {
        return Err(ValidationError::CyclicWorkflow {
            steps: cyclic_steps(workflow, &in_degree, &successors),
        });
    }

    Ok(sorted_order)
}

/// Narrows the unsorted remainder down to steps that sit on a cycle by
/// repeatedly pruning steps with no remaining dependents.
fn cyclic_steps(
    workflow: &WorkflowConfig,
    in_degree: &HashMap<&str, usize>,
    successors: &HashMap<&str, Vec<&str>>,
) -> Vec<String> {
    let mut remaining: HashSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree > 0)
        .map(|(id, _)| *id)
        .collect();

    loop {
        let sinks: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|id| {
                !successors
                    .get(id)
                    .into_iter()
                    .flatten()
                    .any(|s| remaining.contains(s))
            })
            .collect();
        if sinks.is_empty() {
            break;
        }
        for sink in sinks {
            remaining.remove(sink);
        }
    }

    workflow
        .steps
        .iter()
        .map(|s| s.step_id.as_str())
        .filter(|id| remaining.contains(id))
        .map(str::to_string)
        .collect()
}
