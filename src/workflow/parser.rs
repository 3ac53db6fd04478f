//! Workflow Parser
//!
//! Loads workflow definitions from YAML or JSON and normalizes them:
//! missing step IDs are derived, duplicate dependency entries dropped and a
//! workflow ID assigned when absent. Structural validation is left to
//! [`validate_workflow`](super::validator::validate_workflow).

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use log::{debug, info};
use uuid::Uuid;

use super::model::{step_types, WorkflowConfig};
use crate::error::ParseError;

/// Loads a workflow from a `.yaml`/`.yml` or `.json` file.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("triage.yaml")?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowConfig, ParseError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.display().to_string(),
        source,
    })?;
    debug!("Workflow content loaded ({} bytes)", content.len());

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        parse_json(&content)
    } else {
        parse_yaml(&content)
    }
}

/// Parses and normalizes a YAML workflow document.
pub fn parse_yaml(content: &str) -> Result<WorkflowConfig, ParseError> {
    let mut workflow: WorkflowConfig = serde_yaml::from_str(content)?;
    normalize_workflow(&mut workflow);
    Ok(workflow)
}

/// Parses and normalizes a JSON workflow document.
pub fn parse_json(content: &str) -> Result<WorkflowConfig, ParseError> {
    let mut workflow: WorkflowConfig = serde_json::from_str(content)?;
    normalize_workflow(&mut workflow);
    Ok(workflow)
}

/// Fills in derived identifiers and tidies dependency lists.
///
/// Steps without an ID get `trigger` (first trigger step), a slug of their
/// name, or `{step_type}_{position}`; collisions get `_2`, `_3`, ...
pub fn normalize_workflow(workflow: &mut WorkflowConfig) {
    if workflow.workflow_id.trim().is_empty() {
        workflow.workflow_id = Uuid::new_v4().to_string();
    }

    let mut used: HashSet<String> = HashSet::new();
    for step in &mut workflow.steps {
        step.step_id = step.step_id.trim().to_string();
        if !step.step_id.is_empty() {
            used.insert(step.step_id.clone());
        }
    }

    for (index, step) in workflow.steps.iter_mut().enumerate() {
        if step.step_id.is_empty() {
            let base = if step.step_type == step_types::TRIGGER && !used.contains("trigger") {
                "trigger".to_string()
            } else {
                step.name
                    .as_deref()
                    .map(slugify)
                    .filter(|slug| !slug.is_empty())
                    .unwrap_or_else(|| format!("{}_{}", slugify(&step.step_type), index + 1))
            };
            let id = unique_id(&base, &used);
            debug!("Assigned step ID '{}' to step at position {}", id, index);
            used.insert(id.clone());
            step.step_id = id;
        }

        let mut seen = HashSet::new();
        step.dependencies
            .retain(|dep| !dep.trim().is_empty() && seen.insert(dep.clone()));
    }
}

fn unique_id(base: &str, used: &HashSet<String>) -> String {
    if !used.contains(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| !used.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Lowercases and collapses runs of non-alphanumerics into `_`.
fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Fetch Customer  Record!"), "fetch_customer_record");
        assert_eq!(slugify("***"), "");
    }

    #[test]
    fn test_normalize_assigns_ids() {
        let yaml = r#"
workflow_id: wf
steps:
  - step_type: trigger
  - step_type: tool
    name: Look Up Order
    dependencies: trigger
  - step_type: tool
    name: Look up order
  - step_type: output
    dependencies: [look_up_order, look_up_order, look_up_order_2]
"#;
        let workflow = parse_yaml(yaml).unwrap();
        let ids: Vec<_> = workflow.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["trigger", "look_up_order", "look_up_order_2", "output_4"]);
        assert_eq!(
            workflow.steps[3].dependencies,
            vec!["look_up_order", "look_up_order_2"]
        );
    }

    #[test]
    fn test_explicit_ids_win_over_derived() {
        let yaml = r#"
steps:
  - step_id: trigger
    step_type: input
  - step_type: trigger
"#;
        let workflow = parse_yaml(yaml).unwrap();
        assert_eq!(workflow.steps[1].step_id, "trigger_2");
        assert!(!workflow.workflow_id.is_empty());
    }

    #[test]
    fn test_load_workflow_file_not_found() {
        let result = load_workflow("/nonexistent/workflow.yaml");
        assert!(matches!(result, Err(ParseError::Io { .. })));
    }

    #[test]
    fn test_load_workflow_json_and_yaml() {
        let temp_dir = tempdir().unwrap();
        let json_path = temp_dir.path().join("flow.json");
        fs::write(
            &json_path,
            r#"{"workflow_id": "j", "steps": [{"step_id": "a", "step_type": "input"}]}"#,
        )
        .unwrap();
        let yaml_path = temp_dir.path().join("flow.yaml");
        fs::write(&yaml_path, "workflow_id: y\nsteps:\n  - step_id: a\n    step_type: input\n").unwrap();

        assert_eq!(load_workflow(&json_path).unwrap().workflow_id, "j");
        assert_eq!(load_workflow(&yaml_path).unwrap().workflow_id, "y");
    }

    #[test]
    fn test_load_workflow_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        fs::write(&path, "steps: [ {step_type: ").unwrap();
        assert!(matches!(load_workflow(&path), Err(ParseError::Yaml(_))));
    }
}
