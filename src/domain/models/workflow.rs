//! Workflow (behavior-tree) configuration and result types.
//!
//! A workflow is a flat ordered list of typed step nodes; `step` nodes
//! group nested steps but introduce no branching beyond the workflow's
//! failure policy. Configurations are pure data (JSON or YAML).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::error::{EngineError, EngineResult};

/// One node in a workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowStep {
    /// Emit a user-facing message through the agent's channel.
    Chat {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_variable: Option<String>,
    },
    /// Merge updates into the session's context variables.
    State {
        #[serde(default = "default_state_action")]
        action: String,
        updates: HashMap<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_variable: Option<String>,
    },
    /// Run a capability/state query.
    Query {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_variable: Option<String>,
    },
    /// Invoke a named tool.
    Tool {
        tool: String,
        operation: String,
        #[serde(default)]
        params: HashMap<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_variable: Option<String>,
    },
    /// Logical grouping of nested steps, executed in order.
    Step {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        steps: Vec<WorkflowStep>,
    },
}

fn default_state_action() -> String {
    "update".to_string()
}

impl WorkflowStep {
    /// The artifact key this step writes, when configured.
    pub fn output_variable(&self) -> Option<&str> {
        match self {
            Self::Chat { output_variable, .. }
            | Self::State { output_variable, .. }
            | Self::Query { output_variable, .. }
            | Self::Tool { output_variable, .. } => output_variable.as_deref(),
            Self::Step { .. } => None,
        }
    }

    /// Short label for events and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::State { .. } => "state",
            Self::Query { .. } => "query",
            Self::Tool { .. } => "tool",
            Self::Step { .. } => "step",
        }
    }
}

/// An ordered workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Optional workflow name, used in events and logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// When true, a failing step aborts the workflow and committed state
    /// changes are reverted; when false, execution continues.
    #[serde(default)]
    pub rollback_on_failure: bool,
    /// Steps, executed in declaration order.
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowConfig {
    /// Parse a workflow from YAML (agent definitions are data).
    pub fn from_yaml(yaml: &str) -> EngineResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::invalid_input(format!("invalid workflow yaml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a workflow from a JSON value.
    pub fn from_value(value: Value) -> EngineResult<Self> {
        let config: Self = serde_json::from_value(value)
            .map_err(|e| EngineError::invalid_input(format!("invalid workflow config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation run before execution.
    pub fn validate(&self) -> EngineResult<()> {
        if self.steps.is_empty() {
            return Err(EngineError::invalid_input("workflow has no steps"));
        }
        validate_steps(&self.steps)
    }
}

fn validate_steps(steps: &[WorkflowStep]) -> EngineResult<()> {
    for step in steps {
        match step {
            WorkflowStep::Chat { message, .. } if message.is_empty() => {
                return Err(EngineError::invalid_input("chat step with empty message"));
            }
            WorkflowStep::State { action, updates, .. } => {
                if action != "update" {
                    return Err(EngineError::invalid_input(format!(
                        "unsupported state action: {action}"
                    )));
                }
                if updates.is_empty() {
                    return Err(EngineError::invalid_input("state step with no updates"));
                }
            }
            WorkflowStep::Tool { tool, operation, .. } => {
                if tool.is_empty() || operation.is_empty() {
                    return Err(EngineError::invalid_input(
                        "tool step requires tool and operation",
                    ));
                }
            }
            WorkflowStep::Query { query, .. } if query.is_empty() => {
                return Err(EngineError::invalid_input("query step with empty query"));
            }
            WorkflowStep::Step { steps, .. } => {
                if steps.is_empty() {
                    return Err(EngineError::invalid_input("grouping step with no children"));
                }
                validate_steps(steps)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Terminal status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Success,
    Failure,
    Partial,
}

/// A step failure captured into the workflow result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    /// Zero-based position in the flattened step walk.
    pub step_index: usize,
    /// Step kind ("chat", "tool", ...).
    pub step_kind: String,
    pub message: String,
}

/// Structured workflow result; invocations never propagate exceptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    /// Message discriminator, always `bt_execution_result`.
    #[serde(rename = "type")]
    pub result_type: String,
    pub success: bool,
    pub status: WorkflowStatus,
    /// Artifacts keyed by `output_variable`.
    pub artifacts: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StepError>,
}

impl WorkflowOutcome {
    pub fn new(status: WorkflowStatus, artifacts: HashMap<String, Value>, errors: Vec<StepError>) -> Self {
        Self {
            result_type: "bt_execution_result".to_string(),
            success: status == WorkflowStatus::Success,
            status,
            artifacts,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_workflow_from_yaml() {
        let yaml = r#"
name: greet
rollback_on_failure: false
steps:
  - type: chat
    message: "hello"
    output_variable: greeting
  - type: state
    action: update
    updates:
      greeted: true
  - type: tool
    tool: linter
    operation: run
    params:
      path: src/
    output_variable: lint
"#;
        let config = WorkflowConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.steps.len(), 3);
        assert_eq!(config.steps[0].output_variable(), Some("greeting"));
        assert_eq!(config.steps[1].kind(), "state");
    }

    #[test]
    fn test_grouping_step_parses() {
        let config = WorkflowConfig::from_value(json!({
            "steps": [
                {"type": "step", "name": "setup", "steps": [
                    {"type": "state", "action": "update", "updates": {"ready": true}}
                ]}
            ]
        }))
        .unwrap();
        assert_eq!(config.steps[0].kind(), "step");
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let err = WorkflowConfig::from_value(json!({"steps": []})).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_invalid_state_action_rejected() {
        let err = WorkflowConfig::from_value(json!({
            "steps": [{"type": "state", "action": "delete", "updates": {"k": 1}}]
        }))
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_outcome_shape() {
        let outcome = WorkflowOutcome::new(WorkflowStatus::Partial, HashMap::new(), vec![]);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["type"], "bt_execution_result");
        assert_eq!(json["status"], "PARTIAL");
        assert_eq!(json["success"], false);
    }
}
