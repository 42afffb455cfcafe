//! Behavior-tree workflow executor.
//!
//! Walks a workflow's steps in declaration order, threads artifacts by
//! `output_variable`, emits task events for every step transition, and
//! honours the workflow's rollback policy. The executor never propagates
//! an error to its caller: every run ends in a structured
//! [`WorkflowOutcome`].

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::domain::error::EngineError;
use crate::domain::models::context::ExecutionContext;
use crate::domain::models::event::{TaskEvent, TaskEventPayload};
use crate::domain::models::transaction::OperationType;
use crate::domain::models::workflow::{
    StepError, WorkflowConfig, WorkflowOutcome, WorkflowStatus, WorkflowStep,
};
use crate::domain::ports::message_channel::MessageChannel;
use crate::domain::ports::tool_registry::{global_registry, ToolRegistry};
use crate::services::session::SessionState;
use crate::services::task_log::TaskLog;
use crate::services::transaction_manager::{Compensation, TransactionManager};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_.-]+)\}").expect("placeholder regex"));

/// Executes workflow configurations against a session.
pub struct WorkflowExecutor {
    log: Arc<TaskLog>,
    channel: Arc<dyn MessageChannel>,
    tools: Option<Arc<dyn ToolRegistry>>,
    transactions: Option<Arc<TransactionManager>>,
}

impl WorkflowExecutor {
    pub fn new(log: Arc<TaskLog>, channel: Arc<dyn MessageChannel>) -> Self {
        Self {
            log,
            channel,
            tools: None,
            transactions: None,
        }
    }

    /// Inject the shared tool registry.
    pub fn with_tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Wire the transaction manager used for rollback.
    pub fn with_transactions(mut self, transactions: Arc<TransactionManager>) -> Self {
        self.transactions = Some(transactions);
        self
    }

    /// Resolve a usable registry: injected first, global as the safety net.
    fn registry(&self) -> Option<Arc<dyn ToolRegistry>> {
        self.tools.clone().or_else(global_registry)
    }

    /// Run a workflow. The result is always structured; step failures are
    /// converted into [`StepError`]s, never propagated.
    #[instrument(skip_all, fields(task_id = %ctx.task_id(), workflow = config.name.as_deref().unwrap_or("unnamed")))]
    pub async fn execute(
        &self,
        config: &WorkflowConfig,
        ctx: &Arc<ExecutionContext>,
        session: &Arc<SessionState>,
    ) -> WorkflowOutcome {
        if let Err(e) = config.validate() {
            return WorkflowOutcome::new(
                WorkflowStatus::Failure,
                HashMap::new(),
                vec![StepError {
                    step_index: 0,
                    step_kind: "workflow".to_string(),
                    message: e.to_string(),
                }],
            );
        }

        let task_id = ctx.task_id().to_string();
        self.log.append(TaskEvent::new(
            &task_id,
            TaskEventPayload::TaskStarted {
                strategy: Some("behavior_tree".to_string()),
            },
        ));

        let steps = flatten_steps(&config.steps);
        let total = steps.len();
        let mut artifacts: HashMap<String, Value> = HashMap::new();
        let mut errors: Vec<StepError> = Vec::new();
        let mut undo: Vec<(String, Option<Value>)> = Vec::new();
        let mut succeeded = 0usize;
        let mut aborted = false;
        let mut cancelled = false;

        // Rollback routes through the transaction manager when wired: state
        // mutations register compensations on a generic transaction.
        let tx_id = if config.rollback_on_failure {
            match &self.transactions {
                Some(txm) => match txm
                    .start_transaction(OperationType::Generic, HashMap::new())
                    .await
                {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(error = %e, "could not open rollback transaction, using local undo");
                        None
                    }
                },
                None => None,
            }
        } else {
            None
        };

        for (index, step) in steps.iter().enumerate() {
            if let Err(e) = ctx.check_live() {
                if matches!(e, EngineError::Cancelled) {
                    cancelled = true;
                }
                errors.push(StepError {
                    step_index: index,
                    step_kind: step.kind().to_string(),
                    message: e.to_string(),
                });
                aborted = true;
                break;
            }

            let subtask_id = format!("{task_id}.step-{index}");
            self.log.append(TaskEvent::new(
                &task_id,
                TaskEventPayload::SubtaskStarted {
                    subtask_id: subtask_id.clone(),
                },
            ));

            match self
                .run_step(step, ctx, session, &artifacts, &mut undo, tx_id)
                .await
            {
                Ok(result) => {
                    succeeded += 1;
                    if let Some(variable) = step.output_variable() {
                        artifacts.insert(variable.to_string(), result.clone());
                    }
                    self.log.append(TaskEvent::new(
                        &task_id,
                        TaskEventPayload::SubtaskCompleted {
                            subtask_id,
                            result,
                        },
                    ));
                    self.log.append(TaskEvent::new(
                        &task_id,
                        TaskEventPayload::TaskProgress {
                            percent: (((index + 1) * 100) / total.max(1)) as u8,
                            message: None,
                        },
                    ));
                }
                Err(message) => {
                    debug!(step = index, error = %message, "workflow step failed");
                    // Failed tool steps still surface their outcome artifact.
                    if let (Some(variable), WorkflowStep::Tool { .. }) =
                        (step.output_variable(), *step)
                    {
                        artifacts.insert(
                            variable.to_string(),
                            json!({"result": Value::Null, "success": false, "error": message.clone()}),
                        );
                    }
                    errors.push(StepError {
                        step_index: index,
                        step_kind: step.kind().to_string(),
                        message,
                    });
                    if config.rollback_on_failure {
                        aborted = true;
                        break;
                    }
                }
            }
        }

        // Resolve the rollback policy.
        if aborted && config.rollback_on_failure {
            self.rollback(tx_id, session, &undo, if cancelled { "cancelled" } else { "step failed" })
                .await;
            artifacts.clear();
        } else if let Some(tx_id) = tx_id {
            if let Some(txm) = &self.transactions {
                if let Err(e) = txm.commit_transaction(tx_id).await {
                    warn!(error = %e, "failed to commit workflow transaction");
                }
            }
        }

        let status = if errors.is_empty() {
            WorkflowStatus::Success
        } else if aborted || succeeded == 0 {
            WorkflowStatus::Failure
        } else {
            WorkflowStatus::Partial
        };

        match status {
            WorkflowStatus::Failure => {
                self.log.append(TaskEvent::new(
                    &task_id,
                    TaskEventPayload::TaskFailed {
                        error: errors
                            .first()
                            .map(|e| e.message.clone())
                            .unwrap_or_else(|| "workflow failed".to_string()),
                        stack: None,
                        reason: cancelled.then(|| "cancelled".to_string()),
                    },
                ));
            }
            _ => {
                self.log.append(TaskEvent::new(
                    &task_id,
                    TaskEventPayload::TaskCompleted {
                        result: json!({
                            "artifacts": artifacts.keys().collect::<Vec<_>>(),
                            "errors": errors.len(),
                        }),
                    },
                ));
            }
        }

        session.merge_artifacts(&artifacts).await;
        WorkflowOutcome::new(status, artifacts, errors)
    }

    async fn rollback(
        &self,
        tx_id: Option<Uuid>,
        session: &Arc<SessionState>,
        undo: &[(String, Option<Value>)],
        reason: &str,
    ) {
        match (tx_id, &self.transactions) {
            (Some(tx_id), Some(txm)) => {
                if let Err(e) = txm.rollback_transaction(tx_id, reason).await {
                    warn!(error = %e, "transactional rollback failed, restoring locally");
                    session.restore(undo).await;
                }
            }
            _ => session.restore(undo).await,
        }
    }

    async fn run_step(
        &self,
        step: &WorkflowStep,
        ctx: &Arc<ExecutionContext>,
        session: &Arc<SessionState>,
        artifacts: &HashMap<String, Value>,
        undo: &mut Vec<(String, Option<Value>)>,
        tx_id: Option<Uuid>,
    ) -> Result<Value, String> {
        match step {
            WorkflowStep::Chat { message, .. } => {
                let variables = session.variables().await;
                let rendered = substitute(message, artifacts, &variables);
                self.channel
                    .send(session.session_id(), &rendered)
                    .await
                    .map_err(|e| e.to_string())?;
                session.record_message("agent", rendered.clone()).await;
                Ok(Value::String(rendered))
            }
            WorkflowStep::State { updates, .. } => {
                let previous = session.apply_updates(updates).await;
                if let (Some(tx_id), Some(txm)) = (tx_id, &self.transactions) {
                    let session = Arc::clone(session);
                    let captured = previous.clone();
                    let compensation: Compensation = Box::new(move || {
                        Box::pin(async move {
                            session.restore(&captured).await;
                            Ok(())
                        })
                    });
                    if let Err(e) = txm
                        .register_compensation(tx_id, "restore state", compensation)
                        .await
                    {
                        warn!(error = %e, "failed to register state compensation");
                    }
                }
                undo.extend(previous);
                Ok(json!(updates))
            }
            WorkflowStep::Query { query, query_type, .. } => {
                self.run_query(query, query_type.as_deref(), session).await
            }
            WorkflowStep::Tool { tool, operation, params, .. } => {
                let registry = self
                    .registry()
                    .ok_or_else(|| EngineError::ToolRegistryUnavailable.to_string())?;

                let variables = session.variables().await;
                let params: HashMap<String, Value> = params
                    .iter()
                    .map(|(k, v)| (k.clone(), substitute_value(v, artifacts, &variables)))
                    .collect();

                let invocation = registry.invoke(tool, operation, &params);
                let outcome = match remaining_budget(ctx) {
                    Some(budget) => tokio::time::timeout(budget, invocation)
                        .await
                        .map_err(|_| EngineError::Deadline.to_string())?,
                    None => invocation.await,
                }
                .map_err(|e| e.to_string())?;

                let artifact = json!({
                    "result": outcome.result,
                    "success": outcome.success,
                    "error": outcome.error.clone(),
                });
                if outcome.success {
                    Ok(artifact)
                } else {
                    Err(outcome
                        .error
                        .unwrap_or_else(|| format!("tool {tool} failed")))
                }
            }
            WorkflowStep::Step { .. } => {
                // Groups are flattened before execution.
                Ok(Value::Null)
            }
        }
    }

    async fn run_query(
        &self,
        query: &str,
        query_type: Option<&str>,
        session: &Arc<SessionState>,
    ) -> Result<Value, String> {
        match query_type.unwrap_or("state") {
            "capabilities" => {
                let registry = self
                    .registry()
                    .ok_or_else(|| EngineError::ToolRegistryUnavailable.to_string())?;
                let tools: Vec<Value> = registry
                    .list_tools()
                    .into_iter()
                    .map(|t| json!({"name": t.name, "operations": t.operations}))
                    .collect();
                Ok(json!({ "tools": tools }))
            }
            // State queries: a named variable, or the full map for "*".
            _ => {
                if query == "*" {
                    Ok(json!(session.variables().await))
                } else {
                    Ok(session.get_variable(query).await.unwrap_or(Value::Null))
                }
            }
        }
    }
}

/// Per-step time budget: the smaller of the configured timeout and the
/// remaining deadline. `None` means unbounded.
fn remaining_budget(ctx: &Arc<ExecutionContext>) -> Option<std::time::Duration> {
    let configured = ctx.config().timeout_ms;
    let from_config = (configured > 0).then(|| std::time::Duration::from_millis(configured));
    let from_deadline = ctx
        .get_remaining_time()
        .map(|d| d.to_std().unwrap_or(std::time::Duration::ZERO));

    match (from_config, from_deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Flatten grouping steps into a leaf walk, preserving declaration order.
fn flatten_steps(steps: &[WorkflowStep]) -> Vec<&WorkflowStep> {
    let mut out = Vec::new();
    for step in steps {
        match step {
            WorkflowStep::Step { steps, .. } => out.extend(flatten_steps(steps)),
            leaf => out.push(leaf),
        }
    }
    out
}

/// Replace `${name}` placeholders from artifacts, then session variables.
fn substitute(
    text: &str,
    artifacts: &HashMap<String, Value>,
    variables: &HashMap<String, Value>,
) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            artifacts
                .get(key)
                .or_else(|| variables.get(key))
                .map(value_to_text)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn substitute_value(
    value: &Value,
    artifacts: &HashMap<String, Value>,
    variables: &HashMap<String, Value>,
) -> Value {
    match value {
        Value::String(s) => {
            // A bare "${name}" passes the referenced value through untouched.
            if let Some(caps) = PLACEHOLDER.captures(s) {
                if caps.get(0).map(|m| m.as_str()) == Some(s.as_str()) {
                    if let Some(found) = artifacts.get(&caps[1]).or_else(|| variables.get(&caps[1]))
                    {
                        return found.clone();
                    }
                }
            }
            Value::String(substitute(s, artifacts, variables))
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute_value(v, artifacts, variables))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, artifacts, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_from_artifacts_then_variables() {
        let artifacts = HashMap::from([("name".to_string(), json!("artifact"))]);
        let variables = HashMap::from([
            ("name".to_string(), json!("variable")),
            ("count".to_string(), json!(3)),
        ]);

        assert_eq!(
            substitute("hello ${name}, ${count} times", &artifacts, &variables),
            "hello artifact, 3 times"
        );
        assert_eq!(
            substitute("missing ${nope}", &artifacts, &variables),
            "missing ${nope}"
        );
    }

    #[test]
    fn test_substitute_value_passthrough() {
        let artifacts = HashMap::from([("data".to_string(), json!({"x": 1}))]);
        let variables = HashMap::new();

        // Bare placeholder keeps the JSON shape.
        assert_eq!(
            substitute_value(&json!("${data}"), &artifacts, &variables),
            json!({"x": 1})
        );
        // Embedded placeholder renders to text.
        assert_eq!(
            substitute_value(&json!("got: ${data}"), &artifacts, &variables),
            json!("got: {\"x\":1}")
        );
    }

    #[test]
    fn test_flatten_preserves_order() {
        let steps = vec![
            WorkflowStep::Chat {
                message: "a".into(),
                output_variable: None,
            },
            WorkflowStep::Step {
                name: None,
                steps: vec![
                    WorkflowStep::Chat {
                        message: "b".into(),
                        output_variable: None,
                    },
                    WorkflowStep::Chat {
                        message: "c".into(),
                        output_variable: None,
                    },
                ],
            },
            WorkflowStep::Chat {
                message: "d".into(),
                output_variable: None,
            },
        ];

        let flat = flatten_steps(&steps);
        let messages: Vec<&str> = flat
            .iter()
            .map(|s| match s {
                WorkflowStep::Chat { message, .. } => message.as_str(),
                _ => "?",
            })
            .collect();
        assert_eq!(messages, vec!["a", "b", "c", "d"]);
    }
}
