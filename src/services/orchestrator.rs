//! Agent runtime: the message surface over the execution engine.
//!
//! Receives external messages (`execute_bt`, `state_update`,
//! `tool_request`, `query`, `chat`, `export_state`, `shutdown`), maintains
//! per-session state, bridges the task log into the history manager, and
//! drives resolved task sets through the strategy layer. Callers always
//! get a structured response; failures surface as response payloads, not
//! errors.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{RwLock, Semaphore};
use tracing::{info, instrument, warn};

use crate::domain::error::{EngineError, EngineResult};
use crate::domain::models::audit::AuditOperation;
use crate::domain::models::config::EngineConfig;
use crate::domain::models::context::{ExecutionContext, RootOptions};
use crate::domain::models::event::EventFilter;
use crate::domain::models::task::{ResolutionPlan, TaskSpec};
use crate::domain::models::workflow::{WorkflowConfig, WorkflowOutcome};
use crate::domain::ports::llm_client::{ChatMessage, LlmClient, NullLlm};
use crate::domain::ports::message_channel::{BufferedChannel, MessageChannel};
use crate::domain::ports::tool_registry::ToolRegistry;
use crate::services::audit_trail::AuditTrail;
use crate::services::error_handler::ErrorHandler;
use crate::services::executor::WorkflowExecutor;
use crate::services::history::HistoryManager;
use crate::services::resolver::{DependencyResolver, ResolutionContext};
use crate::services::session::{SessionExport, SessionState};
use crate::services::strategy::{StrategyDeps, StrategyOutcome, StrategySelector};
use crate::services::task_log::TaskLog;
use crate::services::transaction_manager::TransactionManager;

/// Messages the runtime accepts from external collaborators.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    ExecuteBt {
        session_id: String,
        bt_config: Value,
        #[serde(default)]
        context: Option<Value>,
    },
    StateUpdate {
        updates: HashMap<String, Value>,
        from: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    ToolRequest {
        tool: String,
        operation: String,
        #[serde(default)]
        params: HashMap<String, Value>,
        session_id: String,
    },
    Query {
        query: String,
        #[serde(default)]
        query_type: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Chat {
        content: String,
        from: String,
        session_id: String,
    },
    ExportState {
        from: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    Shutdown {
        from: String,
    },
}

/// Structured responses; one per message kind.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentResponse {
    BtExecutionResult(WorkflowOutcome),
    Ack {
        acknowledged: bool,
        from: String,
    },
    ToolResponse {
        success: bool,
        result: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    QueryResponse {
        data: Value,
    },
    ChatResponse {
        content: String,
    },
    ExportedState {
        data: Value,
    },
    ShutdownComplete {
        from: String,
    },
}

/// The assembled runtime.
pub struct AgentRuntime {
    config: EngineConfig,
    log: Arc<TaskLog>,
    history: Arc<HistoryManager>,
    audit: Arc<AuditTrail>,
    errors: Arc<ErrorHandler>,
    resolver: DependencyResolver,
    executor: WorkflowExecutor,
    strategies: StrategySelector,
    llm: Arc<dyn LlmClient>,
    tools: Option<Arc<dyn ToolRegistry>>,
    sessions: RwLock<HashMap<String, Arc<SessionState>>>,
    workflow_permits: Semaphore,
}

/// Builder wiring for [`AgentRuntime`].
pub struct AgentRuntimeBuilder {
    config: EngineConfig,
    llm: Arc<dyn LlmClient>,
    tools: Option<Arc<dyn ToolRegistry>>,
    channel: Arc<dyn MessageChannel>,
    transactions: Option<Arc<TransactionManager>>,
}

impl AgentRuntimeBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            llm: Arc::new(NullLlm),
            tools: None,
            channel: Arc::new(BufferedChannel::new()),
            transactions: None,
        }
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = llm;
        self
    }

    pub fn tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn channel(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.channel = channel;
        self
    }

    pub fn transactions(mut self, transactions: Arc<TransactionManager>) -> Self {
        self.transactions = Some(transactions);
        self
    }

    pub fn build(self) -> Arc<AgentRuntime> {
        let log = Arc::new(TaskLog::new(self.config.log.clone()));
        let history = Arc::new(HistoryManager::new(self.config.history.clone()));
        let audit = Arc::new(AuditTrail::new(self.config.audit.clone()));
        let errors = Arc::new(
            ErrorHandler::new(self.config.errors.clone()).with_llm(Arc::clone(&self.llm)),
        );

        // Subscriber failures are compliance-relevant; route them to the
        // audit recorder.
        {
            let audit = Arc::clone(&audit);
            log.set_error_hook(Arc::new(move |subscriber, message| {
                let _ = audit.record_operation(AuditOperation {
                    operation_type: "subscriber_error".to_string(),
                    user: "system".to_string(),
                    timestamp: Some(Utc::now()),
                    details: HashMap::from([
                        ("subscriber".to_string(), json!(subscriber)),
                        ("error".to_string(), json!(message)),
                    ]),
                    entity_id: None,
                });
            }));
        }

        // Bridge appended events into the bounded history manager. The
        // subscriber runs synchronously on the appending task, so it only
        // enqueues; a spawned task drains into the async history API.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            log.subscribe(
                EventFilter::new(),
                Arc::new(move |event| {
                    let _ = tx.send(event.clone());
                }),
            );
            let history = Arc::clone(&history);
            handle.spawn(async move {
                while let Some(event) = rx.recv().await {
                    history.add_event(event).await;
                }
            });
        } else {
            warn!("no async runtime at build time, history bridge disabled");
        }

        let mut executor =
            WorkflowExecutor::new(Arc::clone(&log), Arc::clone(&self.channel));
        if let Some(tools) = &self.tools {
            executor = executor.with_tools(Arc::clone(tools));
        }
        if let Some(transactions) = &self.transactions {
            executor = executor.with_transactions(Arc::clone(transactions));
        }

        let strategies = StrategySelector::new(StrategyDeps {
            tool_registry: self.tools.clone(),
            llm_client: Arc::clone(&self.llm),
            log: Arc::clone(&log),
        });

        let parallel_limit = self.config.context.parallel_limit.max(1);
        Arc::new(AgentRuntime {
            config: self.config,
            log,
            history,
            audit,
            errors,
            resolver: DependencyResolver::new(),
            executor,
            strategies,
            llm: self.llm,
            tools: self.tools,
            sessions: RwLock::new(HashMap::new()),
            workflow_permits: Semaphore::new(parallel_limit),
        })
    }
}

impl AgentRuntime {
    /// Shared journal.
    pub fn log(&self) -> &Arc<TaskLog> {
        &self.log
    }

    /// Bounded history.
    pub fn history(&self) -> &Arc<HistoryManager> {
        &self.history
    }

    /// Audit trail.
    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    /// Error handler.
    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    async fn session(&self, session_id: &str) -> Arc<SessionState> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(session_id) {
                return Arc::clone(session);
            }
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(SessionState::new(session_id))),
        )
    }

    /// Handle one external message. Always returns a structured response.
    #[instrument(skip_all)]
    pub async fn handle_message(&self, message: AgentMessage) -> AgentResponse {
        match message {
            AgentMessage::ExecuteBt {
                session_id,
                bt_config,
                context,
            } => self.handle_execute_bt(&session_id, bt_config, context).await,
            AgentMessage::StateUpdate {
                updates,
                from,
                session_id,
            } => {
                let session = self
                    .session(session_id.as_deref().unwrap_or(&from))
                    .await;
                session.apply_updates(&updates).await;
                self.audit_op("state_update", &from, None);
                AgentResponse::Ack {
                    acknowledged: true,
                    from,
                }
            }
            AgentMessage::ToolRequest {
                tool,
                operation,
                params,
                session_id,
            } => self.handle_tool_request(&tool, &operation, params, &session_id).await,
            AgentMessage::Query {
                query,
                query_type,
                session_id,
            } => {
                let session = self
                    .session(session_id.as_deref().unwrap_or("default"))
                    .await;
                let data = self
                    .run_query(&query, query_type.as_deref(), &session)
                    .await;
                AgentResponse::QueryResponse { data }
            }
            AgentMessage::Chat {
                content,
                from,
                session_id,
            } => self.handle_chat(&content, &from, &session_id).await,
            AgentMessage::ExportState { from, session_id } => {
                let session = self
                    .session(session_id.as_deref().unwrap_or(&from))
                    .await;
                let SessionExport {
                    context_variables,
                    history,
                    artifacts,
                } = session.export().await;
                AgentResponse::ExportedState {
                    data: json!({
                        "state": {
                            "contextVariables": context_variables,
                            "history": history,
                            "artifacts": artifacts,
                        }
                    }),
                }
            }
            AgentMessage::Shutdown { from } => {
                info!(from = %from, "shutdown requested");
                self.history.stop_auto_pruning().await;
                self.audit_op("shutdown", &from, None);
                AgentResponse::ShutdownComplete { from }
            }
        }
    }

    async fn handle_execute_bt(
        &self,
        session_id: &str,
        bt_config: Value,
        context: Option<Value>,
    ) -> AgentResponse {
        let config = match WorkflowConfig::from_value(bt_config) {
            Ok(config) => config,
            Err(e) => {
                return AgentResponse::BtExecutionResult(WorkflowOutcome::new(
                    crate::domain::models::workflow::WorkflowStatus::Failure,
                    HashMap::new(),
                    vec![crate::domain::models::workflow::StepError {
                        step_index: 0,
                        step_kind: "workflow".to_string(),
                        message: e.to_string(),
                    }],
                ));
            }
        };

        // Workflow instances share the process-wide worker pool.
        let _permit = self
            .workflow_permits
            .acquire()
            .await
            .expect("workflow semaphore closed");

        let session = self.session(session_id).await;
        let mut user_context = HashMap::new();
        if let Some(Value::Object(map)) = context {
            user_context = map.into_iter().collect();
        }

        let deadline = (self.config.context.timeout_ms > 0).then(|| {
            Utc::now() + chrono::Duration::milliseconds(self.config.context.timeout_ms as i64)
        });
        let ctx = ExecutionContext::create_root(RootOptions {
            session_id: Some(session_id.to_string()),
            config: self.config.context.clone(),
            deadline,
            user_context,
            ..RootOptions::default()
        });

        self.log.start_correlation(ctx.correlation_id().to_string());
        let outcome = self.executor.execute(&config, &ctx, &session).await;
        self.log.end_correlation();

        self.audit_op(
            "bt_execution",
            session_id,
            Some(json!({
                "workflow": config.name,
                "status": outcome.status,
                "errors": outcome.errors.len(),
            })),
        );
        AgentResponse::BtExecutionResult(outcome)
    }

    async fn handle_tool_request(
        &self,
        tool: &str,
        operation: &str,
        params: HashMap<String, Value>,
        session_id: &str,
    ) -> AgentResponse {
        let Some(registry) = self
            .tools
            .clone()
            .or_else(crate::domain::ports::tool_registry::global_registry)
        else {
            return AgentResponse::ToolResponse {
                success: false,
                result: Value::Null,
                error: Some(EngineError::ToolRegistryUnavailable.to_string()),
            };
        };

        let service = format!("tool:{tool}");
        let invocation = self
            .errors
            .guard(&service, || registry.invoke(tool, operation, &params))
            .await;

        self.audit_op(
            "tool_invocation",
            session_id,
            Some(json!({"tool": tool, "operation": operation})),
        );

        match invocation {
            Ok(outcome) => AgentResponse::ToolResponse {
                success: outcome.success,
                result: outcome.result,
                error: outcome.error,
            },
            Err(e) => AgentResponse::ToolResponse {
                success: false,
                result: Value::Null,
                error: Some(e.to_string()),
            },
        }
    }

    async fn handle_chat(&self, content: &str, from: &str, session_id: &str) -> AgentResponse {
        let session = self.session(session_id).await;
        session.record_message(from, content).await;

        let mut messages = vec![ChatMessage::system(
            "You are a task-execution agent. Answer briefly.",
        )];
        for record in session.history().await.iter().rev().take(10).rev() {
            messages.push(ChatMessage {
                role: if record.from == "agent" {
                    "assistant".to_string()
                } else {
                    "user".to_string()
                },
                content: record.content.clone(),
            });
        }

        let reply = match self.llm.complete(&messages).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "chat completion unavailable");
                format!("Unable to respond right now ({e}).")
            }
        };
        session.record_message("agent", reply.clone()).await;
        AgentResponse::ChatResponse { content: reply }
    }

    async fn run_query(
        &self,
        query: &str,
        query_type: Option<&str>,
        session: &Arc<SessionState>,
    ) -> Value {
        match query_type.unwrap_or("state") {
            "capabilities" => {
                let tools = self
                    .tools
                    .clone()
                    .or_else(crate::domain::ports::tool_registry::global_registry)
                    .map(|registry| {
                        registry
                            .list_tools()
                            .into_iter()
                            .map(|t| json!({"name": t.name, "operations": t.operations}))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                json!({ "tools": tools })
            }
            "stats" => json!({
                "log": self.log.get_stats(),
                "audit": self.audit.stats(),
                "circuits": self.errors.circuit_stats(),
            }),
            _ => {
                if query == "*" {
                    json!(session.variables().await)
                } else {
                    session.get_variable(query).await.unwrap_or(Value::Null)
                }
            }
        }
    }

    /// Resolve a task set and run it group by group: members of a parallel
    /// group run concurrently (bounded by `parallel_limit`), groups run in
    /// order.
    #[instrument(skip_all, fields(tasks = tasks.len()))]
    pub async fn run_tasks(
        self: &Arc<Self>,
        tasks: Vec<TaskSpec>,
        analyze_semantic_dependencies: bool,
    ) -> EngineResult<(ResolutionPlan, HashMap<String, StrategyOutcome>)> {
        let resolution_ctx = ResolutionContext {
            analyze_semantic_dependencies,
            llm: analyze_semantic_dependencies.then(|| Arc::clone(&self.llm)),
            tools: self.tools.clone(),
            ..ResolutionContext::new()
        };
        let plan = self
            .resolver
            .resolve_dependencies(&tasks, &resolution_ctx)
            .await?;

        let root = ExecutionContext::create_root(RootOptions {
            config: self.config.context.clone(),
            ..RootOptions::default()
        });

        let mut outcomes: HashMap<String, StrategyOutcome> = HashMap::new();
        for group in &plan.parallel_groups {
            let mut handles = Vec::new();
            for task_id in group {
                let Some(node) = plan.dependency_graph.get(task_id) else {
                    continue;
                };
                let task = node.task.clone();
                let ctx = root.create_child(task_id.clone(), Default::default())?;
                let runtime = Arc::clone(self);
                handles.push(tokio::spawn(async move {
                    let _permit = runtime
                        .workflow_permits
                        .acquire()
                        .await
                        .expect("workflow semaphore closed");
                    let outcome = runtime.strategies.execute_task(&task, &ctx).await;
                    (task.id.clone(), outcome)
                }));
            }
            for handle in handles {
                match handle.await {
                    Ok((task_id, outcome)) => {
                        outcomes.insert(task_id, outcome);
                    }
                    Err(e) => warn!(error = %e, "task join failed"),
                }
            }
        }

        Ok((plan, outcomes))
    }

    fn audit_op(&self, operation: &str, user: &str, details: Option<Value>) {
        let mut detail_map = HashMap::new();
        if let Some(Value::Object(map)) = details {
            detail_map = map.into_iter().collect();
        }
        if let Err(e) = self.audit.record_operation(AuditOperation {
            operation_type: operation.to_string(),
            user: user.to_string(),
            timestamp: Some(Utc::now()),
            details: detail_map,
            entity_id: None,
        }) {
            warn!(error = %e, "audit record failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::llm_client::ScriptedLlm;

    fn runtime() -> Arc<AgentRuntime> {
        AgentRuntimeBuilder::new(EngineConfig::default())
            .llm(Arc::new(ScriptedLlm::new(["hello from the model"])))
            .build()
    }

    #[tokio::test]
    async fn test_state_update_and_query() {
        let runtime = runtime();

        let response = runtime
            .handle_message(AgentMessage::StateUpdate {
                updates: HashMap::from([("mode".to_string(), json!("fast"))]),
                from: "tester".to_string(),
                session_id: Some("s1".to_string()),
            })
            .await;
        assert!(matches!(response, AgentResponse::Ack { acknowledged: true, .. }));

        let response = runtime
            .handle_message(AgentMessage::Query {
                query: "mode".to_string(),
                query_type: None,
                session_id: Some("s1".to_string()),
            })
            .await;
        match response {
            AgentResponse::QueryResponse { data } => assert_eq!(data, json!("fast")),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_chat_round_trip() {
        let runtime = runtime();
        let response = runtime
            .handle_message(AgentMessage::Chat {
                content: "hi".to_string(),
                from: "user".to_string(),
                session_id: "s1".to_string(),
            })
            .await;
        match response {
            AgentResponse::ChatResponse { content } => {
                assert_eq!(content, "hello from the model");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_export_state_shape() {
        let runtime = runtime();
        runtime
            .handle_message(AgentMessage::StateUpdate {
                updates: HashMap::from([("k".to_string(), json!(1))]),
                from: "s1".to_string(),
                session_id: Some("s1".to_string()),
            })
            .await;

        let response = runtime
            .handle_message(AgentMessage::ExportState {
                from: "s1".to_string(),
                session_id: Some("s1".to_string()),
            })
            .await;
        match response {
            AgentResponse::ExportedState { data } => {
                assert_eq!(data["state"]["contextVariables"]["k"], json!(1));
                assert!(data["state"].get("history").is_some());
                assert!(data["state"].get("artifacts").is_some());
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_request_without_registry_fails_cleanly() {
        let runtime = runtime();
        let response = runtime
            .handle_message(AgentMessage::ToolRequest {
                tool: "linter".to_string(),
                operation: "run".to_string(),
                params: HashMap::new(),
                session_id: "s1".to_string(),
            })
            .await;
        match response {
            AgentResponse::ToolResponse { success, error, .. } => {
                assert!(!success);
                assert!(error.unwrap().contains("tool registry unavailable"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_message_deserialization() {
        let message: AgentMessage = serde_json::from_value(json!({
            "type": "execute_bt",
            "session_id": "s1",
            "bt_config": {"steps": [{"type": "chat", "message": "hi"}]}
        }))
        .unwrap();
        assert!(matches!(message, AgentMessage::ExecuteBt { .. }));
    }
}
