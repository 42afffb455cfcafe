//! Execution strategies and tool invocation.
//!
//! A strategy turns one task declaration into work: `atomic` runs a single
//! unit, `decomposing` walks subtasks sequentially, `parallel` fans them
//! out bounded by the context's parallel limit. Strategy selection is by
//! task shape. A missing tool registry at construction only warns; calls
//! that need tools fail with `ToolRegistryUnavailable`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::domain::error::EngineError;
use crate::domain::models::context::{ChildOverrides, ExecutionContext};
use crate::domain::models::event::{TaskEvent, TaskEventPayload};
use crate::domain::models::task::TaskSpec;
use crate::domain::ports::llm_client::{LlmClient, PromptOptions};
use crate::domain::ports::tool_registry::{global_registry, ToolOutcome, ToolRegistry};
use crate::services::task_log::TaskLog;

/// Dependencies handed to every strategy.
#[derive(Clone)]
pub struct StrategyDeps {
    pub tool_registry: Option<Arc<dyn ToolRegistry>>,
    pub llm_client: Arc<dyn LlmClient>,
    pub log: Arc<TaskLog>,
}

impl StrategyDeps {
    /// Resolve a usable registry: injected, else the global safety net.
    pub fn registry(&self) -> Option<Arc<dyn ToolRegistry>> {
        self.tool_registry.clone().or_else(global_registry)
    }
}

/// Result of running one task through a strategy.
#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    pub success: bool,
    pub result: Value,
    pub error: Option<String>,
    /// Name of the strategy that ran.
    pub strategy: String,
    /// Per-subtask results for composite tasks.
    pub subtask_results: HashMap<String, Value>,
}

impl StrategyOutcome {
    fn ok(strategy: &str, result: Value) -> Self {
        Self {
            success: true,
            result,
            error: None,
            strategy: strategy.to_string(),
            subtask_results: HashMap::new(),
        }
    }

    fn err(strategy: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(error.into()),
            strategy: strategy.to_string(),
            subtask_results: HashMap::new(),
        }
    }
}

/// A named way of executing a task.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        task: &TaskSpec,
        ctx: &Arc<ExecutionContext>,
        deps: &StrategyDeps,
    ) -> StrategyOutcome;
}

/// Runs one unit of work: a tool invocation or an LLM completion.
pub struct AtomicStrategy;

#[async_trait]
impl ExecutionStrategy for AtomicStrategy {
    fn name(&self) -> &'static str {
        "atomic"
    }

    async fn execute(
        &self,
        task: &TaskSpec,
        ctx: &Arc<ExecutionContext>,
        deps: &StrategyDeps,
    ) -> StrategyOutcome {
        if let Err(e) = ctx.check_live() {
            return StrategyOutcome::err(self.name(), e.to_string());
        }

        if let Some(tool) = &task.tool {
            let operation = task.operation.as_deref().unwrap_or("run");
            return match invoke_tool_with_retry(deps, tool, operation, &task.params).await {
                Ok(outcome) => StrategyOutcome {
                    success: outcome.success,
                    error: outcome.error.clone(),
                    result: json!({
                        "result": outcome.result,
                        "success": outcome.success,
                        "error": outcome.error,
                    }),
                    strategy: self.name().to_string(),
                    subtask_results: HashMap::new(),
                },
                Err(e) => StrategyOutcome::err(self.name(), e.to_string()),
            };
        }

        if let Some(description) = &task.description {
            return match deps
                .llm_client
                .send_message(description, PromptOptions::default())
                .await
            {
                Ok(reply) => StrategyOutcome::ok(self.name(), Value::String(reply)),
                Err(e) => StrategyOutcome::err(self.name(), e.to_string()),
            };
        }

        StrategyOutcome::err(
            self.name(),
            EngineError::invalid_input("task has neither tool nor description").to_string(),
        )
    }
}

/// Walks subtasks sequentially under child contexts.
pub struct DecomposingStrategy;

#[async_trait]
impl ExecutionStrategy for DecomposingStrategy {
    fn name(&self) -> &'static str {
        "decomposing"
    }

    async fn execute(
        &self,
        task: &TaskSpec,
        ctx: &Arc<ExecutionContext>,
        deps: &StrategyDeps,
    ) -> StrategyOutcome {
        if !ctx.can_decompose() {
            return StrategyOutcome::err(
                self.name(),
                EngineError::DepthLimit {
                    depth: ctx.depth(),
                    max_depth: ctx.max_depth(),
                }
                .to_string(),
            );
        }

        deps.log.append(TaskEvent::new(
            &task.id,
            TaskEventPayload::TaskDecomposed {
                subtasks: task.subtasks.clone(),
            },
        ));

        let atomic = AtomicStrategy;
        let mut results = HashMap::new();
        for subtask_name in &task.subtasks {
            if let Err(e) = ctx.check_live() {
                return StrategyOutcome::err(self.name(), e.to_string());
            }

            let child_ctx = match ctx.create_child(subtask_name.clone(), ChildOverrides::default())
            {
                Ok(child) => child,
                Err(e) => return StrategyOutcome::err(self.name(), e.to_string()),
            };

            deps.log.append(TaskEvent::new(
                &task.id,
                TaskEventPayload::SubtaskStarted {
                    subtask_id: subtask_name.clone(),
                },
            ));

            let subtask = TaskSpec::new(subtask_name.clone()).with_description(subtask_name.clone());
            let outcome = atomic.execute(&subtask, &child_ctx, deps).await;
            if !outcome.success {
                return StrategyOutcome {
                    success: false,
                    result: json!(results),
                    error: outcome.error,
                    strategy: self.name().to_string(),
                    subtask_results: results,
                };
            }

            deps.log.append(TaskEvent::new(
                &task.id,
                TaskEventPayload::SubtaskCompleted {
                    subtask_id: subtask_name.clone(),
                    result: outcome.result.clone(),
                },
            ));
            results.insert(subtask_name.clone(), outcome.result);
        }

        StrategyOutcome {
            success: true,
            result: json!(results),
            error: None,
            strategy: self.name().to_string(),
            subtask_results: results,
        }
    }
}

/// Fans subtasks out concurrently, bounded by the context's parallel limit.
pub struct ParallelStrategy;

#[async_trait]
impl ExecutionStrategy for ParallelStrategy {
    fn name(&self) -> &'static str {
        "parallel"
    }

    async fn execute(
        &self,
        task: &TaskSpec,
        ctx: &Arc<ExecutionContext>,
        deps: &StrategyDeps,
    ) -> StrategyOutcome {
        if !ctx.can_decompose() {
            return StrategyOutcome::err(
                self.name(),
                EngineError::DepthLimit {
                    depth: ctx.depth(),
                    max_depth: ctx.max_depth(),
                }
                .to_string(),
            );
        }

        deps.log.append(TaskEvent::new(
            &task.id,
            TaskEventPayload::TaskDecomposed {
                subtasks: task.subtasks.clone(),
            },
        ));

        let limit = ctx.config().parallel_limit.max(1);
        let atomic = Arc::new(AtomicStrategy);

        let runs = task.subtasks.iter().map(|subtask_name| {
            let subtask_name = subtask_name.clone();
            let deps = deps.clone();
            let ctx = Arc::clone(ctx);
            let atomic = Arc::clone(&atomic);
            let parent_id = task.id.clone();
            async move {
                let child_ctx =
                    match ctx.create_child(subtask_name.clone(), ChildOverrides::default()) {
                        Ok(child) => child,
                        Err(e) => return (subtask_name, json!(null), Some(e.to_string())),
                    };
                deps.log.append(TaskEvent::new(
                    &parent_id,
                    TaskEventPayload::SubtaskStarted {
                        subtask_id: subtask_name.clone(),
                    },
                ));
                let subtask =
                    TaskSpec::new(subtask_name.clone()).with_description(subtask_name.clone());
                let outcome = atomic.execute(&subtask, &child_ctx, &deps).await;
                if outcome.success {
                    deps.log.append(TaskEvent::new(
                        &parent_id,
                        TaskEventPayload::SubtaskCompleted {
                            subtask_id: subtask_name.clone(),
                            result: outcome.result.clone(),
                        },
                    ));
                }
                (subtask_name, outcome.result, outcome.error)
            }
        });

        let runs: Vec<_> = runs.collect();
        let completed: Vec<(String, Value, Option<String>)> =
            stream::iter(runs).buffer_unordered(limit).collect().await;

        let mut results = HashMap::new();
        let mut first_error = None;
        for (name, result, error) in completed {
            if let Some(error) = error {
                first_error.get_or_insert(error);
            } else {
                results.insert(name, result);
            }
        }

        StrategyOutcome {
            success: first_error.is_none(),
            result: json!(results),
            error: first_error,
            strategy: self.name().to_string(),
            subtask_results: results,
        }
    }
}

/// Invoke a tool, retrying transient infrastructure failures with
/// exponential backoff. Tool-level failures (unsuccessful outcomes) are
/// not retried.
async fn invoke_tool_with_retry(
    deps: &StrategyDeps,
    tool: &str,
    operation: &str,
    params: &HashMap<String, Value>,
) -> Result<ToolOutcome, EngineError> {
    let registry = deps
        .registry()
        .ok_or(EngineError::ToolRegistryUnavailable)?;

    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(std::time::Duration::from_millis(200))
        .with_max_elapsed_time(Some(std::time::Duration::from_secs(10)))
        .build();

    backoff::future::retry(backoff, || {
        let registry = Arc::clone(&registry);
        async move {
            match registry.invoke(tool, operation, params).await {
                Ok(outcome) => Ok(outcome),
                Err(e) if e.is_transient() => {
                    debug!(tool, error = %e, "transient tool failure, retrying");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        }
    })
    .await
}

/// Selects a strategy by task shape and records lifecycle events.
pub struct StrategySelector {
    deps: StrategyDeps,
    strategies: HashMap<&'static str, Arc<dyn ExecutionStrategy>>,
}

impl StrategySelector {
    pub fn new(deps: StrategyDeps) -> Self {
        if deps.registry().is_none() {
            // Tool calls will fail with ToolRegistryUnavailable until a
            // registry is injected or installed globally.
            warn!("strategy selector constructed without a tool registry");
        }

        let mut strategies: HashMap<&'static str, Arc<dyn ExecutionStrategy>> = HashMap::new();
        strategies.insert("atomic", Arc::new(AtomicStrategy));
        strategies.insert("decomposing", Arc::new(DecomposingStrategy));
        strategies.insert("parallel", Arc::new(ParallelStrategy));

        Self { deps, strategies }
    }

    /// Late-bind the registry when construction happened without one.
    pub fn ensure_tool_registry(&mut self) -> bool {
        if self.deps.tool_registry.is_none() {
            self.deps.tool_registry = global_registry();
        }
        self.deps.tool_registry.is_some()
    }

    /// Pick a strategy from the task's shape.
    pub fn select(&self, task: &TaskSpec) -> Arc<dyn ExecutionStrategy> {
        let name = if !task.subtasks.is_empty() {
            let parallel_hint = task
                .params
                .get("parallel")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if parallel_hint {
                "parallel"
            } else {
                "decomposing"
            }
        } else {
            "atomic"
        };
        Arc::clone(self.strategies.get(name).expect("registered strategy"))
    }

    /// Look up a strategy by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ExecutionStrategy>> {
        self.strategies.get(name).cloned()
    }

    /// Execute a task under the selected strategy, recording `TASK_*`
    /// events through the log.
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub async fn execute_task(
        &self,
        task: &TaskSpec,
        ctx: &Arc<ExecutionContext>,
    ) -> StrategyOutcome {
        let strategy = self.select(task);

        self.deps.log.append(TaskEvent::new(
            &task.id,
            TaskEventPayload::TaskCreated {
                description: task.description.clone(),
            },
        ));
        self.deps.log.append(TaskEvent::new(
            &task.id,
            TaskEventPayload::TaskStarted {
                strategy: Some(strategy.name().to_string()),
            },
        ));

        let outcome = strategy.execute(task, ctx, &self.deps).await;

        if outcome.success {
            self.deps.log.append(TaskEvent::new(
                &task.id,
                TaskEventPayload::TaskCompleted {
                    result: outcome.result.clone(),
                },
            ));
        } else {
            self.deps.log.append(TaskEvent::new(
                &task.id,
                TaskEventPayload::TaskFailed {
                    error: outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| "strategy failed".to_string()),
                    stack: None,
                    reason: None,
                },
            ));
        }
        outcome
    }
}
