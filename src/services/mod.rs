//! Application services for the Taskforge engine.

pub mod audit_trail;
pub mod circuit_breaker;
pub mod error_handler;
pub mod executor;
pub mod external_executors;
pub mod history;
pub mod log_analysis;
pub mod orchestrator;
pub mod resolver;
pub mod session;
pub mod strategy;
pub mod task_log;
pub mod transaction_manager;

pub use audit_trail::AuditTrail;
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, CircuitStats,
};
pub use error_handler::{
    parse_reset_interval, ErrorClass, ErrorHandler, ErrorInfo, ErrorMetrics, ErrorSeverity,
    RecoveryHook, RecoveryHooks, RecoveryOutcome,
};
pub use executor::WorkflowExecutor;
pub use external_executors::{
    LintExecutor, LintFinding, LintReport, TestCase, TestExecutor, TestReport, ToolCommand,
};
pub use history::{HistoryExport, HistoryManager, HistoryQuery, PruneDaemonHandle};
pub use log_analysis::{
    CausalChain, ErrorCluster, InvocationRecord, LogAnalyzer, PerformanceTrend,
};
pub use orchestrator::{AgentMessage, AgentResponse, AgentRuntime, AgentRuntimeBuilder};
pub use resolver::{
    estimate_task_time, DependencyResolver, ResolutionContext, COMPOSITE_TASK_TIME_MULTIPLIER,
    DEFAULT_TASK_TIME_ESTIMATE, MAX_TASK_TIME_ESTIMATE, MIN_TASK_TIME_ESTIMATE,
    TEXT_LENGTH_TIME_MULTIPLIER, TOOL_EXECUTION_BASE_TIME,
};
pub use session::{ChatRecord, SessionExport, SessionState};
pub use strategy::{
    AtomicStrategy, DecomposingStrategy, ExecutionStrategy, ParallelStrategy, StrategyDeps,
    StrategyOutcome, StrategySelector,
};
pub use task_log::{
    EventCallback, ReplayResult, SubscriptionHandle, TaskLog, TaskLogExport, TaskLogStats,
};
pub use transaction_manager::{
    Compensation, GitDriver, RecordingGitDriver, TransactionManager,
};
