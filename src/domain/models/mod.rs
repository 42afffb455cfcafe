//! Domain models for the Taskforge engine.

pub mod audit;
pub mod config;
pub mod context;
pub mod event;
pub mod task;
pub mod transaction;
pub mod workflow;

pub use audit::{
    AuditFilter, AuditOperation, AuditRecord, AuditStats, ComplianceLevel, ComplianceReport,
    ComplianceStandard, IntegrityReport, GENESIS_HASH,
};
pub use config::{
    AuditConfig, ContextDefaults, EngineConfig, ErrorHandlerConfig, HistoryConfig, LoggingConfig,
    TaskLogConfig, TransactionConfig,
};
pub use context::{
    Artifact, Breadcrumb, CancelSignal, ChildOverrides, ContextObject, ExecutionContext,
    RootOptions, TraceEntry,
};
pub use event::{
    apply_event, EventFilter, Snapshot, TaskEvent, TaskEventPayload, TaskEventType, TaskState,
    TaskStatus,
};
pub use task::{
    DependencyEdge, DependencyNode, EdgeKind, ResolutionMetadata, ResolutionPlan,
    ResourceRequirements, TaskSpec,
};
pub use transaction::{
    OperationRecord, OperationType, RepositorySnapshot, Transaction, TransactionMetrics,
    TransactionStatus,
};
pub use workflow::{StepError, WorkflowConfig, WorkflowOutcome, WorkflowStatus, WorkflowStep};
