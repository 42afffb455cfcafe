//! Taskforge - a multi-agent task-execution runtime.
//!
//! Configurable agents receive messages, decompose work into dependency-
//! resolved subtasks, run them through a behavior-tree/strategy executor,
//! record every state change in an event-sourced task log, and coordinate
//! real tool invocations with transactional rollback and compliance
//! auditing.

pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export the types most callers need.
pub use domain::error::{ComplianceError, EngineError, EngineResult, TransactionError};
pub use domain::models::config::EngineConfig;
pub use domain::models::context::{ExecutionContext, RootOptions};
pub use domain::models::workflow::{WorkflowConfig, WorkflowOutcome, WorkflowStatus};
pub use services::orchestrator::{AgentMessage, AgentResponse, AgentRuntime, AgentRuntimeBuilder};
