//! Domain error types for the Taskforge execution engine.
//!
//! Every error that crosses the public API surface is a variant of
//! [`EngineError`]. Service-internal failures are converted into this
//! taxonomy before they reach a caller; recoverable issues inside the log,
//! history, and audit services are logged and swallowed instead.

use thiserror::Error;

/// Transaction-specific failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// A transaction is already active on the repository.
    #[error("a transaction is already active on this repository")]
    Busy,

    /// The transaction exceeded its configured time budget.
    #[error("transaction timed out after {0} ms")]
    Timeout(u64),

    /// Rollback was attempted but could not restore the captured state.
    #[error("rollback failed: {0}")]
    RollbackFailed(String),
}

/// Compliance-reporting failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComplianceError {
    /// The requested compliance standard is not supported.
    #[error("unsupported compliance standard: {0}")]
    UnsupportedStandard(String),

    /// The audit chain failed integrity verification.
    #[error("audit integrity failure: {0}")]
    IntegrityFailure(String),
}

/// Errors surfaced to callers of the execution engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed construction arguments or request payloads.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An immutability or structural invariant was violated.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Context decomposition exceeded the configured depth limit.
    #[error("depth limit reached: depth {depth} with max_depth {max_depth}")]
    DepthLimit { depth: u32, max_depth: u32 },

    /// The enclosing context's deadline expired.
    #[error("deadline expired")]
    Deadline,

    /// The operation was cancelled through its context signal.
    #[error("operation cancelled")]
    Cancelled,

    /// The task graph contains one or more dependency cycles.
    #[error("circular dependency detected: {}", format_cycles(.0))]
    CircularDependency(Vec<Vec<String>>),

    /// Topological ordering could not cover the whole graph.
    #[error("dependency resolution failed: {0}")]
    DependencyResolution(String),

    /// No tool registry was available when a tool call was required.
    #[error("tool registry unavailable")]
    ToolRegistryUnavailable,

    /// A tool invocation failed.
    #[error("tool invocation failed: {0}")]
    ToolInvocation(String),

    /// The language-model client was unavailable or failed.
    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    /// Transactional operation failure.
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// Authentication or authorization failure.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Network-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// The upstream service reported a rate limit.
    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimit { retry_after_ms: u64 },

    /// A merge or state conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A repository-level failure (corruption, missing refs).
    #[error("repository error: {0}")]
    Repository(String),

    /// Compliance reporting or verification failure.
    #[error("compliance error: {0}")]
    Compliance(#[from] ComplianceError),

    /// An event-log replay range was out of bounds.
    #[error("invalid range: from {from} to {to} with log length {len}")]
    InvalidRange { from: u64, to: u64, len: u64 },

    /// Anything that did not match the taxonomy.
    #[error("unknown error: {0}")]
    Unknown(String),
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|c| c.join(" -> "))
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    /// Returns true if a retry of the failed operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::RateLimit { .. }
                | Self::LlmUnavailable(_)
                | Self::ToolInvocation(_)
        )
    }

    /// Returns true if this error represents a permanent failure.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::InvariantViolation(_)
                | Self::DepthLimit { .. }
                | Self::CircularDependency(_)
                | Self::Compliance(_)
                | Self::InvalidRange { .. }
        )
    }

    /// Shorthand for an [`EngineError::InvalidInput`].
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Shorthand for an [`EngineError::InvariantViolation`].
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}

/// Convenience alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;
