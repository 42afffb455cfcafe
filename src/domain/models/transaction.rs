//! Transaction records for irreversible external operations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What kind of repository operation a transaction wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Commit,
    Branch,
    Merge,
    Push,
    Stash,
    Generic,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Branch => "branch",
            Self::Merge => "merge",
            Self::Push => "push",
            Self::Stash => "stash",
            Self::Generic => "generic",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "committed")]
    Committed,
    #[serde(rename = "rolled-back")]
    RolledBack,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// One operation attempted inside a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: Uuid,
    /// The operation name (e.g. `commit`, `checkout -b`).
    pub operation: String,
    pub args: Vec<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OperationRecord {
    pub fn succeeded(operation: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            args,
            success: true,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(operation: impl Into<String>, args: Vec<String>, error: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            args,
            success: false,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Repository state captured when a transaction starts, used for rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySnapshot {
    /// HEAD commit hash.
    pub head: String,
    /// Checked-out branch.
    pub branch: String,
    /// Branches existing at capture time.
    pub branches: Vec<String>,
    /// Stash entries at capture time.
    pub stash_count: usize,
    /// Whether the working tree was clean.
    pub clean: bool,
    pub captured_at: DateTime<Utc>,
}

impl Default for RepositorySnapshot {
    fn default() -> Self {
        Self {
            head: String::new(),
            branch: String::new(),
            branches: Vec::new(),
            stash_count: 0,
            clean: true,
            captured_at: Utc::now(),
        }
    }
}

/// A transaction wrapping external repository operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub operation_type: OperationType,
    pub status: TransactionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Operations attempted, in order.
    pub operations: Vec<OperationRecord>,
    /// State captured at start; rollback restores toward this.
    pub captured_state: RepositorySnapshot,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Why the transaction was rolled back, when it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_reason: Option<String>,
}

impl Transaction {
    pub fn new(
        operation_type: OperationType,
        captured_state: RepositorySnapshot,
        metadata: HashMap<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_type,
            status: TransactionStatus::Active,
            start_time: Utc::now(),
            end_time: None,
            operations: Vec::new(),
            captured_state,
            metadata,
            rollback_reason: None,
        }
    }

    /// Branches created by operations inside this transaction.
    pub fn created_branches(&self) -> Vec<String> {
        self.operations
            .iter()
            .filter(|op| op.success && op.operation == "branch")
            .filter_map(|op| op.args.first().cloned())
            .collect()
    }

    /// Whether a successful stash push happened inside this transaction.
    pub fn pushed_stash(&self) -> bool {
        self.operations
            .iter()
            .any(|op| op.success && op.operation == "stash" && op.args.first().is_some_and(|a| a == "push"))
    }
}

/// Counters kept by the transaction manager.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TransactionMetrics {
    pub started: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub rollback_failures: u64,
    pub active: u64,
}

impl TransactionMetrics {
    /// Committed transactions over terminal transactions.
    pub fn success_rate(&self) -> f64 {
        let terminal = self.committed + self.rolled_back;
        if terminal == 0 {
            return 0.0;
        }
        self.committed as f64 / terminal as f64
    }

    /// Rolled-back transactions over terminal transactions.
    pub fn rollback_rate(&self) -> f64 {
        let terminal = self.committed + self.rolled_back;
        if terminal == 0 {
            return 0.0;
        }
        self.rolled_back as f64 / terminal as f64
    }
}
