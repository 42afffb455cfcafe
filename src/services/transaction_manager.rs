//! Transaction manager for irreversible external operations.
//!
//! A transaction captures repository state (HEAD, branch, branches, stash)
//! at start, records every operation attempted inside it, and on rollback
//! dispatches a per-operation-type strategy against the git driver. The
//! manager owns the repository while a transaction is active: starting a
//! second one fails with `TransactionBusy`.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::error::{EngineError, EngineResult, TransactionError};
use crate::domain::models::config::TransactionConfig;
use crate::domain::models::transaction::{
    OperationRecord, OperationType, RepositorySnapshot, Transaction, TransactionMetrics,
    TransactionStatus,
};

/// Driver for the external repository. The real implementation shells out
/// to git; tests use [`RecordingGitDriver`].
#[async_trait]
pub trait GitDriver: Send + Sync {
    /// Capture the state a rollback would restore toward.
    async fn capture_state(&self) -> EngineResult<RepositorySnapshot>;

    /// Run an arbitrary repository operation, returning its output.
    async fn run(&self, operation: &str, args: &[String]) -> EngineResult<String>;

    /// `reset --hard <reference>`.
    async fn reset_hard(&self, reference: &str) -> EngineResult<()>;

    /// Delete a branch created during the transaction.
    async fn delete_branch(&self, branch: &str) -> EngineResult<()>;

    /// Abort an in-progress merge.
    async fn abort_merge(&self) -> EngineResult<()>;

    /// Pop the stash entry pushed during the transaction.
    async fn stash_pop(&self) -> EngineResult<()>;
}

/// Compensation registered on a generic transaction; run in reverse order
/// on rollback.
pub type Compensation =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = EngineResult<()>> + Send>> + Send>;

struct ActiveTransaction {
    tx: Transaction,
    timeout: Option<JoinHandle<()>>,
    compensations: Vec<(String, Compensation)>,
}

struct ManagerInner {
    active: Option<ActiveTransaction>,
    history: VecDeque<Transaction>,
    metrics: TransactionMetrics,
}

/// Manages capture/execute/commit/rollback for repository operations.
pub struct TransactionManager {
    driver: Arc<dyn GitDriver>,
    config: TransactionConfig,
    inner: tokio::sync::Mutex<ManagerInner>,
}

impl TransactionManager {
    pub fn new(driver: Arc<dyn GitDriver>, config: TransactionConfig) -> Self {
        Self {
            driver,
            config,
            inner: tokio::sync::Mutex::new(ManagerInner {
                active: None,
                history: VecDeque::new(),
                metrics: TransactionMetrics::default(),
            }),
        }
    }

    /// Begin a transaction, capturing repository state and installing the
    /// timeout. Fails with `TransactionBusy` while another is active.
    #[instrument(skip(self, metadata))]
    pub async fn start_transaction(
        self: &Arc<Self>,
        operation_type: OperationType,
        metadata: HashMap<String, Value>,
    ) -> EngineResult<Uuid> {
        {
            let inner = self.inner.lock().await;
            if inner.active.is_some() {
                return Err(TransactionError::Busy.into());
            }
        }

        let captured = self.driver.capture_state().await?;
        let tx = Transaction::new(operation_type, captured, metadata);
        let tx_id = tx.id;

        let timeout = if self.config.max_transaction_time_ms > 0 {
            let manager = Arc::clone(self);
            let budget = self.config.max_transaction_time_ms;
            Some(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(budget)).await;
                warn!(transaction = %tx_id, "transaction exceeded its time budget");
                if let Err(e) = manager.rollback_transaction(tx_id, "timeout").await {
                    error!(transaction = %tx_id, error = %e, "timeout rollback failed");
                }
            }))
        } else {
            None
        };

        let mut inner = self.inner.lock().await;
        inner.metrics.started += 1;
        inner.metrics.active += 1;
        inner.active = Some(ActiveTransaction {
            tx,
            timeout,
            compensations: Vec::new(),
        });
        info!(transaction = %tx_id, kind = %operation_type, "transaction started");
        Ok(tx_id)
    }

    /// Run an operation inside the transaction. On failure the attempt is
    /// recorded and, when configured, the transaction auto-rolls-back.
    #[instrument(skip(self, args), fields(transaction = %tx_id))]
    pub async fn execute_operation(
        self: &Arc<Self>,
        tx_id: Uuid,
        operation: &str,
        args: Vec<String>,
    ) -> EngineResult<String> {
        self.ensure_active(tx_id).await?;

        match self.driver.run(operation, &args).await {
            Ok(output) => {
                let mut inner = self.inner.lock().await;
                if let Some(active) = inner.active.as_mut() {
                    active
                        .tx
                        .operations
                        .push(OperationRecord::succeeded(operation, args));
                }
                Ok(output)
            }
            Err(e) => {
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(active) = inner.active.as_mut() {
                        active.tx.operations.push(OperationRecord::failed(
                            operation,
                            args,
                            e.to_string(),
                        ));
                    }
                }
                if self.config.auto_rollback_on_failure {
                    if let Err(rollback_err) = self
                        .rollback_transaction(tx_id, &format!("operation {operation} failed"))
                        .await
                    {
                        error!(error = %rollback_err, "auto-rollback failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Register a compensation on the active generic transaction.
    pub async fn register_compensation(
        &self,
        tx_id: Uuid,
        label: impl Into<String>,
        compensation: Compensation,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.active.as_mut() {
            Some(active) if active.tx.id == tx_id => {
                active.compensations.push((label.into(), compensation));
                Ok(())
            }
            _ => Err(EngineError::invalid_input(format!(
                "no active transaction {tx_id}"
            ))),
        }
    }

    /// Commit: finalise, clear the timeout, promote to history.
    #[instrument(skip(self), fields(transaction = %tx_id))]
    pub async fn commit_transaction(&self, tx_id: Uuid) -> EngineResult<Transaction> {
        let mut inner = self.inner.lock().await;
        let active = match inner.active.take() {
            Some(active) if active.tx.id == tx_id => active,
            other => {
                inner.active = other;
                return Err(EngineError::invalid_input(format!(
                    "no active transaction {tx_id}"
                )));
            }
        };

        if let Some(timeout) = active.timeout {
            timeout.abort();
        }
        let mut tx = active.tx;
        tx.status = TransactionStatus::Committed;
        tx.end_time = Some(Utc::now());

        inner.metrics.committed += 1;
        inner.metrics.active = inner.metrics.active.saturating_sub(1);
        push_history(&mut inner.history, tx.clone(), self.config.history_limit);
        info!(transaction = %tx_id, "transaction committed");
        Ok(tx)
    }

    /// Roll back using the per-operation-type strategy. The transaction
    /// always ends terminal; strategy failures surface after the fact.
    #[instrument(skip(self), fields(transaction = %tx_id))]
    pub async fn rollback_transaction(
        &self,
        tx_id: Uuid,
        reason: &str,
    ) -> EngineResult<Transaction> {
        let active = {
            let mut inner = self.inner.lock().await;
            match inner.active.take() {
                Some(active) if active.tx.id == tx_id => active,
                other => {
                    inner.active = other;
                    return Err(EngineError::invalid_input(format!(
                        "no active transaction {tx_id}"
                    )));
                }
            }
        };

        if let Some(timeout) = &active.timeout {
            timeout.abort();
        }
        let mut tx = active.tx;
        let compensations = active.compensations;

        let strategy_result = self.run_rollback_strategy(&mut tx, compensations).await;

        tx.status = TransactionStatus::RolledBack;
        tx.end_time = Some(Utc::now());
        tx.rollback_reason = Some(reason.to_string());

        let mut inner = self.inner.lock().await;
        inner.metrics.rolled_back += 1;
        inner.metrics.active = inner.metrics.active.saturating_sub(1);
        if strategy_result.is_err() {
            inner.metrics.rollback_failures += 1;
        }
        push_history(&mut inner.history, tx.clone(), self.config.history_limit);
        drop(inner);

        match strategy_result {
            Ok(()) => {
                info!(transaction = %tx_id, reason, "transaction rolled back");
                Ok(tx)
            }
            Err(e) => {
                error!(transaction = %tx_id, error = %e, "rollback strategy failed");
                Err(TransactionError::RollbackFailed(e.to_string()).into())
            }
        }
    }

    async fn run_rollback_strategy(
        &self,
        tx: &mut Transaction,
        compensations: Vec<(String, Compensation)>,
    ) -> EngineResult<()> {
        match tx.operation_type {
            OperationType::Commit => {
                let head = tx.captured_state.head.clone();
                self.driver.reset_hard(&head).await?;
                tx.operations
                    .push(OperationRecord::succeeded("reset --hard", vec![head]));
                Ok(())
            }
            OperationType::Branch => {
                for branch in tx.created_branches() {
                    self.driver.delete_branch(&branch).await?;
                    tx.operations
                        .push(OperationRecord::succeeded("branch -D", vec![branch]));
                }
                Ok(())
            }
            OperationType::Merge => {
                self.driver.abort_merge().await?;
                tx.operations
                    .push(OperationRecord::succeeded("merge --abort", vec![]));
                Ok(())
            }
            OperationType::Stash => {
                if tx.pushed_stash() {
                    self.driver.stash_pop().await?;
                    tx.operations
                        .push(OperationRecord::succeeded("stash pop", vec![]));
                }
                Ok(())
            }
            OperationType::Push => {
                // A push cannot be reversed without a force-push, which is
                // never attempted automatically.
                warn!(transaction = %tx.id, "push cannot be rolled back automatically");
                tx.operations.push(OperationRecord::succeeded(
                    "rollback-warning",
                    vec!["push is not automatically reversible".to_string()],
                ));
                Ok(())
            }
            OperationType::Generic => {
                for (label, compensation) in compensations.into_iter().rev() {
                    compensation().await.map_err(|e| {
                        EngineError::from(TransactionError::RollbackFailed(format!(
                            "compensation '{label}' failed: {e}"
                        )))
                    })?;
                    tx.operations
                        .push(OperationRecord::succeeded("compensate", vec![label]));
                }
                Ok(())
            }
        }
    }

    async fn ensure_active(&self, tx_id: Uuid) -> EngineResult<()> {
        let inner = self.inner.lock().await;
        match &inner.active {
            Some(active) if active.tx.id == tx_id => Ok(()),
            _ => Err(EngineError::invalid_input(format!(
                "no active transaction {tx_id}"
            ))),
        }
    }

    /// The active transaction, if any.
    pub async fn active_transaction(&self) -> Option<Transaction> {
        let inner = self.inner.lock().await;
        inner.active.as_ref().map(|a| a.tx.clone())
    }

    /// Terminal transactions, newest last.
    pub async fn history(&self) -> Vec<Transaction> {
        let inner = self.inner.lock().await;
        inner.history.iter().cloned().collect()
    }

    /// Current counters.
    pub async fn metrics(&self) -> TransactionMetrics {
        let inner = self.inner.lock().await;
        inner.metrics
    }
}

fn push_history(history: &mut VecDeque<Transaction>, tx: Transaction, limit: usize) {
    history.push_back(tx);
    while history.len() > limit.max(1) {
        history.pop_front();
    }
}

/// In-memory driver for tests: replays scripted results and records every
/// command it was asked to run.
#[derive(Default)]
pub struct RecordingGitDriver {
    /// Snapshot returned by `capture_state`.
    pub snapshot: RepositorySnapshot,
    /// Operations that should fail, by operation name.
    failing: std::sync::Mutex<std::collections::HashSet<String>>,
    commands: std::sync::Mutex<Vec<String>>,
}

impl RecordingGitDriver {
    pub fn new(snapshot: RepositorySnapshot) -> Self {
        Self {
            snapshot,
            failing: std::sync::Mutex::new(std::collections::HashSet::new()),
            commands: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Make an operation fail when run.
    pub fn fail_on(&self, operation: impl Into<String>) {
        self.failing.lock().expect("driver lock").insert(operation.into());
    }

    /// Every command executed, formatted as `op arg1 arg2`.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("driver lock").clone()
    }

    fn record(&self, command: String) {
        self.commands.lock().expect("driver lock").push(command);
    }

    fn check(&self, operation: &str) -> EngineResult<()> {
        if self.failing.lock().expect("driver lock").contains(operation) {
            return Err(EngineError::Repository(format!("{operation} rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl GitDriver for RecordingGitDriver {
    async fn capture_state(&self) -> EngineResult<RepositorySnapshot> {
        Ok(self.snapshot.clone())
    }

    async fn run(&self, operation: &str, args: &[String]) -> EngineResult<String> {
        self.check(operation)?;
        self.record(format!("{} {}", operation, args.join(" ")).trim().to_string());
        Ok(String::new())
    }

    async fn reset_hard(&self, reference: &str) -> EngineResult<()> {
        self.check("reset")?;
        self.record(format!("reset --hard {reference}"));
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> EngineResult<()> {
        self.check("branch -D")?;
        self.record(format!("branch -D {branch}"));
        Ok(())
    }

    async fn abort_merge(&self) -> EngineResult<()> {
        self.check("merge --abort")?;
        self.record("merge --abort".to_string());
        Ok(())
    }

    async fn stash_pop(&self) -> EngineResult<()> {
        self.check("stash pop")?;
        self.record("stash pop".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(head: &str) -> RepositorySnapshot {
        RepositorySnapshot {
            head: head.to_string(),
            branch: "main".to_string(),
            branches: vec!["main".to_string()],
            stash_count: 0,
            clean: true,
            captured_at: Utc::now(),
        }
    }

    fn manager(driver: Arc<RecordingGitDriver>) -> Arc<TransactionManager> {
        Arc::new(TransactionManager::new(
            driver,
            TransactionConfig {
                max_transaction_time_ms: 0,
                auto_rollback_on_failure: true,
                history_limit: 10,
            },
        ))
    }

    #[tokio::test]
    async fn test_failed_operation_auto_rolls_back_to_captured_head() {
        let driver = Arc::new(RecordingGitDriver::new(snapshot("abc123")));
        driver.fail_on("commit");
        let manager = manager(Arc::clone(&driver));

        let tx_id = manager
            .start_transaction(OperationType::Commit, HashMap::new())
            .await
            .unwrap();

        let err = manager
            .execute_operation(tx_id, "commit", vec!["-m".into(), "msg".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Repository(_)));

        // Auto-rollback fired the commit strategy.
        assert!(driver
            .commands()
            .contains(&"reset --hard abc123".to_string()));

        let history = manager.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TransactionStatus::RolledBack);

        let metrics = manager.metrics().await;
        assert_eq!(metrics.active, 0);
        assert_eq!(metrics.rolled_back, 1);
    }

    #[tokio::test]
    async fn test_second_transaction_is_busy() {
        let driver = Arc::new(RecordingGitDriver::new(snapshot("abc")));
        let manager = manager(driver);

        let _tx = manager
            .start_transaction(OperationType::Commit, HashMap::new())
            .await
            .unwrap();
        let err = manager
            .start_transaction(OperationType::Merge, HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Transaction(TransactionError::Busy));
    }

    #[tokio::test]
    async fn test_commit_promotes_to_history() {
        let driver = Arc::new(RecordingGitDriver::new(snapshot("abc")));
        let manager = manager(driver);

        let tx_id = manager
            .start_transaction(OperationType::Commit, HashMap::new())
            .await
            .unwrap();
        manager
            .execute_operation(tx_id, "commit", vec!["-m".into(), "ok".into()])
            .await
            .unwrap();
        let tx = manager.commit_transaction(tx_id).await.unwrap();

        assert_eq!(tx.status, TransactionStatus::Committed);
        assert_eq!(tx.operations.len(), 1);
        assert!(manager.active_transaction().await.is_none());
        assert!((manager.metrics().await.success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_branch_rollback_deletes_created_branches() {
        let driver = Arc::new(RecordingGitDriver::new(snapshot("abc")));
        let manager = manager(Arc::clone(&driver));

        let tx_id = manager
            .start_transaction(OperationType::Branch, HashMap::new())
            .await
            .unwrap();
        manager
            .execute_operation(tx_id, "branch", vec!["feature/x".into()])
            .await
            .unwrap();
        manager.rollback_transaction(tx_id, "test").await.unwrap();

        assert!(driver.commands().contains(&"branch -D feature/x".to_string()));
    }

    #[tokio::test]
    async fn test_stash_rollback_pops_only_when_pushed() {
        let driver = Arc::new(RecordingGitDriver::new(snapshot("abc")));
        let manager = manager(Arc::clone(&driver));

        // No stash push inside the transaction: no pop on rollback.
        let tx_id = manager
            .start_transaction(OperationType::Stash, HashMap::new())
            .await
            .unwrap();
        manager.rollback_transaction(tx_id, "test").await.unwrap();
        assert!(!driver.commands().contains(&"stash pop".to_string()));

        let tx_id = manager
            .start_transaction(OperationType::Stash, HashMap::new())
            .await
            .unwrap();
        manager
            .execute_operation(tx_id, "stash", vec!["push".into()])
            .await
            .unwrap();
        manager.rollback_transaction(tx_id, "test").await.unwrap();
        assert!(driver.commands().contains(&"stash pop".to_string()));
    }

    #[tokio::test]
    async fn test_push_rollback_warns_only() {
        let driver = Arc::new(RecordingGitDriver::new(snapshot("abc")));
        let manager = manager(Arc::clone(&driver));

        let tx_id = manager
            .start_transaction(OperationType::Push, HashMap::new())
            .await
            .unwrap();
        let tx = manager.rollback_transaction(tx_id, "test").await.unwrap();

        assert!(tx
            .operations
            .iter()
            .any(|op| op.operation == "rollback-warning"));
        // No force-push was attempted.
        assert!(driver.commands().iter().all(|c| !c.contains("push")));
    }

    #[tokio::test]
    async fn test_generic_rollback_runs_compensations_in_reverse() {
        let driver = Arc::new(RecordingGitDriver::new(snapshot("abc")));
        let manager = manager(driver);

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let tx_id = manager
            .start_transaction(OperationType::Generic, HashMap::new())
            .await
            .unwrap();

        for label in ["first", "second"] {
            let order = Arc::clone(&order);
            let compensation: Compensation = Box::new(move || {
                Box::pin(async move {
                    order.lock().unwrap().push(label);
                    Ok(())
                })
            });
            manager
                .register_compensation(tx_id, label, compensation)
                .await
                .unwrap();
        }

        manager.rollback_transaction(tx_id, "test").await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn test_rollback_failure_still_terminal() {
        let driver = Arc::new(RecordingGitDriver::new(snapshot("abc")));
        driver.fail_on("reset");
        let manager = manager(Arc::clone(&driver));

        let tx_id = manager
            .start_transaction(OperationType::Commit, HashMap::new())
            .await
            .unwrap();
        let err = manager.rollback_transaction(tx_id, "test").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Transaction(TransactionError::RollbackFailed(_))
        ));

        let history = manager.history().await;
        assert_eq!(history[0].status, TransactionStatus::RolledBack);
        assert_eq!(manager.metrics().await.rollback_failures, 1);
        assert!(manager.active_transaction().await.is_none());
    }

    #[tokio::test]
    async fn test_timeout_rolls_back() {
        let driver = Arc::new(RecordingGitDriver::new(snapshot("abc")));
        let manager = Arc::new(TransactionManager::new(
            Arc::clone(&driver) as Arc<dyn GitDriver>,
            TransactionConfig {
                max_transaction_time_ms: 20,
                auto_rollback_on_failure: true,
                history_limit: 10,
            },
        ));

        let _tx = manager
            .start_transaction(OperationType::Commit, HashMap::new())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;

        let history = manager.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].rollback_reason.as_deref(), Some("timeout"));
    }
}
