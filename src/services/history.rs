//! Bounded per-task history.
//!
//! Complement of the event-sourced log, optimised for recent-event
//! queries: a deque per task with size-based eviction and retention-based
//! pruning. Auto-pruning runs as a spawned task with a watch-channel stop
//! signal.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::domain::models::config::HistoryConfig;
use crate::domain::models::event::{TaskEvent, TaskEventType, TaskStatus};

/// Query over one task's recent history.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    /// Only events at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Only events at or before this time.
    pub until: Option<DateTime<Utc>>,
    /// Only these event types; empty means all.
    pub types: Vec<TaskEventType>,
    /// Only events that transition the task into this status.
    pub status: Option<TaskStatus>,
    /// At most this many events, newest retained.
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn since(mut self, time: DateTime<Utc>) -> Self {
        self.since = Some(time);
        self
    }

    pub fn until(mut self, time: DateTime<Utc>) -> Self {
        self.until = Some(time);
        self
    }

    pub fn types(mut self, types: impl IntoIterator<Item = TaskEventType>) -> Self {
        self.types = types.into_iter().collect();
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Event type that moves a task into the given status, if any.
fn status_event_type(status: TaskStatus) -> Option<TaskEventType> {
    match status {
        TaskStatus::Created => Some(TaskEventType::TaskCreated),
        TaskStatus::Executing => Some(TaskEventType::TaskStarted),
        TaskStatus::Evaluating => Some(TaskEventType::TaskEvaluating),
        TaskStatus::Decomposed => Some(TaskEventType::TaskDecomposed),
        TaskStatus::Completed => Some(TaskEventType::TaskCompleted),
        TaskStatus::Failed => Some(TaskEventType::TaskFailed),
        TaskStatus::Retrying => Some(TaskEventType::TaskRetrying),
        TaskStatus::Pending => None,
    }
}

/// Handle to the auto-pruning daemon.
pub struct PruneDaemonHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PruneDaemonHandle {
    /// Signal the daemon to stop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

/// Serialized history exchanged via `export`/`import`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryExport {
    pub history: Vec<TaskHistoryExport>,
    pub metadata: HistoryExportMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistoryExport {
    pub task_id: String,
    pub events: Vec<TaskEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryExportMetadata {
    pub exported_at: DateTime<Utc>,
    pub retention_ms: u64,
    pub max_history_per_task: usize,
}

/// Bounded, prunable per-task event history.
pub struct HistoryManager {
    config: HistoryConfig,
    histories: Arc<RwLock<HashMap<String, VecDeque<TaskEvent>>>>,
    daemon: tokio::sync::Mutex<Option<PruneDaemonHandle>>,
}

impl HistoryManager {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            histories: Arc::new(RwLock::new(HashMap::new())),
            daemon: tokio::sync::Mutex::new(None),
        }
    }

    /// Record an event, evicting the oldest entry past the per-task bound.
    pub async fn add_event(&self, event: TaskEvent) {
        let mut histories = self.histories.write().await;
        let deque = histories.entry(event.task_id.clone()).or_default();
        deque.push_back(event);
        while deque.len() > self.config.max_history_per_task {
            deque.pop_front();
        }
    }

    /// Query one task's history.
    pub async fn get_history(&self, task_id: &str, query: &HistoryQuery) -> Vec<TaskEvent> {
        let histories = self.histories.read().await;
        let Some(deque) = histories.get(task_id) else {
            return Vec::new();
        };

        let status_type = query.status.and_then(status_event_type);
        let mut events: Vec<TaskEvent> = deque
            .iter()
            .filter(|e| {
                if let Some(since) = query.since {
                    if e.timestamp < since {
                        return false;
                    }
                }
                if let Some(until) = query.until {
                    if e.timestamp > until {
                        return false;
                    }
                }
                if !query.types.is_empty() && !query.types.contains(&e.event_type()) {
                    return false;
                }
                if let Some(wanted) = status_type {
                    if e.event_type() != wanted {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        if let Some(limit) = query.limit {
            if events.len() > limit {
                events.drain(..events.len() - limit);
            }
        }
        events
    }

    /// All histories, keyed by task id.
    pub async fn get_all_histories(&self) -> HashMap<String, Vec<TaskEvent>> {
        let histories = self.histories.read().await;
        histories
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
            .collect()
    }

    /// Clear one task's history, or everything when `task_id` is `None`.
    pub async fn clear_history(&self, task_id: Option<&str>) {
        let mut histories = self.histories.write().await;
        match task_id {
            Some(id) => {
                histories.remove(id);
            }
            None => histories.clear(),
        }
    }

    /// Drop events older than the retention window; empty task deques are
    /// removed. Returns the number of events pruned.
    pub async fn prune_history(&self) -> u64 {
        let cutoff = Utc::now() - Duration::milliseconds(self.config.retention_ms as i64);
        let mut histories = self.histories.write().await;
        let mut pruned = 0u64;
        histories.retain(|_, deque| {
            let before = deque.len();
            deque.retain(|e| e.timestamp >= cutoff);
            pruned += (before - deque.len()) as u64;
            !deque.is_empty()
        });
        if pruned > 0 {
            debug!(pruned, "pruned expired history events");
        }
        pruned
    }

    /// Start the periodic pruning daemon. No-op when already running.
    pub async fn start_auto_pruning(self: &Arc<Self>) {
        let mut daemon = self.daemon.lock().await;
        if daemon.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let interval_ms = self.config.prune_interval_ms.max(1);
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.prune_history().await;
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("history auto-pruning stopped");
        });

        *daemon = Some(PruneDaemonHandle {
            stop: stop_tx,
            handle,
        });
    }

    /// Stop the pruning daemon. No-op when not running.
    pub async fn stop_auto_pruning(&self) {
        let handle = self.daemon.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Serialize all histories.
    pub async fn export(&self) -> HistoryExport {
        let histories = self.histories.read().await;
        HistoryExport {
            history: histories
                .iter()
                .map(|(task_id, events)| TaskHistoryExport {
                    task_id: task_id.clone(),
                    events: events.iter().cloned().collect(),
                })
                .collect(),
            metadata: HistoryExportMetadata {
                exported_at: Utc::now(),
                retention_ms: self.config.retention_ms,
                max_history_per_task: self.config.max_history_per_task,
            },
        }
    }

    /// Replace the contents with an exported history.
    pub async fn import(&self, export: HistoryExport) {
        let mut histories = self.histories.write().await;
        histories.clear();
        for task in export.history {
            let mut deque: VecDeque<TaskEvent> = task.events.into();
            while deque.len() > self.config.max_history_per_task {
                deque.pop_front();
            }
            histories.insert(task.task_id, deque);
        }
    }
}
