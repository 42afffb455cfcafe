//! Task lifecycle events and the projection fold.
//!
//! Events are immutable once appended; the per-task state view is derived
//! by folding [`apply_event`] over the journal (optionally starting from a
//! snapshot).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminant of a task event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskEventType {
    TaskCreated,
    TaskStarted,
    TaskEvaluating,
    TaskDecomposed,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    TaskRetrying,
    SubtaskStarted,
    SubtaskCompleted,
}

impl TaskEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "TASK_CREATED",
            Self::TaskStarted => "TASK_STARTED",
            Self::TaskEvaluating => "TASK_EVALUATING",
            Self::TaskDecomposed => "TASK_DECOMPOSED",
            Self::TaskProgress => "TASK_PROGRESS",
            Self::TaskCompleted => "TASK_COMPLETED",
            Self::TaskFailed => "TASK_FAILED",
            Self::TaskRetrying => "TASK_RETRYING",
            Self::SubtaskStarted => "SUBTASK_STARTED",
            Self::SubtaskCompleted => "SUBTASK_COMPLETED",
        }
    }

    /// Terminal events retire the task's context.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TaskCompleted | Self::TaskFailed)
    }
}

impl std::fmt::Display for TaskEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload of a task event. The variant doubles as the event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskEventPayload {
    TaskCreated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    TaskStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strategy: Option<String>,
    },
    TaskEvaluating,
    TaskDecomposed {
        subtasks: Vec<String>,
    },
    TaskProgress {
        percent: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    TaskCompleted {
        result: Value,
    },
    TaskFailed {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    TaskRetrying {
        attempt: u32,
    },
    SubtaskStarted {
        subtask_id: String,
    },
    SubtaskCompleted {
        subtask_id: String,
        result: Value,
    },
}

impl TaskEventPayload {
    /// The event type this payload represents.
    pub fn event_type(&self) -> TaskEventType {
        match self {
            Self::TaskCreated { .. } => TaskEventType::TaskCreated,
            Self::TaskStarted { .. } => TaskEventType::TaskStarted,
            Self::TaskEvaluating => TaskEventType::TaskEvaluating,
            Self::TaskDecomposed { .. } => TaskEventType::TaskDecomposed,
            Self::TaskProgress { .. } => TaskEventType::TaskProgress,
            Self::TaskCompleted { .. } => TaskEventType::TaskCompleted,
            Self::TaskFailed { .. } => TaskEventType::TaskFailed,
            Self::TaskRetrying { .. } => TaskEventType::TaskRetrying,
            Self::SubtaskStarted { .. } => TaskEventType::SubtaskStarted,
            Self::SubtaskCompleted { .. } => TaskEventType::SubtaskCompleted,
        }
    }
}

/// One immutable entry in the task journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Monotonically increasing id assigned on append.
    pub sequence_id: u64,
    /// Append time.
    pub timestamp: DateTime<Utc>,
    /// Aggregate (task) the event belongs to.
    pub task_id: String,
    /// Correlation id active when the event was appended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Typed payload; its variant is the event type.
    pub payload: TaskEventPayload,
}

impl TaskEvent {
    /// Build an unsequenced event; the log assigns `sequence_id` on append.
    pub fn new(task_id: impl Into<String>, payload: TaskEventPayload) -> Self {
        Self {
            sequence_id: 0,
            timestamp: Utc::now(),
            task_id: task_id.into(),
            correlation_id: None,
            payload,
        }
    }

    pub fn event_type(&self) -> TaskEventType {
        self.payload.event_type()
    }
}

/// Status of a task as projected from its events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Created,
    Executing,
    Evaluating,
    Decomposed,
    Completed,
    Failed,
    Retrying,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Created => "created",
            Self::Executing => "executing",
            Self::Evaluating => "evaluating",
            Self::Decomposed => "decomposed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }
}

/// Derived per-task state view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluating_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decomposed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrying_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
    pub retry_count: u32,
    /// Completion percentage in `[0, 100]`.
    pub progress: u8,
    pub subtasks: Vec<String>,
    pub active_subtasks: Vec<String>,
    pub completed_subtasks: Vec<String>,
    pub subtask_results: HashMap<String, Value>,
    /// Wall-clock duration from start to terminal event, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl TaskState {
    /// Fresh state for a task that has produced no events yet.
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// Pure projection fold. Unknown combinations leave the state untouched.
pub fn apply_event(mut state: TaskState, event: &TaskEvent) -> TaskState {
    if state.id.is_empty() {
        state.id = event.task_id.clone();
    }

    match &event.payload {
        TaskEventPayload::TaskCreated { .. } => {
            state.status = TaskStatus::Created;
            state.created_at = Some(event.timestamp);
        }
        TaskEventPayload::TaskStarted { strategy } => {
            state.status = TaskStatus::Executing;
            state.started_at = Some(event.timestamp);
            if strategy.is_some() {
                state.execution_strategy = strategy.clone();
            }
        }
        TaskEventPayload::TaskEvaluating => {
            state.status = TaskStatus::Evaluating;
            state.evaluating_at = Some(event.timestamp);
        }
        TaskEventPayload::TaskDecomposed { subtasks } => {
            state.status = TaskStatus::Decomposed;
            state.decomposed_at = Some(event.timestamp);
            state.subtasks = subtasks.clone();
        }
        TaskEventPayload::TaskProgress { percent, .. } => {
            state.progress = (*percent).min(100);
        }
        TaskEventPayload::TaskCompleted { result } => {
            state.status = TaskStatus::Completed;
            state.completed_at = Some(event.timestamp);
            state.result = Some(result.clone());
            state.success = Some(true);
            state.progress = 100;
            if let Some(started) = state.started_at {
                state.duration_ms = Some((event.timestamp - started).num_milliseconds());
            }
        }
        TaskEventPayload::TaskFailed { error, stack, .. } => {
            state.status = TaskStatus::Failed;
            state.failed_at = Some(event.timestamp);
            state.error = Some(error.clone());
            state.error_stack = stack.clone();
            state.success = Some(false);
            if let Some(started) = state.started_at {
                state.duration_ms = Some((event.timestamp - started).num_milliseconds());
            }
        }
        TaskEventPayload::TaskRetrying { attempt } => {
            state.status = TaskStatus::Retrying;
            state.retrying_at = Some(event.timestamp);
            state.retry_count = (*attempt).max(state.retry_count + 1);
        }
        TaskEventPayload::SubtaskStarted { subtask_id } => {
            if !state.active_subtasks.contains(subtask_id) {
                state.active_subtasks.push(subtask_id.clone());
            }
        }
        TaskEventPayload::SubtaskCompleted { subtask_id, result } => {
            state.active_subtasks.retain(|s| s != subtask_id);
            if !state.completed_subtasks.contains(subtask_id) {
                state.completed_subtasks.push(subtask_id.clone());
            }
            state
                .subtask_results
                .insert(subtask_id.clone(), result.clone());
        }
    }

    state
}

/// Projection snapshot taken every `snapshot_interval` appends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub task_id: String,
    /// Sequence id of the last event folded into `state`.
    pub sequence_id: u64,
    pub state: TaskState,
    pub timestamp: DateTime<Utc>,
}

/// Builder-style filter over the event journal.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Restrict to one aggregate.
    pub task_id: Option<String>,
    /// Restrict to these event types; empty means all.
    pub types: Vec<TaskEventType>,
    /// Only events with `sequence_id > after`.
    pub after: Option<u64>,
    /// Only events with `sequence_id < before`.
    pub before: Option<u64>,
    /// Only events at or after this time.
    pub start_time: Option<DateTime<Utc>>,
    /// Only events at or before this time.
    pub end_time: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn types(mut self, types: impl IntoIterator<Item = TaskEventType>) -> Self {
        self.types = types.into_iter().collect();
        self
    }

    pub fn after(mut self, sequence_id: u64) -> Self {
        self.after = Some(sequence_id);
        self
    }

    pub fn before(mut self, sequence_id: u64) -> Self {
        self.before = Some(sequence_id);
        self
    }

    pub fn start_time(mut self, time: DateTime<Utc>) -> Self {
        self.start_time = Some(time);
        self
    }

    pub fn end_time(mut self, time: DateTime<Utc>) -> Self {
        self.end_time = Some(time);
        self
    }

    /// Whether the event passes every set criterion.
    pub fn matches(&self, event: &TaskEvent) -> bool {
        if let Some(ref task_id) = self.task_id {
            if event.task_id != *task_id {
                return false;
            }
        }
        if !self.types.is_empty() && !self.types.contains(&event.event_type()) {
            return false;
        }
        if let Some(after) = self.after {
            if event.sequence_id <= after {
                return false;
            }
        }
        if let Some(before) = self.before {
            if event.sequence_id >= before {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if event.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if event.timestamp > end {
                return false;
            }
        }
        true
    }
}
