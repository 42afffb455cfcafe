//! Execution context tree.
//!
//! A context is an immutable node in a per-task tree. Child contexts
//! inherit session, correlation, deadline, and configuration from their
//! parent; every "mutation" (`with_deadline`, `add_artifact`, ...) returns
//! a new value, so no observer ever sees a context change after creation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::domain::error::{EngineError, EngineResult};
use crate::domain::models::config::ContextDefaults;

/// Cooperative cancellation signal propagated from a context to every
/// long-running operation started under it.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Create a fresh, un-cancelled signal.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // The sender lives in self, so changed() can only fail after cancel.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// One hop in the root-to-current path of a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breadcrumb {
    /// Task owning the context at this hop.
    pub task_id: String,
    /// Depth of that context.
    pub depth: u32,
    /// When the context was created.
    pub timestamp: DateTime<Utc>,
}

/// A named value produced by a step and threaded to later steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Free-form type tag ("text", "json", "file", ...).
    pub artifact_type: String,
    /// The payload.
    pub value: Value,
    /// Optional human description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// What the artifact is for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Artifact {
    /// Create an artifact with the given type tag and value.
    pub fn new(artifact_type: impl Into<String>, value: Value) -> Self {
        Self {
            artifact_type: artifact_type.into(),
            value,
            description: None,
            purpose: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach a purpose.
    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }
}

/// A breadcrumb annotated with the time elapsed since it was laid down.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub task_id: String,
    pub depth: u32,
    pub timestamp: DateTime<Utc>,
    /// Milliseconds between the breadcrumb and the trace query.
    pub elapsed_ms: i64,
}

/// Options for creating a root context.
#[derive(Debug, Clone, Default)]
pub struct RootOptions {
    /// Task id; a UUID is generated when unset.
    pub task_id: Option<String>,
    /// Session id; a UUID is generated when unset.
    pub session_id: Option<String>,
    /// Correlation id; a UUID is generated when unset.
    pub correlation_id: Option<String>,
    /// Frozen context configuration.
    pub config: ContextDefaults,
    /// Absolute deadline for everything under this root.
    pub deadline: Option<DateTime<Utc>>,
    /// Opaque caller-supplied context.
    pub user_context: HashMap<String, Value>,
}

/// Overrides applied when deriving a child context.
#[derive(Debug, Clone, Default)]
pub struct ChildOverrides {
    /// Replace the inherited deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// Replace the inherited correlation id.
    pub correlation_id: Option<String>,
    /// Config fields to overlay on the parent's frozen config.
    pub config: Option<ContextDefaults>,
    /// Extra metadata entries for the child.
    pub metadata: HashMap<String, Value>,
}

/// Immutable node in the execution context tree.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    task_id: String,
    session_id: String,
    correlation_id: String,
    depth: u32,
    max_depth: u32,
    start_time: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
    config: ContextDefaults,
    breadcrumbs: Arc<Vec<Breadcrumb>>,
    user_context: Arc<HashMap<String, Value>>,
    metadata: HashMap<String, Value>,
    artifacts: Vec<(String, Arc<Artifact>)>,
    parent: Option<Arc<ExecutionContext>>,
    cancel: CancelSignal,
}

impl ExecutionContext {
    /// Create a root context (depth 0, empty breadcrumbs).
    pub fn create_root(opts: RootOptions) -> Arc<Self> {
        let max_depth = opts.config.max_depth;
        Arc::new(Self {
            task_id: opts.task_id.unwrap_or_else(new_id),
            session_id: opts.session_id.unwrap_or_else(new_id),
            correlation_id: opts.correlation_id.unwrap_or_else(new_id),
            depth: 0,
            max_depth,
            start_time: Utc::now(),
            deadline: opts.deadline,
            config: opts.config,
            breadcrumbs: Arc::new(Vec::new()),
            user_context: Arc::new(opts.user_context),
            metadata: HashMap::new(),
            artifacts: Vec::new(),
            parent: None,
            cancel: CancelSignal::new(),
        })
    }

    /// Derive a child context one level deeper.
    ///
    /// Copies the parent config (overlaying `overrides.config` when given),
    /// appends a breadcrumb for the child, and shares the parent's
    /// artifacts by reference. Fails with [`EngineError::DepthLimit`] when
    /// the parent is already at `max_depth`.
    pub fn create_child(
        self: &Arc<Self>,
        task_id: impl Into<String>,
        overrides: ChildOverrides,
    ) -> EngineResult<Arc<Self>> {
        if self.depth >= self.max_depth {
            return Err(EngineError::DepthLimit {
                depth: self.depth,
                max_depth: self.max_depth,
            });
        }

        let task_id = task_id.into();
        let depth = self.depth + 1;
        let now = Utc::now();

        let mut breadcrumbs = (*self.breadcrumbs).clone();
        breadcrumbs.push(Breadcrumb {
            task_id: task_id.clone(),
            depth,
            timestamp: now,
        });

        let config = overrides.config.unwrap_or_else(|| self.config.clone());

        Ok(Arc::new(Self {
            task_id,
            session_id: self.session_id.clone(),
            correlation_id: overrides
                .correlation_id
                .unwrap_or_else(|| self.correlation_id.clone()),
            depth,
            max_depth: self.max_depth,
            start_time: now,
            deadline: overrides.deadline.or(self.deadline),
            config,
            breadcrumbs: Arc::new(breadcrumbs),
            user_context: Arc::clone(&self.user_context),
            metadata: overrides.metadata,
            artifacts: self.artifacts.clone(),
            parent: Some(Arc::clone(self)),
            cancel: self.cancel.clone(),
        }))
    }

    /// Derive a sibling: same parent, same depth, new task id.
    pub fn create_sibling(self: &Arc<Self>, task_id: impl Into<String>) -> Arc<Self> {
        let task_id = task_id.into();
        let now = Utc::now();

        let mut breadcrumbs = (*self.breadcrumbs).clone();
        if let Some(last) = breadcrumbs.last_mut() {
            *last = Breadcrumb {
                task_id: task_id.clone(),
                depth: self.depth,
                timestamp: now,
            };
        }

        Arc::new(Self {
            task_id,
            start_time: now,
            breadcrumbs: Arc::new(breadcrumbs),
            metadata: HashMap::new(),
            ..(**self).clone()
        })
    }

    /// Derive one child per task id for parallel scheduling.
    pub fn create_parallel(
        self: &Arc<Self>,
        task_ids: &[&str],
    ) -> EngineResult<Vec<Arc<Self>>> {
        task_ids
            .iter()
            .map(|id| self.create_child(*id, ChildOverrides::default()))
            .collect()
    }

    /// Merge sibling contexts produced by [`Self::create_parallel`].
    ///
    /// Artifacts are combined in merge order; when two children wrote the
    /// same key, the later child wins.
    pub fn merge_parallel(self: &Arc<Self>, children: &[Arc<Self>]) -> Arc<Self> {
        let mut merged = self.artifacts.clone();
        for child in children {
            // Only keys the child added or changed relative to the parent.
            for (key, artifact) in &child.artifacts {
                let inherited = self
                    .artifacts
                    .iter()
                    .any(|(k, a)| k == key && Arc::ptr_eq(a, artifact));
                if inherited {
                    continue;
                }
                merged.retain(|(k, _)| k != key);
                merged.push((key.clone(), Arc::clone(artifact)));
            }
        }

        let mut next = (**self).clone();
        next.artifacts = merged;
        Arc::new(next)
    }

    /// Return a copy with a replaced deadline.
    pub fn with_deadline(self: &Arc<Self>, deadline: DateTime<Utc>) -> Arc<Self> {
        let mut next = (**self).clone();
        next.deadline = Some(deadline);
        Arc::new(next)
    }

    /// Return a copy with one extra metadata entry.
    pub fn with_metadata(self: &Arc<Self>, key: impl Into<String>, value: Value) -> Arc<Self> {
        let mut next = (**self).clone();
        next.metadata.insert(key.into(), value);
        Arc::new(next)
    }

    /// Return a copy with the artifact stored under `key`.
    pub fn add_artifact(self: &Arc<Self>, key: impl Into<String>, artifact: Artifact) -> Arc<Self> {
        let key = key.into();
        let mut next = (**self).clone();
        next.artifacts.retain(|(k, _)| *k != key);
        next.artifacts.push((key, Arc::new(artifact)));
        Arc::new(next)
    }

    /// Look up an artifact by key.
    pub fn get_artifact(&self, key: &str) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, a)| a.as_ref())
    }

    /// Look up an artifact's value by key.
    pub fn get_artifact_value(&self, key: &str) -> Option<&Value> {
        self.get_artifact(key).map(|a| &a.value)
    }

    /// All artifacts in insertion order.
    pub fn list_artifacts(&self) -> Vec<(&str, &Artifact)> {
        self.artifacts
            .iter()
            .map(|(k, a)| (k.as_str(), a.as_ref()))
            .collect()
    }

    /// Walk the parent chain for the first context matching `predicate`.
    pub fn find_ancestor(
        self: &Arc<Self>,
        predicate: impl Fn(&ExecutionContext) -> bool,
    ) -> Option<Arc<Self>> {
        let mut current = self.parent.clone();
        while let Some(ctx) = current {
            if predicate(&ctx) {
                return Some(ctx);
            }
            current = ctx.parent.clone();
        }
        None
    }

    /// The root of this context's tree.
    pub fn get_root(self: &Arc<Self>) -> Arc<Self> {
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent.clone() {
            current = parent;
        }
        current
    }

    /// Breadcrumb task ids joined root-to-current.
    pub fn get_execution_path(&self) -> String {
        self.breadcrumbs
            .iter()
            .map(|b| b.task_id.as_str())
            .collect::<Vec<_>>()
            .join(" \u{2192} ")
    }

    /// Breadcrumbs annotated with elapsed wall time.
    pub fn get_execution_trace(&self) -> Vec<TraceEntry> {
        let now = Utc::now();
        self.breadcrumbs
            .iter()
            .map(|b| TraceEntry {
                task_id: b.task_id.clone(),
                depth: b.depth,
                timestamp: b.timestamp,
                elapsed_ms: (now - b.timestamp).num_milliseconds(),
            })
            .collect()
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Utc::now() >= d)
    }

    /// Time left before the deadline; `None` means unbounded.
    pub fn get_remaining_time(&self) -> Option<Duration> {
        self.deadline.map(|d| d - Utc::now())
    }

    /// Whether this context may still create children.
    pub fn can_decompose(&self) -> bool {
        self.depth < self.max_depth
    }

    /// Whether this context sits at the depth limit.
    pub fn is_at_max_depth(&self) -> bool {
        self.depth >= self.max_depth
    }

    /// Serialize to a plain object (parent chain is not carried).
    pub fn to_object(&self) -> ContextObject {
        ContextObject {
            task_id: self.task_id.clone(),
            session_id: self.session_id.clone(),
            correlation_id: self.correlation_id.clone(),
            depth: self.depth,
            max_depth: self.max_depth,
            start_time: self.start_time,
            deadline: self.deadline,
            config: self.config.clone(),
            breadcrumbs: (*self.breadcrumbs).clone(),
            user_context: (*self.user_context).clone(),
            metadata: self.metadata.clone(),
            artifacts: self
                .artifacts
                .iter()
                .map(|(k, a)| (k.clone(), (**a).clone()))
                .collect(),
        }
    }

    /// Rebuild a detached context from a serialized object.
    ///
    /// Fails with [`EngineError::InvariantViolation`] when the object's
    /// depth disagrees with its breadcrumb trail.
    pub fn from_object(obj: ContextObject) -> EngineResult<Arc<Self>> {
        if let Some(last) = obj.breadcrumbs.last() {
            if last.depth != obj.depth {
                return Err(EngineError::invariant(format!(
                    "context depth {} does not match breadcrumb depth {}",
                    obj.depth, last.depth
                )));
            }
        } else if obj.depth != 0 {
            return Err(EngineError::invariant(format!(
                "context depth {} with no breadcrumbs",
                obj.depth
            )));
        }
        if obj.depth > obj.max_depth {
            return Err(EngineError::invariant(format!(
                "context depth {} exceeds max_depth {}",
                obj.depth, obj.max_depth
            )));
        }

        Ok(Arc::new(Self {
            task_id: obj.task_id,
            session_id: obj.session_id,
            correlation_id: obj.correlation_id,
            depth: obj.depth,
            max_depth: obj.max_depth,
            start_time: obj.start_time,
            deadline: obj.deadline,
            config: obj.config,
            breadcrumbs: Arc::new(obj.breadcrumbs),
            user_context: Arc::new(obj.user_context),
            metadata: obj.metadata,
            artifacts: obj
                .artifacts
                .into_iter()
                .map(|(k, a)| (k, Arc::new(a)))
                .collect(),
            parent: None,
            cancel: CancelSignal::new(),
        }))
    }

    /// One-line summary for logs and status displays.
    pub fn to_summary(&self) -> String {
        format!(
            "task={} session={} depth={}/{} path=[{}] artifacts={}",
            self.task_id,
            self.session_id,
            self.depth,
            self.max_depth,
            self.get_execution_path(),
            self.artifacts.len()
        )
    }

    // Accessors.

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn config(&self) -> &ContextDefaults {
        &self.config
    }

    pub fn breadcrumbs(&self) -> &[Breadcrumb] {
        &self.breadcrumbs
    }

    pub fn user_context(&self) -> &HashMap<String, Value> {
        &self.user_context
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn parent(&self) -> Option<&Arc<ExecutionContext>> {
        self.parent.as_ref()
    }

    /// Cancellation signal shared by the whole lineage.
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Fail fast when the context is cancelled or past its deadline.
    pub fn check_live(&self) -> EngineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if self.is_expired() {
            return Err(EngineError::Deadline);
        }
        Ok(())
    }
}

/// Serialized form of an [`ExecutionContext`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextObject {
    pub task_id: String,
    pub session_id: String,
    pub correlation_id: String,
    pub depth: u32,
    pub max_depth: u32,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub config: ContextDefaults,
    pub breadcrumbs: Vec<Breadcrumb>,
    #[serde(default)]
    pub user_context: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub artifacts: Vec<(String, Artifact)>,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn root_with_depth(max_depth: u32) -> Arc<ExecutionContext> {
        ExecutionContext::create_root(RootOptions {
            task_id: Some("root".to_string()),
            config: ContextDefaults {
                max_depth,
                ..ContextDefaults::default()
            },
            ..RootOptions::default()
        })
    }

    #[test]
    fn test_child_depth_and_breadcrumbs() {
        let root = root_with_depth(3);
        let child = root.create_child("l1", ChildOverrides::default()).unwrap();

        assert_eq!(child.depth(), 1);
        assert_eq!(child.session_id(), root.session_id());
        assert_eq!(child.breadcrumbs().len(), 1);
        assert_eq!(child.breadcrumbs()[0].task_id, "l1");
        assert_eq!(child.breadcrumbs()[0].depth, 1);
    }

    #[test]
    fn test_depth_limit_scenario() {
        let root = root_with_depth(3);
        let c1 = root.create_child("l1", ChildOverrides::default()).unwrap();
        let c2 = c1.create_child("l2", ChildOverrides::default()).unwrap();
        let c3 = c2.create_child("l3", ChildOverrides::default()).unwrap();

        assert!(!c3.can_decompose());
        assert!(c3.is_at_max_depth());
        assert_eq!(c3.get_execution_path(), "l1 \u{2192} l2 \u{2192} l3");

        let err = c3.create_child("l4", ChildOverrides::default()).unwrap_err();
        assert!(matches!(err, EngineError::DepthLimit { depth: 3, max_depth: 3 }));
    }

    #[test]
    fn test_artifacts_inherited_not_back_propagated() {
        let root = root_with_depth(3)
            .add_artifact("seed", Artifact::new("text", json!("from-root")));
        let child = root.create_child("c", ChildOverrides::default()).unwrap();

        assert_eq!(child.get_artifact_value("seed"), Some(&json!("from-root")));

        let child2 = child.add_artifact("extra", Artifact::new("text", json!("child-only")));
        assert!(child2.get_artifact("extra").is_some());
        assert!(root.get_artifact("extra").is_none());
    }

    #[test]
    fn test_merge_parallel_last_write_wins() {
        let root = root_with_depth(3);
        let kids = root.create_parallel(&["a", "b"]).unwrap();

        let a = kids[0].add_artifact("shared", Artifact::new("text", json!("from-a")));
        let b = kids[1].add_artifact("shared", Artifact::new("text", json!("from-b")));

        let merged = root.merge_parallel(&[a.clone(), b.clone()]);
        assert_eq!(merged.get_artifact_value("shared"), Some(&json!("from-b")));

        let merged_rev = root.merge_parallel(&[b, a]);
        assert_eq!(merged_rev.get_artifact_value("shared"), Some(&json!("from-a")));
    }

    #[test]
    fn test_sibling_keeps_depth() {
        let root = root_with_depth(3);
        let child = root.create_child("c1", ChildOverrides::default()).unwrap();
        let sibling = child.create_sibling("c2");

        assert_eq!(sibling.depth(), child.depth());
        assert_eq!(sibling.get_execution_path(), "c2");
    }

    #[test]
    fn test_deadline_inheritance_and_expiry() {
        let deadline = Utc::now() + Duration::milliseconds(50);
        let root = ExecutionContext::create_root(RootOptions {
            deadline: Some(deadline),
            ..RootOptions::default()
        });
        let child = root.create_child("c", ChildOverrides::default()).unwrap();
        assert_eq!(child.deadline(), Some(deadline));

        let expired = root.with_deadline(Utc::now() - Duration::seconds(1));
        assert!(expired.is_expired());
        assert!(expired.get_remaining_time().unwrap() < Duration::zero());
        assert!(matches!(expired.check_live(), Err(EngineError::Deadline)));
    }

    #[test]
    fn test_remaining_time_unbounded() {
        let root = root_with_depth(3);
        assert!(root.get_remaining_time().is_none());
        assert!(!root.is_expired());
    }

    #[test]
    fn test_cancel_propagates_to_lineage() {
        let root = root_with_depth(3);
        let child = root.create_child("c", ChildOverrides::default()).unwrap();

        root.cancel_signal().cancel();
        assert!(child.cancel_signal().is_cancelled());
        assert!(matches!(child.check_live(), Err(EngineError::Cancelled)));
    }

    #[test]
    fn test_object_round_trip() {
        let root = root_with_depth(3)
            .add_artifact("k", Artifact::new("json", json!({"x": 1})));
        let child = root.create_child("c1", ChildOverrides::default()).unwrap();

        let obj = child.to_object();
        let json = serde_json::to_string(&obj).unwrap();
        let parsed: ContextObject = serde_json::from_str(&json).unwrap();
        let rebuilt = ExecutionContext::from_object(parsed).unwrap();

        assert_eq!(rebuilt.task_id(), child.task_id());
        assert_eq!(rebuilt.depth(), child.depth());
        assert_eq!(rebuilt.get_artifact_value("k"), Some(&json!({"x": 1})));
    }

    #[test]
    fn test_from_object_rejects_inconsistent_depth() {
        let root = root_with_depth(3);
        let child = root.create_child("c1", ChildOverrides::default()).unwrap();

        let mut obj = child.to_object();
        obj.depth = 2;
        let err = ExecutionContext::from_object(obj).unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[test]
    fn test_find_ancestor_and_root() {
        let root = root_with_depth(3);
        let c1 = root.create_child("c1", ChildOverrides::default()).unwrap();
        let c2 = c1.create_child("c2", ChildOverrides::default()).unwrap();

        let found = c2.find_ancestor(|ctx| ctx.task_id() == "c1").unwrap();
        assert_eq!(found.task_id(), "c1");
        assert_eq!(c2.get_root().task_id(), "root");
    }
}
