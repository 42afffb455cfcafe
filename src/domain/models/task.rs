//! Task declarations and the resolver's graph/plan types.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resources a task reads, writes, or holds during execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResourceRequirements {
    /// Named resources consumed by the task.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Named resources produced by the task.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Resources requiring exclusive access.
    #[serde(default)]
    pub exclusive: Vec<String>,
    /// Resources that may be shared with concurrent tasks.
    #[serde(default)]
    pub shared: Vec<String>,
}

impl ResourceRequirements {
    /// Whether two tasks' exclusive sets intersect.
    pub fn exclusive_conflicts_with(&self, other: &Self) -> bool {
        self.exclusive.iter().any(|r| other.exclusive.contains(r))
    }
}

/// A declared unit of work handed to the dependency resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskSpec {
    /// Unique task id within the submitted set.
    #[serde(default)]
    pub id: String,
    /// Human description; `${var}` references create data-flow edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Named operation, when the task is not a tool call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Tool to invoke, when the task is a tool call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Parameters; names matching another task's output create edges.
    #[serde(default)]
    pub params: HashMap<String, Value>,
    /// Explicitly declared dependency task ids.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Resource declarations.
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Explicit runtime estimate in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_ms: Option<u64>,
    /// Scheduling priority; larger means more urgent.
    #[serde(default)]
    pub priority: i32,
    /// Names of subtasks for composite tasks.
    #[serde(default)]
    pub subtasks: Vec<String>,
}

impl TaskSpec {
    /// Minimal constructor for a named task.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Builder helper: set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builder helper: set the tool.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    /// Builder helper: add explicit dependencies.
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Builder helper: set the resource requirements.
    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = resources;
        self
    }

    /// A task is well-formed when it has an id and something to execute.
    pub fn is_well_formed(&self) -> bool {
        !self.id.is_empty()
            && (self.operation.is_some()
                || self.tool.is_some()
                || self.description.as_ref().is_some_and(|d| !d.is_empty()))
    }
}

/// Why a dependency edge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Listed in the task's `dependencies`.
    Explicit,
    /// Producer/consumer resource relationship.
    Resource,
    /// Exclusive-resource collision ordered by priority.
    ExclusiveResource,
    /// Parameter name or `${var}` reference.
    DataFlow,
    /// The task's tool depends on another task's tool.
    ToolPrerequisite,
    /// Discovered by the language model.
    Semantic,
}

/// One node of the resolved dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyNode {
    /// The task declaration.
    pub task: TaskSpec,
    /// Task ids this task depends on.
    pub dependencies: BTreeSet<String>,
    /// Task ids depending on this task.
    pub dependents: BTreeSet<String>,
    /// Estimated runtime in milliseconds.
    pub estimated_time_ms: u64,
    /// Effective priority.
    pub priority: i32,
}

/// A dependency edge with provenance, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The dependent task.
    pub from: String,
    /// The prerequisite task.
    pub to: String,
    pub kind: EdgeKind,
}

/// Output of a successful dependency resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionPlan {
    pub success: bool,
    /// Topological order over all well-formed tasks.
    pub execution_order: Vec<String>,
    /// Groups whose members may run concurrently.
    pub parallel_groups: Vec<Vec<String>>,
    /// Longest weighted path through the graph.
    pub critical_path: Vec<String>,
    /// Estimated total runtime in milliseconds.
    pub estimated_time_ms: u64,
    /// The resolved graph, keyed by task id.
    pub dependency_graph: HashMap<String, DependencyNode>,
    /// Edges created from resource declarations.
    pub resource_dependencies: Vec<DependencyEdge>,
    /// Resolution metadata (counts, dropped tasks, edge provenance).
    pub metadata: ResolutionMetadata,
}

/// Diagnostics describing how a plan was produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolutionMetadata {
    /// Tasks submitted, including ill-formed ones.
    pub submitted: usize,
    /// Tasks dropped by the well-formedness filter.
    pub dropped: Vec<String>,
    /// All edges with provenance.
    pub edges: Vec<DependencyEdge>,
    /// Whether semantic analysis ran.
    pub semantic_analysis: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_formedness() {
        assert!(TaskSpec::new("a").with_tool("eslint").is_well_formed());
        assert!(TaskSpec::new("b").with_description("lint it").is_well_formed());
        assert!(!TaskSpec::new("").with_tool("eslint").is_well_formed());
        assert!(!TaskSpec::new("c").is_well_formed());
    }

    #[test]
    fn test_exclusive_conflict() {
        let a = ResourceRequirements {
            exclusive: vec!["repo".into()],
            ..Default::default()
        };
        let b = ResourceRequirements {
            exclusive: vec!["repo".into(), "db".into()],
            ..Default::default()
        };
        let c = ResourceRequirements::default();

        assert!(a.exclusive_conflicts_with(&b));
        assert!(!a.exclusive_conflicts_with(&c));
    }

    #[test]
    fn test_spec_round_trip() {
        let task = TaskSpec::new("build")
            .with_description("compile ${source}")
            .with_dependencies(["fetch"]);
        let json = serde_json::to_string(&task).unwrap();
        let back: TaskSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "build");
        assert_eq!(back.dependencies, vec!["fetch"]);
    }
}
