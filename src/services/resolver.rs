//! Dependency resolution.
//!
//! Builds a dependency graph from task declarations (explicit edges plus
//! implicit resource, data-flow, tool-prerequisite, and optional
//! LLM-discovered semantic edges), detects cycles, produces a topological
//! execution order, groups independent tasks for parallel scheduling,
//! computes the critical path, and estimates total runtime.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::domain::error::{EngineError, EngineResult};
use crate::domain::models::task::{
    DependencyEdge, DependencyNode, EdgeKind, ResolutionMetadata, ResolutionPlan, TaskSpec,
};
use crate::domain::ports::llm_client::{LlmClient, PromptOptions};
use crate::domain::ports::tool_registry::ToolRegistry;

/// Base estimate for a single tool invocation, in milliseconds.
pub const TOOL_EXECUTION_BASE_TIME: u64 = 5_000;
/// Per-subtask estimate for composite tasks, in milliseconds.
pub const COMPOSITE_TASK_TIME_MULTIPLIER: u64 = 2_000;
/// Per-character estimate for textual tasks, in milliseconds.
pub const TEXT_LENGTH_TIME_MULTIPLIER: u64 = 50;
/// Lower clamp for textual estimates.
pub const MIN_TASK_TIME_ESTIMATE: u64 = 1_000;
/// Upper clamp for textual estimates.
pub const MAX_TASK_TIME_ESTIMATE: u64 = 30_000;
/// Fallback when nothing better is known.
pub const DEFAULT_TASK_TIME_ESTIMATE: u64 = 2_000;

static VAR_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_.-]+)\}|\$([A-Za-z0-9_]+)").expect("var regex"));

/// Inputs that shape a resolution run.
#[derive(Clone, Default)]
pub struct ResolutionContext {
    /// Ask the LLM for semantic edges. Best-effort: failures mean none.
    pub analyze_semantic_dependencies: bool,
    /// Run the DFS cycle pass (the sort still detects cycles without it,
    /// but without cycle paths in the error).
    pub detect_cycles: bool,
    /// Client used for semantic analysis.
    pub llm: Option<Arc<dyn LlmClient>>,
    /// Registry consulted for tool-prerequisite edges.
    pub tools: Option<Arc<dyn ToolRegistry>>,
}

impl ResolutionContext {
    pub fn new() -> Self {
        Self {
            detect_cycles: true,
            ..Self::default()
        }
    }
}

/// Service resolving task dependencies into an execution plan.
#[derive(Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a set of task declarations into an execution plan.
    #[instrument(skip_all, fields(tasks = tasks.len()))]
    pub async fn resolve_dependencies(
        &self,
        tasks: &[TaskSpec],
        context: &ResolutionContext,
    ) -> EngineResult<ResolutionPlan> {
        // 1. Drop ill-formed tasks.
        let mut dropped = Vec::new();
        let mut kept: Vec<TaskSpec> = Vec::new();
        for (index, task) in tasks.iter().enumerate() {
            if task.is_well_formed() {
                kept.push(task.clone());
            } else {
                let label = if task.id.is_empty() {
                    format!("task-{index}")
                } else {
                    task.id.clone()
                };
                dropped.push(label);
            }
        }
        if !dropped.is_empty() {
            debug!(dropped = ?dropped, "dropped ill-formed tasks");
        }

        // 2. Build the graph.
        let mut edges = self.explicit_edges(&kept);
        edges.extend(self.resource_edges(&kept));
        edges.extend(self.data_flow_edges(&kept));
        edges.extend(self.tool_prerequisite_edges(&kept, context).await);
        let semantic_ran = context.analyze_semantic_dependencies && context.llm.is_some();
        if semantic_ran {
            edges.extend(self.semantic_edges(&kept, context).await);
        }
        dedupe_edges(&mut edges);

        let graph = build_graph(&kept, &edges);

        // 3. Cycle detection with path reporting.
        if context.detect_cycles {
            let cycles = detect_cycles(&graph);
            if !cycles.is_empty() {
                return Err(EngineError::CircularDependency(cycles));
            }
        }

        // 4. Topological sort.
        let execution_order = topological_sort(&graph)?;

        // 5. Parallel groups.
        let ancestors = transitive_dependencies(&graph, &execution_order);
        let parallel_groups = identify_parallel_groups(&graph, &execution_order, &ancestors);

        // 6. Critical path.
        let critical_path = critical_path(&graph, &execution_order);

        // 7. Total time: sequential segments sum, parallel groups max.
        let estimated_time_ms = parallel_groups
            .iter()
            .map(|group| {
                group
                    .iter()
                    .filter_map(|id| graph.get(id).map(|n| n.estimated_time_ms))
                    .max()
                    .unwrap_or(0)
            })
            .sum();

        let resource_dependencies = edges
            .iter()
            .filter(|e| matches!(e.kind, EdgeKind::Resource | EdgeKind::ExclusiveResource))
            .cloned()
            .collect();

        Ok(ResolutionPlan {
            success: true,
            execution_order,
            parallel_groups,
            critical_path,
            estimated_time_ms,
            dependency_graph: graph,
            resource_dependencies,
            metadata: ResolutionMetadata {
                submitted: tasks.len(),
                dropped,
                edges,
                semantic_analysis: semantic_ran,
            },
        })
    }

    fn explicit_edges(&self, tasks: &[TaskSpec]) -> Vec<DependencyEdge> {
        let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        let mut edges = Vec::new();
        for task in tasks {
            for dep in &task.dependencies {
                if dep != &task.id && ids.contains(dep.as_str()) {
                    edges.push(DependencyEdge {
                        from: task.id.clone(),
                        to: dep.clone(),
                        kind: EdgeKind::Explicit,
                    });
                }
            }
        }
        edges
    }

    fn resource_edges(&self, tasks: &[TaskSpec]) -> Vec<DependencyEdge> {
        let mut edges = Vec::new();
        for consumer in tasks {
            for producer in tasks {
                if consumer.id == producer.id {
                    continue;
                }
                // Producer/consumer: outputs feeding inputs order the pair.
                let feeds = producer
                    .resources
                    .outputs
                    .iter()
                    .any(|out| consumer.resources.inputs.contains(out));
                if feeds {
                    edges.push(DependencyEdge {
                        from: consumer.id.clone(),
                        to: producer.id.clone(),
                        kind: EdgeKind::Resource,
                    });
                }
            }
        }

        // Exclusive collisions serialise: the lower-priority task waits for
        // the higher-priority one; ties break on lexical task-id order.
        for (i, a) in tasks.iter().enumerate() {
            for b in tasks.iter().skip(i + 1) {
                if !a.resources.exclusive_conflicts_with(&b.resources) {
                    continue;
                }
                let (first, second) = if a.priority > b.priority {
                    (a, b)
                } else if b.priority > a.priority {
                    (b, a)
                } else if a.id <= b.id {
                    (a, b)
                } else {
                    (b, a)
                };
                edges.push(DependencyEdge {
                    from: second.id.clone(),
                    to: first.id.clone(),
                    kind: EdgeKind::ExclusiveResource,
                });
            }
        }
        edges
    }

    fn data_flow_edges(&self, tasks: &[TaskSpec]) -> Vec<DependencyEdge> {
        let mut edges = Vec::new();
        for consumer in tasks {
            let mut refs: HashSet<String> = consumer.params.keys().cloned().collect();
            if let Some(desc) = &consumer.description {
                for capture in VAR_REFERENCE.captures_iter(desc) {
                    if let Some(name) = capture.get(1).or_else(|| capture.get(2)) {
                        refs.insert(name.as_str().to_string());
                    }
                }
            }
            if refs.is_empty() {
                continue;
            }
            for producer in tasks {
                if producer.id == consumer.id {
                    continue;
                }
                let produces = refs.contains(&producer.id)
                    || producer
                        .resources
                        .outputs
                        .iter()
                        .any(|out| refs.contains(out));
                if produces {
                    edges.push(DependencyEdge {
                        from: consumer.id.clone(),
                        to: producer.id.clone(),
                        kind: EdgeKind::DataFlow,
                    });
                }
            }
        }
        edges
    }

    async fn tool_prerequisite_edges(
        &self,
        tasks: &[TaskSpec],
        context: &ResolutionContext,
    ) -> Vec<DependencyEdge> {
        let Some(registry) = &context.tools else {
            return Vec::new();
        };

        // Map tool name -> tasks using it.
        let mut by_tool: HashMap<&str, Vec<&TaskSpec>> = HashMap::new();
        for task in tasks {
            if let Some(tool) = &task.tool {
                by_tool.entry(tool.as_str()).or_default().push(task);
            }
        }

        let mut edges = Vec::new();
        for (tool_name, users) in &by_tool {
            let Some(descriptor) = registry.get_tool(tool_name) else {
                continue;
            };
            for prerequisite_tool in &descriptor.dependencies {
                let Some(providers) = by_tool.get(prerequisite_tool.as_str()) else {
                    continue;
                };
                for user in users {
                    for provider in providers {
                        if user.id != provider.id {
                            edges.push(DependencyEdge {
                                from: user.id.clone(),
                                to: provider.id.clone(),
                                kind: EdgeKind::ToolPrerequisite,
                            });
                        }
                    }
                }
            }
        }
        edges
    }

    async fn semantic_edges(
        &self,
        tasks: &[TaskSpec],
        context: &ResolutionContext,
    ) -> Vec<DependencyEdge> {
        let Some(llm) = &context.llm else {
            return Vec::new();
        };

        let listing = tasks
            .iter()
            .map(|t| {
                format!(
                    "- {}: {}",
                    t.id,
                    t.description.as_deref().unwrap_or("(no description)")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Given these tasks, identify ordering dependencies implied by their \
             descriptions. Reply with ONLY a JSON array of [dependent, prerequisite] \
             id pairs, nothing else.\n\n{listing}"
        );

        let reply = match llm
            .send_message(&prompt, PromptOptions { response_format: Some("json".into()), ..Default::default() })
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "semantic dependency analysis unavailable");
                return Vec::new();
            }
        };

        let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        parse_semantic_pairs(&reply)
            .into_iter()
            .filter(|(from, to)| {
                from != to && ids.contains(from.as_str()) && ids.contains(to.as_str())
            })
            .map(|(from, to)| DependencyEdge {
                from,
                to,
                kind: EdgeKind::Semantic,
            })
            .collect()
    }
}

/// Parse the LLM's reply into `[dependent, prerequisite]` pairs.
///
/// Any parse failure means "no semantic dependencies discovered" — markdown
/// fences are stripped and the outermost array located first.
fn parse_semantic_pairs(reply: &str) -> Vec<(String, String)> {
    let trimmed = reply.trim();
    let candidate = if let Some(stripped) = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
    {
        stripped.trim_end_matches("```").trim()
    } else {
        trimmed
    };

    let candidate = match (candidate.find('['), candidate.rfind(']')) {
        (Some(start), Some(end)) if end > start => &candidate[start..=end],
        _ => return Vec::new(),
    };

    let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) else {
        return Vec::new();
    };
    let Some(pairs) = value.as_array() else {
        return Vec::new();
    };

    pairs
        .iter()
        .filter_map(|pair| {
            let pair = pair.as_array()?;
            if pair.len() != 2 {
                return None;
            }
            Some((pair[0].as_str()?.to_string(), pair[1].as_str()?.to_string()))
        })
        .collect()
}

fn dedupe_edges(edges: &mut Vec<DependencyEdge>) {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    edges.retain(|e| seen.insert((e.from.clone(), e.to.clone())));
}

fn build_graph(tasks: &[TaskSpec], edges: &[DependencyEdge]) -> HashMap<String, DependencyNode> {
    let mut graph: HashMap<String, DependencyNode> = tasks
        .iter()
        .map(|task| {
            (
                task.id.clone(),
                DependencyNode {
                    estimated_time_ms: estimate_task_time(task),
                    priority: task.priority,
                    dependencies: BTreeSet::new(),
                    dependents: BTreeSet::new(),
                    task: task.clone(),
                },
            )
        })
        .collect();

    for edge in edges {
        if let Some(node) = graph.get_mut(&edge.from) {
            node.dependencies.insert(edge.to.clone());
        }
        if let Some(node) = graph.get_mut(&edge.to) {
            node.dependents.insert(edge.from.clone());
        }
    }
    graph
}

/// Estimate a task's runtime in milliseconds.
pub fn estimate_task_time(task: &TaskSpec) -> u64 {
    if let Some(explicit) = task.estimated_time_ms {
        return explicit;
    }
    if task.tool.is_some() {
        return TOOL_EXECUTION_BASE_TIME;
    }
    if !task.subtasks.is_empty() {
        return task.subtasks.len() as u64 * COMPOSITE_TASK_TIME_MULTIPLIER;
    }
    if let Some(description) = &task.description {
        if !description.is_empty() {
            return (description.len() as u64 * TEXT_LENGTH_TIME_MULTIPLIER)
                .clamp(MIN_TASK_TIME_ESTIMATE, MAX_TASK_TIME_ESTIMATE);
        }
    }
    DEFAULT_TASK_TIME_ESTIMATE
}

/// DFS with an on-path set; returns every distinct cycle path found.
fn detect_cycles(graph: &HashMap<String, DependencyNode>) -> Vec<Vec<String>> {
    fn visit(
        node: &str,
        graph: &HashMap<String, DependencyNode>,
        visited: &mut HashSet<String>,
        on_path: &mut HashSet<String>,
        path: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        visited.insert(node.to_string());
        on_path.insert(node.to_string());
        path.push(node.to_string());

        if let Some(entry) = graph.get(node) {
            for dep in &entry.dependencies {
                if on_path.contains(dep) {
                    if let Some(start) = path.iter().position(|p| p == dep) {
                        let mut cycle: Vec<String> = path[start..].to_vec();
                        cycle.push(dep.clone());
                        cycles.push(cycle);
                    }
                } else if !visited.contains(dep) {
                    visit(dep, graph, visited, on_path, path, cycles);
                }
            }
        }

        on_path.remove(node);
        path.pop();
    }

    let mut visited = HashSet::new();
    let mut cycles = Vec::new();
    let mut ids: Vec<&String> = graph.keys().collect();
    ids.sort();
    for id in ids {
        if !visited.contains(id.as_str()) {
            let mut on_path = HashSet::new();
            let mut path = Vec::new();
            visit(id, graph, &mut visited, &mut on_path, &mut path, &mut cycles);
        }
    }
    cycles
}

/// Kahn's algorithm with deterministic tie-breaking (priority, then id).
fn topological_sort(graph: &HashMap<String, DependencyNode>) -> EngineResult<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = graph
        .iter()
        .map(|(id, node)| (id.as_str(), node.dependencies.len()))
        .collect();

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    sort_ready(&mut ready, graph);

    let mut order = Vec::with_capacity(graph.len());
    while let Some(id) = ready.pop() {
        order.push(id.to_string());
        if let Some(node) = graph.get(id) {
            for dependent in &node.dependents {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(dependent.as_str());
                    }
                }
            }
        }
        sort_ready(&mut ready, graph);
    }

    if order.len() != graph.len() {
        return Err(EngineError::DependencyResolution(format!(
            "topological sort covered {} of {} tasks",
            order.len(),
            graph.len()
        )));
    }
    Ok(order)
}

fn sort_ready(ready: &mut [&str], graph: &HashMap<String, DependencyNode>) {
    // Popped from the back: sort ascending by (priority, reverse id).
    ready.sort_by(|a, b| {
        let pa = graph.get(*a).map(|n| n.priority).unwrap_or(0);
        let pb = graph.get(*b).map(|n| n.priority).unwrap_or(0);
        pa.cmp(&pb).then_with(|| b.cmp(a))
    });
}

/// Transitive dependency sets, computed along the topological order.
fn transitive_dependencies(
    graph: &HashMap<String, DependencyNode>,
    order: &[String],
) -> HashMap<String, HashSet<String>> {
    let mut ancestors: HashMap<String, HashSet<String>> = HashMap::new();
    for id in order {
        let mut set = HashSet::new();
        if let Some(node) = graph.get(id) {
            for dep in &node.dependencies {
                set.insert(dep.clone());
                if let Some(dep_ancestors) = ancestors.get(dep) {
                    set.extend(dep_ancestors.iter().cloned());
                }
            }
        }
        ancestors.insert(id.clone(), set);
    }
    ancestors
}

/// Greedy grouping over the sorted order: a task joins the open group iff
/// it is independent of, and exclusive-disjoint with, every member.
fn identify_parallel_groups(
    graph: &HashMap<String, DependencyNode>,
    order: &[String],
    ancestors: &HashMap<String, HashSet<String>>,
) -> Vec<Vec<String>> {
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for id in order {
        let compatible = current.iter().all(|member| {
            let depends = ancestors
                .get(id)
                .is_some_and(|a| a.contains(member))
                || ancestors
                    .get(member)
                    .is_some_and(|a| a.contains(id));
            if depends {
                return false;
            }
            match (graph.get(id), graph.get(member)) {
                (Some(a), Some(b)) => {
                    !a.task.resources.exclusive_conflicts_with(&b.task.resources)
                }
                _ => true,
            }
        });

        if compatible {
            current.push(id.clone());
        } else {
            groups.push(std::mem::take(&mut current));
            current.push(id.clone());
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Longest weighted path by estimated time, root to leaf.
fn critical_path(graph: &HashMap<String, DependencyNode>, order: &[String]) -> Vec<String> {
    let mut best: HashMap<&str, u64> = HashMap::new();
    let mut predecessor: HashMap<&str, &str> = HashMap::new();

    for id in order {
        let node = match graph.get(id) {
            Some(node) => node,
            None => continue,
        };
        let (longest_dep, dep_cost) = node
            .dependencies
            .iter()
            .filter_map(|d| best.get(d.as_str()).map(|c| (d.as_str(), *c)))
            .max_by_key(|(_, c)| *c)
            .map(|(d, c)| (Some(d), c))
            .unwrap_or((None, 0));

        best.insert(id.as_str(), dep_cost + node.estimated_time_ms);
        if let Some(dep) = longest_dep {
            predecessor.insert(id.as_str(), dep);
        }
    }

    let Some((&end, _)) = best.iter().max_by_key(|(_, &c)| c) else {
        return Vec::new();
    };

    let mut path = vec![end.to_string()];
    let mut current = end;
    while let Some(&prev) = predecessor.get(current) {
        path.push(prev.to_string());
        current = prev;
    }
    path.reverse();
    path
}
