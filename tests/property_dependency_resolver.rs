use std::collections::HashMap;

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use taskforge::domain::models::task::{ResolutionPlan, ResourceRequirements, TaskSpec};
use taskforge::services::{DependencyResolver, ResolutionContext};
use taskforge::EngineError;

fn resolve(tasks: &[TaskSpec]) -> Result<ResolutionPlan, EngineError> {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime")
        .block_on(DependencyResolver::new().resolve_dependencies(tasks, &ResolutionContext::new()))
}

/// Generate an acyclic task set: task i may only depend on tasks with a
/// smaller index, so cycles are impossible by construction.
fn acyclic_tasks(size: usize, edge_seed: u64) -> Vec<TaskSpec> {
    (0..size)
        .map(|i| {
            let mut task = TaskSpec::new(format!("task-{i:02}"))
                .with_description(format!("step {i} of the pipeline"));
            if i > 0 && (edge_seed >> (i % 60)) & 1 == 1 {
                let dep = (edge_seed as usize + i) % i;
                task.dependencies = vec![format!("task-{dep:02}")];
            }
            if i % 3 == 0 {
                task.resources = ResourceRequirements {
                    exclusive: vec!["shared-repo".to_string()],
                    ..ResourceRequirements::default()
                };
            }
            task
        })
        .collect()
}

proptest! {
    /// Property: the returned execution order is a topological order of
    /// the dependency graph.
    #[test]
    fn prop_execution_order_is_topological(
        size in 1usize..25,
        edge_seed in any::<u64>(),
    ) {
        let tasks = acyclic_tasks(size, edge_seed);
        let plan = resolve(&tasks).map_err(|e| TestCaseError::fail(e.to_string()))?;

        prop_assert_eq!(plan.execution_order.len(), size);

        let position: HashMap<&str, usize> = plan
            .execution_order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        for (id, node) in &plan.dependency_graph {
            for dep in &node.dependencies {
                prop_assert!(
                    position[dep.as_str()] < position[id.as_str()],
                    "dependency {} must precede {}",
                    dep,
                    id
                );
            }
        }
    }

    /// Property: members of one parallel group are mutually independent
    /// and their exclusive-resource sets are disjoint.
    #[test]
    fn prop_parallel_groups_are_independent(
        size in 1usize..25,
        edge_seed in any::<u64>(),
    ) {
        let tasks = acyclic_tasks(size, edge_seed);
        let plan = resolve(&tasks).map_err(|e| TestCaseError::fail(e.to_string()))?;

        // Transitive closure of the dependency relation.
        let mut reachable: HashMap<&str, std::collections::HashSet<&str>> = HashMap::new();
        for id in &plan.execution_order {
            let node = &plan.dependency_graph[id];
            let mut set: std::collections::HashSet<&str> = std::collections::HashSet::new();
            for dep in &node.dependencies {
                set.insert(dep.as_str());
                if let Some(more) = reachable.get(dep.as_str()) {
                    let transitive: Vec<&str> = more.iter().copied().collect();
                    set.extend(transitive);
                }
            }
            reachable.insert(id.as_str(), set);
        }

        for group in &plan.parallel_groups {
            for a in group {
                for b in group {
                    if a == b {
                        continue;
                    }
                    prop_assert!(
                        !reachable[a.as_str()].contains(b.as_str()),
                        "{} transitively depends on {} within one group",
                        a,
                        b
                    );
                    let ra = &plan.dependency_graph[a].task.resources;
                    let rb = &plan.dependency_graph[b].task.resources;
                    prop_assert!(
                        !ra.exclusive_conflicts_with(rb),
                        "{} and {} share an exclusive resource within one group",
                        a,
                        b
                    );
                }
            }
        }
    }

    /// Property: the parallel groups partition the execution order.
    #[test]
    fn prop_groups_partition_the_order(
        size in 1usize..25,
        edge_seed in any::<u64>(),
    ) {
        let tasks = acyclic_tasks(size, edge_seed);
        let plan = resolve(&tasks).map_err(|e| TestCaseError::fail(e.to_string()))?;

        let grouped: Vec<&String> = plan.parallel_groups.iter().flatten().collect();
        prop_assert_eq!(grouped.len(), plan.execution_order.len());

        let unique: std::collections::HashSet<&String> = grouped.iter().copied().collect();
        prop_assert_eq!(unique.len(), plan.execution_order.len());
    }

    /// Property: total estimate equals the sum over groups of the group
    /// maximum.
    #[test]
    fn prop_estimate_sums_group_maxima(
        size in 1usize..15,
        edge_seed in any::<u64>(),
    ) {
        let tasks = acyclic_tasks(size, edge_seed);
        let plan = resolve(&tasks).map_err(|e| TestCaseError::fail(e.to_string()))?;

        let expected: u64 = plan
            .parallel_groups
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|id| plan.dependency_graph[id].estimated_time_ms)
                    .max()
                    .unwrap_or(0)
            })
            .sum();
        prop_assert_eq!(plan.estimated_time_ms, expected);
    }
}

#[test]
fn three_task_cycle_is_reported_with_path() {
    let tasks = vec![
        TaskSpec::new("A").with_description("a").with_dependencies(["B"]),
        TaskSpec::new("B").with_description("b").with_dependencies(["C"]),
        TaskSpec::new("C").with_description("c").with_dependencies(["A"]),
    ];

    match resolve(&tasks) {
        Err(EngineError::CircularDependency(cycles)) => {
            assert!(!cycles.is_empty());
            let cycle = &cycles[0];
            assert_eq!(cycle.len(), 4);
            assert_eq!(cycle.first(), cycle.last());
        }
        other => panic!("expected CircularDependency, got {other:?}"),
    }
}
