//! Dependency resolution for transformation edges.
//!
//! The unit of scheduling is a single dependency edge. An edge is ordered
//! after two kinds of predecessors: earlier transformation steps of its own
//! dataset, and every edge producing the dataset it consumes. A layered
//! topological sort over that graph yields [`ExecutionGroup`]s; everything
//! inside one group may run concurrently, and group `n + 1` starts only
//! after group `n` completes.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info};

use crate::config::DependencyEdge;
use crate::error::{DatacraftError, Result};

/// Edges that may execute concurrently.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionGroup {
    pub index: usize,
    pub edges: Vec<DependencyEdge>,
}

/// The ordered schedule produced for one target dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPlan {
    pub groups: Vec<ExecutionGroup>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.groups.iter().map(|g| g.edges.len()).sum()
    }

    /// Distinct dataset ids the plan produces, in first-appearance order.
    pub fn datasets(&self) -> Vec<i64> {
        let mut seen = HashSet::new();
        let mut datasets = Vec::new();
        for group in &self.groups {
            for edge in &group.edges {
                if seen.insert(edge.dataset_id) {
                    datasets.push(edge.dataset_id);
                }
            }
        }
        datasets
    }
}

/// Builds execution plans from dependency edges.
pub struct DependencyResolver;

impl DependencyResolver {
    /// Resolves the schedule for `target_dataset_id`.
    ///
    /// Only edges reachable from the target (transitively, through consumed
    /// datasets) participate; unrelated edges of the same process are left
    /// out. A dataset with no edges resolves to an empty plan.
    pub fn resolve(edges: &[&DependencyEdge], target_dataset_id: i64) -> Result<ExecutionPlan> {
        let mut by_dataset: HashMap<i64, Vec<&DependencyEdge>> = HashMap::new();
        for edge in edges {
            by_dataset.entry(edge.dataset_id).or_default().push(edge);
        }

        // Closure of datasets the target needs, walked through consumed ids.
        let mut reachable = HashSet::new();
        let mut frontier = VecDeque::from([target_dataset_id]);
        while let Some(dataset_id) = frontier.pop_front() {
            if !reachable.insert(dataset_id) {
                continue;
            }
            if let Some(owned) = by_dataset.get(&dataset_id) {
                for edge in owned {
                    frontier.push_back(edge.dependent_dataset_id);
                }
            }
        }

        let mut scheduled: Vec<&DependencyEdge> = edges
            .iter()
            .copied()
            .filter(|e| reachable.contains(&e.dataset_id))
            .collect();
        if scheduled.is_empty() {
            return Ok(ExecutionPlan::default());
        }
        scheduled.sort_by_key(|e| (e.dataset_id, e.transformation_step, e.dependent_dataset_id));
        // A dataset consuming itself is a one-node cycle the layered sort
        // below cannot see, since no graph edge is added for it.
        if let Some(edge) = scheduled
            .iter()
            .find(|e| e.dataset_id == e.dependent_dataset_id)
        {
            return Err(DatacraftError::CycleDetected {
                datasets: vec![edge.dataset_id],
            });
        }

        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..scheduled.len()).map(|i| graph.add_node(i)).collect();
        for (i, edge) in scheduled.iter().enumerate() {
            for (j, other) in scheduled.iter().enumerate() {
                if i == j {
                    continue;
                }
                let same_dataset_earlier_step = other.dataset_id == edge.dataset_id
                    && other.transformation_step < edge.transformation_step;
                let produces_input = other.dataset_id == edge.dependent_dataset_id;
                if same_dataset_earlier_step || produces_input {
                    graph.add_edge(nodes[j], nodes[i], ());
                }
            }
        }

        let mut remaining: HashMap<NodeIndex, usize> = nodes
            .iter()
            .map(|&n| (n, graph.neighbors_directed(n, petgraph::Incoming).count()))
            .collect();
        let mut ready: Vec<NodeIndex> = nodes
            .iter()
            .copied()
            .filter(|n| remaining[n] == 0)
            .collect();

        let mut groups = Vec::new();
        let mut placed = 0usize;
        while !ready.is_empty() {
            let mut group_edges: Vec<DependencyEdge> = ready
                .iter()
                .map(|&n| scheduled[graph[n]].clone())
                .collect();
            group_edges.sort_by_key(|e| {
                (e.transformation_step, e.dataset_id, e.dependent_dataset_id)
            });
            placed += group_edges.len();

            let mut next = Vec::new();
            for &node in &ready {
                for successor in graph.neighbors_directed(node, petgraph::Outgoing) {
                    let count = remaining
                        .get_mut(&successor)
                        .ok_or_else(|| DatacraftError::Internal("node missing from in-degree map".to_string()))?;
                    *count -= 1;
                    if *count == 0 {
                        next.push(successor);
                    }
                }
            }
            groups.push(ExecutionGroup {
                index: groups.len(),
                edges: group_edges,
            });
            ready = next;
        }

        if placed < scheduled.len() {
            return Err(cycle_error(&graph, &scheduled));
        }

        info!(
            resolver.target_dataset_id = target_dataset_id,
            resolver.edges = scheduled.len(),
            resolver.groups = groups.len(),
            "Execution plan resolved"
        );
        for group in &groups {
            debug!(
                resolver.group = group.index,
                resolver.group_edges = group.edges.len(),
                "Execution group"
            );
        }

        Ok(ExecutionPlan { groups })
    }
}

/// Names the smallest cyclic dataset set so the report stays actionable
/// even when several cycles overlap.
fn cycle_error(graph: &DiGraph<usize, ()>, scheduled: &[&DependencyEdge]) -> DatacraftError {
    let mut cycles: Vec<Vec<i64>> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1)
        .map(|scc| {
            let mut datasets: Vec<i64> = scc
                .iter()
                .map(|&n| scheduled[graph[n]].dataset_id)
                .collect();
            datasets.sort_unstable();
            datasets.dedup();
            datasets
        })
        .collect();
    cycles.sort_by_key(|c| (c.len(), c.clone()));
    DatacraftError::CycleDetected {
        datasets: cycles.into_iter().next().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JoinHow, TransformationKind};
    use proptest::prelude::*;

    fn edge(dataset_id: i64, dependent: i64, step: u32) -> DependencyEdge {
        DependencyEdge {
            process_id: 100,
            dataset_id,
            dependent_dataset_id: dependent,
            transformation_step: step,
            transformation: TransformationKind::Direct,
            extra_values: Default::default(),
        }
    }

    fn join_edge(dataset_id: i64, dependent: i64, step: u32) -> DependencyEdge {
        DependencyEdge {
            transformation: TransformationKind::Join {
                how: JoinHow::Inner,
                left_on: vec!["id".to_string()],
                right_on: vec!["id".to_string()],
            },
            ..edge(dataset_id, dependent, step)
        }
    }

    #[test]
    fn independent_edges_share_a_group_and_steps_split() {
        // Dataset 30 joins 10 and 20 at step 1, then refines at step 2.
        let edges = vec![
            edge(30, 10, 1),
            join_edge(30, 20, 1),
            edge(30, 40, 2),
        ];
        let refs: Vec<&DependencyEdge> = edges.iter().collect();
        let plan = DependencyResolver::resolve(&refs, 30).unwrap();

        assert_eq!(plan.groups.len(), 2);
        assert_eq!(plan.groups[0].edges.len(), 2);
        assert_eq!(plan.groups[1].edges.len(), 1);
        assert_eq!(plan.groups[1].edges[0].transformation_step, 2);
    }

    #[test]
    fn upstream_producer_runs_in_an_earlier_group() {
        // Dataset 20 is built from 10, and 30 consumes 20.
        let edges = vec![edge(30, 20, 1), edge(20, 10, 1)];
        let refs: Vec<&DependencyEdge> = edges.iter().collect();
        let plan = DependencyResolver::resolve(&refs, 30).unwrap();

        assert_eq!(plan.groups.len(), 2);
        assert_eq!(plan.groups[0].edges[0].dataset_id, 20);
        assert_eq!(plan.groups[1].edges[0].dataset_id, 30);
    }

    #[test]
    fn unrelated_edges_stay_out_of_the_plan() {
        let edges = vec![edge(30, 10, 1), edge(50, 40, 1)];
        let refs: Vec<&DependencyEdge> = edges.iter().collect();
        let plan = DependencyResolver::resolve(&refs, 30).unwrap();

        assert_eq!(plan.edge_count(), 1);
        assert_eq!(plan.datasets(), vec![30]);
    }

    #[test]
    fn no_edges_resolves_to_empty_plan() {
        let plan = DependencyResolver::resolve(&[], 30).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn two_dataset_cycle_is_reported() {
        let edges = vec![edge(10, 20, 1), edge(20, 10, 1)];
        let refs: Vec<&DependencyEdge> = edges.iter().collect();
        let err = DependencyResolver::resolve(&refs, 10).unwrap_err();
        match err {
            DatacraftError::CycleDetected { datasets } => assert_eq!(datasets, vec![10, 20]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let edges = vec![edge(10, 10, 1)];
        let refs: Vec<&DependencyEdge> = edges.iter().collect();
        let err = DependencyResolver::resolve(&refs, 10).unwrap_err();
        match err {
            DatacraftError::CycleDetected { datasets } => assert_eq!(datasets, vec![10]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn smallest_cycle_wins_when_cycles_overlap() {
        let edges = vec![
            edge(10, 20, 1),
            edge(20, 10, 1),
            edge(30, 40, 1),
            edge(40, 50, 1),
            edge(50, 30, 1),
            edge(10, 30, 2),
        ];
        let refs: Vec<&DependencyEdge> = edges.iter().collect();
        let err = DependencyResolver::resolve(&refs, 10).unwrap_err();
        match err {
            DatacraftError::CycleDetected { datasets } => assert_eq!(datasets, vec![10, 20]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn acyclic_edges() -> impl Strategy<Value = Vec<DependencyEdge>> {
        // Consumed ids stay below producing ids, so the graph is a DAG by
        // construction.
        prop::collection::vec((2i64..12, 1u32..4), 1..20).prop_map(|raw| {
            let mut edges: Vec<DependencyEdge> = raw
                .into_iter()
                .map(|(dataset_id, step)| edge(dataset_id, dataset_id - 1, step))
                .collect();
            edges.sort_by_key(|e| (e.dataset_id, e.transformation_step, e.dependent_dataset_id));
            edges.dedup_by_key(|e| (e.dataset_id, e.transformation_step, e.dependent_dataset_id));
            edges
        })
    }

    proptest! {
        #[test]
        fn plan_is_independent_of_input_order(edges in acyclic_edges().prop_shuffle()) {
            let mut sorted = edges.clone();
            sorted.sort_by_key(|e| (e.dataset_id, e.transformation_step, e.dependent_dataset_id));

            let shuffled_refs: Vec<&DependencyEdge> = edges.iter().collect();
            let sorted_refs: Vec<&DependencyEdge> = sorted.iter().collect();
            let target = sorted.last().map(|e| e.dataset_id).unwrap_or(0);

            let a = DependencyResolver::resolve(&shuffled_refs, target).unwrap();
            let b = DependencyResolver::resolve(&sorted_refs, target).unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn every_prerequisite_lands_in_an_earlier_group(edges in acyclic_edges()) {
            let refs: Vec<&DependencyEdge> = edges.iter().collect();
            let target = edges.iter().map(|e| e.dataset_id).max().unwrap_or(0);
            let plan = DependencyResolver::resolve(&refs, target).unwrap();

            let mut group_of: HashMap<(i64, u32, i64), usize> = HashMap::new();
            for group in &plan.groups {
                for e in &group.edges {
                    group_of.insert(
                        (e.dataset_id, e.transformation_step, e.dependent_dataset_id),
                        group.index,
                    );
                }
            }
            for group in &plan.groups {
                for e in &group.edges {
                    for (key, &other_group) in &group_of {
                        let earlier_step = key.0 == e.dataset_id && key.1 < e.transformation_step;
                        let produces_input = key.0 == e.dependent_dataset_id;
                        if earlier_step || produces_input {
                            prop_assert!(other_group < group.index);
                        }
                    }
                }
            }
        }
    }
}
