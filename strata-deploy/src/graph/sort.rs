//! Deterministic topological sorting.
//!
//! Many topological orders are valid for one graph. Ties between ready vertices are always broken
//! by a total order, either the vertices' own [`Ord`] or a caller comparator, so identical input
//! yields identical output across runs and environments.

use std::cmp::Ordering;
use std::collections::HashSet;

use petgraph::graph::NodeIndex;

use super::{DependencyGraph, VertexLabel, cycle};
use crate::error::{DeployError, DeployResult};

/// Topological sorter over [`DependencyGraph`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphSorter;

impl GraphSorter {
    /// Sort every vertex, using the vertices' natural order among ready ones.
    pub fn sort<T: Ord + VertexLabel>(graph: &DependencyGraph<T>) -> DeployResult<Vec<&T>> {
        Self::sort_by(graph, T::cmp)
    }

    /// Sort every vertex, using `compare` among ready ones.
    pub fn sort_by<T: VertexLabel>(
        graph: &DependencyGraph<T>,
        compare: impl Fn(&T, &T) -> Ordering,
    ) -> DeployResult<Vec<&T>> {
        let order = Self::sort_indices_by(graph, None, compare)?;
        Ok(order.into_iter().map(|index| graph.vertex(index)).collect())
    }

    /// Sort the subgraph induced by `subset`, using the vertices' natural order.
    pub fn sort_subset<'g, T: Ord + VertexLabel>(
        graph: &'g DependencyGraph<T>,
        subset: &[NodeIndex],
    ) -> DeployResult<Vec<&'g T>> {
        Self::sort_subset_by(graph, subset, T::cmp)
    }

    /// Sort the subgraph induced by `subset`, using `compare` among ready vertices.
    ///
    /// Every subset entry must be a distinct vertex of the graph.
    pub fn sort_subset_by<'g, T: VertexLabel>(
        graph: &'g DependencyGraph<T>,
        subset: &[NodeIndex],
        compare: impl Fn(&T, &T) -> Ordering,
    ) -> DeployResult<Vec<&'g T>> {
        let order = Self::sort_indices_by(graph, Some(subset), compare)?;
        Ok(order.into_iter().map(|index| graph.vertex(index)).collect())
    }

    /// Sort vertex indices of the graph, or of the subgraph induced by `subset`.
    pub fn sort_indices_by<T: VertexLabel>(
        graph: &DependencyGraph<T>,
        subset: Option<&[NodeIndex]>,
        compare: impl Fn(&T, &T) -> Ordering,
    ) -> DeployResult<Vec<NodeIndex>> {
        let members: Vec<NodeIndex> = match subset {
            Some(subset) => {
                validate_subset(graph, subset)?;
                subset.to_vec()
            }
            None => graph.indices().collect(),
        };
        if members.is_empty() {
            return Ok(Vec::new());
        }

        cycle::validate_no_cycles(graph, subset)?;

        let mut included = vec![false; graph.vertex_count()];
        for member in &members {
            included[member.index()] = true;
        }

        let mut in_degree = vec![0usize; graph.vertex_count()];
        for (from, to, _) in graph.edges() {
            if included[from.index()] && included[to.index()] {
                in_degree[to.index()] += 1;
            }
        }

        // Ties fall back to insertion order so the comparison is total.
        let order = |a: &NodeIndex, b: &NodeIndex| {
            compare(graph.vertex(*a), graph.vertex(*b)).then_with(|| a.cmp(b))
        };

        let mut ready: Vec<NodeIndex> = members
            .iter()
            .copied()
            .filter(|member| in_degree[member.index()] == 0)
            .collect();
        ready.sort_by(|a, b| order(a, b));

        let mut sorted = Vec::with_capacity(members.len());
        while !ready.is_empty() {
            let next = ready.remove(0);
            sorted.push(next);
            for dependent in graph.dependents_of(next) {
                if !included[dependent.index()] {
                    continue;
                }
                in_degree[dependent.index()] -= 1;
                if in_degree[dependent.index()] == 0 {
                    let position = ready
                        .binary_search_by(|candidate| order(candidate, &dependent))
                        .unwrap_or_else(|position| position);
                    ready.insert(position, dependent);
                }
            }
        }

        if sorted.len() != members.len() {
            return Err(DeployError::UnsortableGraph(format!(
                "sorted {} of {} vertices",
                sorted.len(),
                members.len()
            )));
        }
        Ok(sorted)
    }
}

fn validate_subset<T>(graph: &DependencyGraph<T>, subset: &[NodeIndex]) -> DeployResult<()> {
    let mut seen = HashSet::with_capacity(subset.len());
    for index in subset {
        if !graph.contains(*index) {
            return Err(DeployError::UnsortableGraph(format!(
                "vertex {} is not part of the graph",
                index.index()
            )));
        }
        if !seen.insert(*index) {
            return Err(DeployError::UnsortableGraph(format!(
                "vertex {} appears more than once in the subset",
                index.index()
            )));
        }
    }
    Ok(())
}
