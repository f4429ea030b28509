//! Cycle enumeration and reporting.

use std::collections::HashMap;
use std::fmt::Write;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use super::{DependencyGraph, VertexLabel};
use crate::error::{DeployError, DeployResult};

const CYCLE_REPORT_HEADER: &str = "\
Found cycles for the changes below. Please correct the object content.
You can remediate by:
    A) excluding false dependencies (most likely the DISCOVERED ones) with the excludeDependencies attribute, or
    B) declaring the intended dependencies with the includeDependencies or dependencies attributes, or
    C) removing unnecessary EXPLICIT dependencies

Changes are marked as [objectName.changeName]

Dependency types:
 * DISCOVERED: found by scanning the change content.
       These are the likeliest cause of a cycle.
       Use excludeDependencies on the object name (not the change name) to drop one
 * EXPLICIT: declared through the includeDependencies or dependencies attributes
 * IMPLICIT: the order of changes within one incremental object
";

/// Enumerate every simple cycle among `members` (all vertices when `None`).
///
/// Each cycle lists vertices along edge direction, starting from its lowest index; the edge from
/// the last vertex back to the first closes it.
pub fn find_cycles<T>(graph: &DependencyGraph<T>, members: Option<&[NodeIndex]>) -> Vec<Vec<NodeIndex>> {
    let members: Vec<NodeIndex> = match members {
        Some(members) => members.to_vec(),
        None => graph.indices().collect(),
    };

    // Induced subgraph over the members; weights map back to the original indices.
    let mut induced: DiGraph<NodeIndex, ()> = DiGraph::new();
    let mut local: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    for member in &members {
        local.insert(*member, induced.add_node(*member));
    }
    for (from, to, _) in graph.edges() {
        if let (Some(a), Some(b)) = (local.get(&from), local.get(&to)) {
            induced.add_edge(*a, *b, ());
        }
    }

    let mut components: Vec<Vec<NodeIndex>> = tarjan_scc(&induced)
        .into_iter()
        .filter(|component| component.len() > 1)
        .map(|mut component| {
            component.sort();
            component
        })
        .collect();
    components.sort();

    let mut cycles = Vec::new();
    for component in &components {
        for cycle in cycles_in_component(&induced, component) {
            cycles.push(cycle.into_iter().map(|n| induced[n]).collect());
        }
    }
    cycles
}

/// Tiernan-style enumeration: each cycle is found once, from its lowest vertex.
fn cycles_in_component(graph: &DiGraph<NodeIndex, ()>, component: &[NodeIndex]) -> Vec<Vec<NodeIndex>> {
    let successors = |node: NodeIndex| -> Vec<NodeIndex> {
        let mut next: Vec<_> = graph
            .neighbors(node)
            .filter(|n| component.binary_search(n).is_ok())
            .collect();
        next.sort();
        next.dedup();
        next
    };

    let mut cycles = Vec::new();
    for &start in component {
        let mut path = vec![start];
        let mut stack = vec![(successors(start), 0usize)];

        loop {
            let Some((next_nodes, position)) = stack.last_mut() else {
                break;
            };
            if *position < next_nodes.len() {
                let next = next_nodes[*position];
                *position += 1;
                if next == start {
                    cycles.push(path.clone());
                } else if next > start && !path.contains(&next) {
                    path.push(next);
                    stack.push((successors(next), 0));
                }
            } else {
                stack.pop();
                path.pop();
            }
        }
    }
    cycles
}

/// Render one cycle as the chain of "depends on" steps.
fn render_cycle<T: VertexLabel>(graph: &DependencyGraph<T>, number: usize, cycle: &[NodeIndex]) -> String {
    let mut out = format!("Cycle #{number}:");

    // Walk against the edges so each step reads "dependent depends on dependency".
    let mut walk: Vec<NodeIndex> = Vec::with_capacity(cycle.len() + 1);
    walk.push(cycle[0]);
    walk.extend(cycle[1..].iter().rev());
    walk.push(cycle[0]);

    for step in walk.windows(2) {
        let (dependent, dependency) = (step[0], step[1]);
        let kind = graph
            .edge_kind(dependency, dependent)
            .map(|kind| kind.to_string())
            .unwrap_or_default();
        let _ = write!(
            out,
            "\n    {} == depends on ==> {}   ({} dependency)",
            graph.vertex(dependent).vertex_label(),
            graph.vertex(dependency).vertex_label(),
            kind
        );
    }
    out.push_str(" (CYCLE FORMED)");
    out
}

/// Fail with a report of every cycle among `members` (all vertices when `None`).
pub fn validate_no_cycles<T: VertexLabel>(
    graph: &DependencyGraph<T>,
    members: Option<&[NodeIndex]>,
) -> DeployResult<()> {
    let cycles = find_cycles(graph, members);
    if cycles.is_empty() {
        return Ok(());
    }

    let rendered: Vec<String> = cycles
        .iter()
        .enumerate()
        .map(|(number, cycle)| render_cycle(graph, number, cycle))
        .collect();

    Err(DeployError::Cycle {
        message: format!("{CYCLE_REPORT_HEADER}\n{}", rendered.join("\n")),
        cycles: cycles
            .iter()
            .map(|cycle| cycle.iter().map(|n| graph.vertex(*n).vertex_label()).collect())
            .collect(),
    })
}
