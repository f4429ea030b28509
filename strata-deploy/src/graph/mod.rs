//! Dependency graph construction.
//!
//! Vertices are change groups and an edge `a -> b` means `a` must deploy before `b`. Graphs are
//! validated for cycles as soon as they are built; see [`cycle`] for the report format and
//! [`sort`] for the deterministic topological sort.

pub mod cycle;
pub mod sort;

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use tracing::trace;

use crate::change::{Change, DependencyKind};
use crate::error::DeployResult;
use crate::text::NameConverter;

pub use cycle::find_cycles;
pub use sort::GraphSorter;

/// Text used for a vertex in cycle reports.
pub trait VertexLabel {
    fn vertex_label(&self) -> String;
}

impl<T: VertexLabel + ?Sized> VertexLabel for &T {
    fn vertex_label(&self) -> String {
        (**self).vertex_label()
    }
}

impl VertexLabel for Change {
    fn vertex_label(&self) -> String {
        self.label()
    }
}

/// A set of changes that occupies a single vertex in the dependency graph.
pub trait SortableDependencyGroup {
    /// The changes in this group; never empty.
    fn components(&self) -> &[Change];
}

impl SortableDependencyGroup for Change {
    fn components(&self) -> &[Change] {
        std::slice::from_ref(self)
    }
}

/// A directed graph of vertices with dependency-kind edges.
#[derive(Debug, Clone)]
pub struct DependencyGraph<T> {
    graph: DiGraph<T, DependencyKind>,
}

impl<T> Default for DependencyGraph<T> {
    fn default() -> Self {
        Self {
            graph: DiGraph::new(),
        }
    }
}

impl<T> DependencyGraph<T> {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vertex and return its index.
    pub fn add_vertex(&mut self, vertex: T) -> NodeIndex {
        self.graph.add_node(vertex)
    }

    /// Add an edge from `dependency` to `dependent`.
    ///
    /// Self-loops and repeated edges are ignored, so the first kind recorded for a pair wins.
    /// Returns whether an edge was added.
    pub fn add_edge(&mut self, dependency: NodeIndex, dependent: NodeIndex, kind: DependencyKind) -> bool {
        if dependency == dependent || self.graph.find_edge(dependency, dependent).is_some() {
            return false;
        }
        self.graph.add_edge(dependency, dependent, kind);
        true
    }

    /// The vertex at `index`.
    pub fn vertex(&self, index: NodeIndex) -> &T {
        &self.graph[index]
    }

    /// Whether `index` is a vertex of this graph.
    pub fn contains(&self, index: NodeIndex) -> bool {
        index.index() < self.graph.node_count()
    }

    /// Number of vertices.
    pub fn vertex_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Whether the graph has no vertices.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Vertex indices in insertion order.
    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Vertices in insertion order.
    pub fn vertices(&self) -> impl Iterator<Item = &T> {
        self.graph.node_weights()
    }

    /// Vertices this vertex depends on.
    pub fn dependencies_of(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.neighbors(index, Direction::Incoming)
    }

    /// Vertices that depend on this vertex.
    pub fn dependents_of(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.neighbors(index, Direction::Outgoing)
    }

    fn neighbors(&self, index: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut found: Vec<_> = self.graph.neighbors_directed(index, direction).collect();
        found.sort();
        found
    }

    /// Kind of the edge from `dependency` to `dependent`, if any.
    pub fn edge_kind(&self, dependency: NodeIndex, dependent: NodeIndex) -> Option<DependencyKind> {
        self.graph
            .find_edge(dependency, dependent)
            .map(|edge| self.graph[edge])
    }

    /// All edges as `(dependency, dependent, kind)`.
    pub fn edges(&self) -> impl Iterator<Item = (NodeIndex, NodeIndex, DependencyKind)> + '_ {
        self.graph
            .edge_references()
            .map(|edge| (edge.source(), edge.target(), *edge.weight()))
    }

    /// Every vertex reachable from the given starts by following dependent edges, starts excluded.
    pub fn reachable_dependents(&self, starts: &[NodeIndex]) -> Vec<NodeIndex> {
        let mut seen = vec![false; self.vertex_count()];
        let mut queue: VecDeque<NodeIndex> = starts.iter().copied().collect();
        for start in starts {
            seen[start.index()] = true;
        }
        let mut reached = Vec::new();
        while let Some(current) = queue.pop_front() {
            for next in self.dependents_of(current) {
                if !seen[next.index()] {
                    seen[next.index()] = true;
                    reached.push(next);
                    queue.push_back(next);
                }
            }
        }
        reached
    }

    /// Weakly connected components, each ordered by vertex index.
    pub fn connected_components(&self) -> Vec<Vec<NodeIndex>> {
        let mut union = UnionFind::new(self.vertex_count());
        for edge in self.graph.edge_references() {
            union.union(edge.source().index(), edge.target().index());
        }

        let mut by_root: HashMap<usize, usize> = HashMap::new();
        let mut components: Vec<Vec<NodeIndex>> = Vec::new();
        for index in self.graph.node_indices() {
            let root = union.find(index.index());
            let slot = *by_root.entry(root).or_insert_with(|| {
                components.push(Vec::new());
                components.len() - 1
            });
            components[slot].push(index);
        }
        components
    }

    /// Consume the graph, returning its vertices in index order.
    pub fn into_vertices(self) -> Vec<T> {
        let (nodes, _) = self.graph.into_nodes_edges();
        nodes.into_iter().map(|node| node.weight).collect()
    }
}

impl<T: VertexLabel> DependencyGraph<T> {
    /// Fail with a full cycle report if the graph contains any cycle.
    pub fn validate_no_cycles(&self) -> DeployResult<()> {
        cycle::validate_no_cycles(self, None)
    }
}

/// Builds dependency graphs from change groups.
#[derive(Clone)]
pub struct GraphEnricher {
    convert: NameConverter,
}

impl std::fmt::Debug for GraphEnricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphEnricher").finish_non_exhaustive()
    }
}

/// Lookup tables from dependency target text to the vertex providing it.
///
/// Built once from all groups, then only queried.
struct VertexIndexes {
    object: HashMap<(String, String), NodeIndex>,
    schema_object: HashMap<String, NodeIndex>,
    object_change: HashMap<(String, String), NodeIndex>,
    schema_object_change: HashMap<String, NodeIndex>,
}

impl VertexIndexes {
    fn build<G: SortableDependencyGroup>(graph: &DependencyGraph<G>, convert: &NameConverter) -> Self {
        let mut indexes = Self {
            object: HashMap::new(),
            schema_object: HashMap::new(),
            object_change: HashMap::new(),
            schema_object_change: HashMap::new(),
        };

        for index in graph.indices() {
            for change in graph.vertex(index).components() {
                let schema = change.schema().to_string();
                let object = convert(change.object_name());

                // Keep the latest change for an object name.
                let latest = |existing: Option<&NodeIndex>| match existing {
                    None => true,
                    Some(existing) => graph
                        .vertex(*existing)
                        .components()
                        .first()
                        .is_some_and(|first| first.order_within_object < change.order_within_object),
                };

                let key = (schema.clone(), object);
                if latest(indexes.object.get(&key)) {
                    indexes.object.insert(key, index);
                }

                let key = convert(&format!("{}.{}", change.schema(), change.object_name()));
                if latest(indexes.schema_object.get(&key)) {
                    indexes.schema_object.insert(key, index);
                }

                let key = convert(&format!("{}.{}", change.object_name(), change.change_name()));
                indexes.object_change.insert((schema, key), index);

                let key = convert(&format!(
                    "{}.{}.{}",
                    change.schema(),
                    change.object_name(),
                    change.change_name()
                ));
                indexes.schema_object_change.insert(key, index);
            }
        }
        indexes
    }

    /// Resolve a dependency target declared by a change in `schema`, most specific index last.
    fn resolve(&self, schema: &str, target: &str, convert: &NameConverter) -> Option<NodeIndex> {
        let converted = convert(target);
        self.object
            .get(&(schema.to_string(), converted.clone()))
            .or_else(|| self.schema_object.get(&converted))
            .or_else(|| self.object_change.get(&(schema.to_string(), converted.clone())))
            .or_else(|| self.schema_object_change.get(&converted))
            .copied()
    }
}

impl GraphEnricher {
    /// Enricher normalizing names with `convert`.
    pub fn new(convert: NameConverter) -> Self {
        Self { convert }
    }

    /// Build the dependency graph over the given groups.
    ///
    /// Declared and discovered dependencies become edges from the resolved vertex to the
    /// dependent group; consecutive changes of one object are chained by implicit edges, reversed
    /// when `rollback` is set. Fails if the result has a cycle.
    pub fn build_graph<G>(&self, groups: Vec<G>, rollback: bool) -> DeployResult<DependencyGraph<G>>
    where
        G: SortableDependencyGroup + VertexLabel,
    {
        let mut graph = DependencyGraph::new();
        for group in groups {
            graph.add_vertex(group);
        }

        let indexes = VertexIndexes::build(&graph, &self.convert);

        let mut edges = Vec::new();
        for index in graph.indices() {
            for change in graph.vertex(index).components() {
                let Some(dependencies) = &change.code_dependencies else {
                    continue;
                };
                for dependency in dependencies {
                    match indexes.resolve(change.schema(), &dependency.target, &self.convert) {
                        Some(found) => {
                            trace!(dependency = %dependency.target, change = %change.key, "Resolved dependency");
                            edges.push((found, index, dependency.kind));
                        }
                        None => {
                            trace!(
                                dependency = %dependency.target,
                                change = %change.key,
                                "Dependency not found in the graph; ignoring"
                            );
                        }
                    }
                }
            }
        }
        edges.extend(self.implicit_edges(&graph, rollback));

        for (from, to, kind) in edges {
            graph.add_edge(from, to, kind);
        }

        graph.validate_no_cycles()?;
        Ok(graph)
    }

    /// Edges between consecutive changes of the same object.
    fn implicit_edges<G: SortableDependencyGroup>(
        &self,
        graph: &DependencyGraph<G>,
        rollback: bool,
    ) -> Vec<(NodeIndex, NodeIndex, DependencyKind)> {
        let mut by_object: HashMap<String, Vec<(i32, NodeIndex)>> = HashMap::new();
        let mut object_order = Vec::new();
        for index in graph.indices() {
            for change in graph.vertex(index).components() {
                let key = format!(
                    "{}:{}:{}",
                    change.change_type().implicit_ordering_name(),
                    change.schema(),
                    (self.convert)(change.object_name())
                );
                by_object
                    .entry(key.clone())
                    .or_insert_with(|| {
                        object_order.push(key);
                        Vec::new()
                    })
                    .push((change.order_within_object, index));
            }
        }

        let mut edges = Vec::new();
        for key in object_order {
            let Some(mut members) = by_object.remove(&key) else {
                continue;
            };
            members.sort_by_key(|(order, _)| *order);
            for pair in members.windows(2) {
                let (each, next) = (pair[0].1, pair[1].1);
                let (from, to) = if rollback { (next, each) } else { (each, next) };
                edges.push((from, to, DependencyKind::Implicit));
            }
        }
        edges
    }

    /// Build a graph where `dependencies_of` names the inputs each input depends on.
    ///
    /// Dependencies that are not among the inputs are ignored.
    pub fn build_simple_graph<T, I>(
        inputs: Vec<T>,
        dependencies_of: impl Fn(&T) -> I,
    ) -> DependencyGraph<T>
    where
        T: Eq + Hash + Clone,
        I: IntoIterator<Item = T>,
    {
        let mut graph = DependencyGraph::new();
        let mut by_value = HashMap::new();
        for input in inputs {
            let index = graph.add_vertex(input.clone());
            by_value.insert(input, index);
        }

        let mut edges = Vec::new();
        for index in graph.indices() {
            for dependency in dependencies_of(graph.vertex(index)) {
                match by_value.get(&dependency) {
                    Some(found) => edges.push((*found, index)),
                    None => trace!("Dependency outside of the graph inputs; ignoring"),
                }
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to, DependencyKind::Explicit);
        }
        graph
    }
}
