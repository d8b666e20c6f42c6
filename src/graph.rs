//! Execution graph primitives and the fragment algebra.
//!
//! Planning produces [`ExecutionFragment`]s — internally acyclic subgraphs
//! with declared entry and exit node sets — and composes them with three
//! operations: [`ExecutionFragment::add_node`], [`ExecutionFragment::merge`]
//! and [`ExecutionFragment::link`]. The finished composition becomes an
//! [`ExecutionGraph`], the whole-run DAG handed to the engine.
//!
//! All node collections are ordered (`BTreeMap`/`BTreeSet`), so identical
//! planning inputs produce byte-identical graphs, entry sets, and exit sets.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::host::Host;
use crate::step::Step;

/// Identifier of a node, unique within its graph.
///
/// Planners derive ids as a pure function of task name, logical step name,
/// and (for per-host nodes) host name, so replanning is stable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Provenance of a node: which module and task planned it.
///
/// Used at execution time to address the right module/task caches; it never
/// affects scheduling. The task side is stamped by the planning task, the
/// module side by the module composer during merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeScope {
    pub module: String,
    pub task: String,
}

/// One vertex of the graph: a step applied to a set of hosts.
///
/// The scheduler treats the per-host invocations as independent concurrent
/// work items, but the node is done only when all of them reach a terminal
/// state.
#[derive(Clone)]
pub struct ExecutionNode {
    pub id: NodeId,
    /// Human-readable name for logs and the result table.
    pub name: String,
    pub step: Arc<dyn Step>,
    pub hosts: Vec<Host>,
    pub deps: BTreeSet<NodeId>,
    pub scope: NodeScope,
}

impl ExecutionNode {
    pub fn new(
        id: impl Into<NodeId>,
        name: impl Into<String>,
        step: Arc<dyn Step>,
        hosts: Vec<Host>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            step,
            hosts,
            deps: BTreeSet::new(),
            scope: NodeScope::default(),
        }
    }

    #[must_use]
    pub fn depends_on(mut self, id: impl Into<NodeId>) -> Self {
        self.deps.insert(id.into());
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: NodeScope) -> Self {
        self.scope = scope;
        self
    }
}

impl fmt::Debug for ExecutionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionNode")
            .field("id", &self.id)
            .field("step", &self.step.meta().name)
            .field("hosts", &self.hosts.iter().map(Host::name).collect::<Vec<_>>())
            .field("deps", &self.deps)
            .finish()
    }
}

fn format_cycle(path: &[NodeId]) -> String {
    path.iter()
        .map(NodeId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Failure modes of graph construction and validation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GraphError {
    /// A node id was inserted twice.
    #[error("duplicate node id: {0}")]
    DuplicateNodeId(NodeId),

    /// A dependency references a node the graph does not contain.
    #[error("node '{node}' depends on unknown node '{missing}'")]
    DanglingDependency { node: NodeId, missing: NodeId },

    /// The dependency relation contains a cycle.
    #[error("dependency cycle detected: {}", format_cycle(.0))]
    Cycle(Vec<NodeId>),

    /// A node has an empty host set.
    #[error("node '{0}' has no hosts")]
    EmptyHosts(NodeId),

    /// An operation referenced a node id the fragment does not contain.
    #[error("unknown node id: {0}")]
    UnknownNode(NodeId),
}

/// A subgraph produced by one planning scope.
///
/// Entry nodes have no dependency inside the fragment; exit nodes are
/// depended on by no other node inside the fragment. Both sets are derived
/// deterministically from the dependency relation by
/// [`calculate_entry_and_exit_nodes`](Self::calculate_entry_and_exit_nodes).
#[derive(Debug, Clone, Default)]
pub struct ExecutionFragment {
    name: String,
    nodes: BTreeMap<NodeId, ExecutionNode>,
    entry_nodes: Vec<NodeId>,
    exit_nodes: Vec<NodeId>,
}

impl ExecutionFragment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The sentinel "no work" fragment.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &BTreeMap<NodeId, ExecutionNode> {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut BTreeMap<NodeId, ExecutionNode> {
        &mut self.nodes
    }

    pub fn node(&self, id: &NodeId) -> Option<&ExecutionNode> {
        self.nodes.get(id)
    }

    pub fn entry_nodes(&self) -> &[NodeId] {
        &self.entry_nodes
    }

    pub fn exit_nodes(&self) -> &[NodeId] {
        &self.exit_nodes
    }

    /// Inserts a node, failing on id collision.
    pub fn add_node(&mut self, node: ExecutionNode) -> Result<NodeId, GraphError> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateNodeId(node.id.clone()));
        }
        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        Ok(id)
    }

    /// Adopts every node from `other`.
    ///
    /// Callers are responsible for id uniqueness (convention: prefix ids
    /// with the producing task or module name). Entry/exit sets are stale
    /// afterwards until recomputed.
    pub fn merge(&mut self, other: ExecutionFragment) -> Result<(), GraphError> {
        for (id, node) in other.nodes {
            if self.nodes.contains_key(&id) {
                return Err(GraphError::DuplicateNodeId(id));
            }
            self.nodes.insert(id, node);
        }
        Ok(())
    }

    /// Wires every node in `next_entries` to depend on every node in
    /// `prev_exits`, skipping duplicates.
    ///
    /// Entry/exit sets are stale afterwards until recomputed.
    pub fn link(
        &mut self,
        prev_exits: &[NodeId],
        next_entries: &[NodeId],
    ) -> Result<(), GraphError> {
        for entry in next_entries {
            let node = self
                .nodes
                .get_mut(entry)
                .ok_or_else(|| GraphError::UnknownNode(entry.clone()))?;
            for exit in prev_exits {
                node.deps.insert(exit.clone());
            }
        }
        Ok(())
    }

    /// Recomputes the entry and exit node sets from the dependency relation.
    ///
    /// Entries are nodes whose dependencies are empty or refer only to nodes
    /// outside this fragment; exits are nodes no other node inside the
    /// fragment depends on. A pure function of the current node set.
    pub fn calculate_entry_and_exit_nodes(&mut self) {
        let mut depended_upon: BTreeSet<&NodeId> = BTreeSet::new();
        for node in self.nodes.values() {
            for dep in &node.deps {
                if self.nodes.contains_key(dep) {
                    depended_upon.insert(dep);
                }
            }
        }

        self.entry_nodes = self
            .nodes
            .values()
            .filter(|node| node.deps.iter().all(|dep| !self.nodes.contains_key(dep)))
            .map(|node| node.id.clone())
            .collect();

        self.exit_nodes = self
            .nodes
            .keys()
            .filter(|id| !depended_upon.contains(id))
            .cloned()
            .collect();
    }

    /// Checks dependency resolution, acyclicity, and per-node invariants.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in self.nodes.values() {
            if node.hosts.is_empty() {
                return Err(GraphError::EmptyHosts(node.id.clone()));
            }
            for dep in &node.deps {
                if !self.nodes.contains_key(dep) {
                    return Err(GraphError::DanglingDependency {
                        node: node.id.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }
        self.check_acyclic()
    }

    /// Three-color depth-first search; white = unvisited, gray = on the
    /// current path, black = finished.
    fn check_acyclic(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn visit(
            id: &NodeId,
            nodes: &BTreeMap<NodeId, ExecutionNode>,
            colors: &mut BTreeMap<NodeId, Color>,
            path: &mut Vec<NodeId>,
        ) -> Result<(), GraphError> {
            colors.insert(id.clone(), Color::Gray);
            path.push(id.clone());

            if let Some(node) = nodes.get(id) {
                for dep in &node.deps {
                    match colors.get(dep).copied().unwrap_or(Color::White) {
                        Color::Gray => {
                            let start = path.iter().position(|p| p == dep).unwrap_or(0);
                            let mut cycle: Vec<NodeId> = path[start..].to_vec();
                            cycle.push(dep.clone());
                            return Err(GraphError::Cycle(cycle));
                        }
                        Color::White => visit(dep, nodes, colors, path)?,
                        Color::Black => {}
                    }
                }
            }

            path.pop();
            colors.insert(id.clone(), Color::Black);
            Ok(())
        }

        let mut colors = BTreeMap::new();
        let mut path = Vec::new();
        for id in self.nodes.keys() {
            if colors.get(id).copied().unwrap_or(Color::White) == Color::White {
                visit(id, &self.nodes, &mut colors, &mut path)?;
            }
        }
        Ok(())
    }

    /// Finalizes this fragment into a graph with the given name.
    pub fn into_graph(mut self, name: impl Into<String>) -> ExecutionGraph {
        self.calculate_entry_and_exit_nodes();
        ExecutionGraph {
            name: name.into(),
            fragment: self,
        }
    }
}

/// The finalized whole-run DAG handed to the engine.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    name: String,
    fragment: ExecutionFragment,
}

impl ExecutionGraph {
    /// An empty graph carrying only a name; `run` treats it as a successful
    /// no-op.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fragment: ExecutionFragment::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.fragment.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fragment.len()
    }

    pub fn nodes(&self) -> &BTreeMap<NodeId, ExecutionNode> {
        self.fragment.nodes()
    }

    pub fn node(&self, id: &NodeId) -> Option<&ExecutionNode> {
        self.fragment.node(id)
    }

    pub fn entry_nodes(&self) -> &[NodeId] {
        self.fragment.entry_nodes()
    }

    pub fn exit_nodes(&self) -> &[NodeId] {
        self.fragment.exit_nodes()
    }

    /// A graph is valid iff all dependencies resolve, no cycle exists, and
    /// every node has at least one host.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.fragment.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{CommandSpec, Connector, ExecOutput, FileStat, TransferSource};
    use crate::context::StepContext;
    use crate::step::StepMeta;
    use async_trait::async_trait;
    use camino::Utf8Path;

    struct NullConnector;

    #[async_trait]
    impl Connector for NullConnector {
        async fn exec(&self, _spec: &CommandSpec) -> anyhow::Result<ExecOutput> {
            Ok(ExecOutput::default())
        }

        async fn put(
            &self,
            _source: &TransferSource,
            _dest: &Utf8Path,
            _mode: u32,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn fetch(&self, _path: &Utf8Path) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn stat(&self, _path: &Utf8Path) -> anyhow::Result<Option<FileStat>> {
            Ok(None)
        }
    }

    struct NoopStep {
        meta: StepMeta,
    }

    impl NoopStep {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                meta: StepMeta::new("noop", "does nothing"),
            })
        }
    }

    #[async_trait]
    impl Step for NoopStep {
        fn meta(&self) -> &StepMeta {
            &self.meta
        }

        async fn precheck(&self, _ctx: &StepContext) -> anyhow::Result<bool> {
            Ok(false)
        }

        async fn run(&self, _ctx: &StepContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn host(name: &str) -> Host {
        Host::builder(name, Arc::new(NullConnector)).build()
    }

    fn node(id: &str) -> ExecutionNode {
        ExecutionNode::new(id, id, NoopStep::new(), vec![host("h1")])
    }

    #[test]
    fn add_node_rejects_duplicate_id() {
        let mut fragment = ExecutionFragment::new("t");
        fragment.add_node(node("a")).unwrap();
        let err = fragment.add_node(node("a")).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateNodeId(id) if id.as_str() == "a"));
    }

    #[test]
    fn entry_and_exit_derivation() {
        let mut fragment = ExecutionFragment::new("t");
        fragment.add_node(node("a")).unwrap();
        fragment.add_node(node("b").depends_on("a")).unwrap();
        fragment.add_node(node("c").depends_on("a")).unwrap();
        fragment.calculate_entry_and_exit_nodes();

        assert_eq!(fragment.entry_nodes(), &[NodeId::from("a")]);
        assert_eq!(fragment.exit_nodes(), &[NodeId::from("b"), NodeId::from("c")]);
    }

    #[test]
    fn external_deps_count_as_entries() {
        let mut fragment = ExecutionFragment::new("t");
        fragment.add_node(node("b").depends_on("outside")).unwrap();
        fragment.calculate_entry_and_exit_nodes();
        assert_eq!(fragment.entry_nodes(), &[NodeId::from("b")]);
    }

    #[test]
    fn merge_rejects_collisions() {
        let mut left = ExecutionFragment::new("l");
        left.add_node(node("shared")).unwrap();
        let mut right = ExecutionFragment::new("r");
        right.add_node(node("shared")).unwrap();

        let err = left.merge(right).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateNodeId(_)));
    }

    #[test]
    fn link_wires_every_entry_to_every_exit() {
        let mut fragment = ExecutionFragment::new("m");
        fragment.add_node(node("a1")).unwrap();
        fragment.add_node(node("a2")).unwrap();
        fragment.add_node(node("b1")).unwrap();
        fragment.add_node(node("b2")).unwrap();

        let prev = [NodeId::from("a1"), NodeId::from("a2")];
        let next = [NodeId::from("b1"), NodeId::from("b2")];
        fragment.link(&prev, &next).unwrap();
        // Linking twice must not duplicate dependencies.
        fragment.link(&prev, &next).unwrap();
        fragment.calculate_entry_and_exit_nodes();

        for id in &next {
            let deps = &fragment.node(id).unwrap().deps;
            assert_eq!(deps.len(), 2);
        }
        assert_eq!(fragment.entry_nodes(), &prev);
        assert_eq!(fragment.exit_nodes(), &next);
    }

    #[test]
    fn link_unknown_entry_fails() {
        let mut fragment = ExecutionFragment::new("m");
        fragment.add_node(node("a")).unwrap();
        let err = fragment
            .link(&[NodeId::from("a")], &[NodeId::from("ghost")])
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownNode(_)));
    }

    #[test]
    fn merge_then_link_of_disjoint_acyclic_fragments_stays_acyclic() {
        let mut first = ExecutionFragment::new("first");
        first.add_node(node("f/a")).unwrap();
        first.add_node(node("f/b").depends_on("f/a")).unwrap();
        first.calculate_entry_and_exit_nodes();

        let mut second = ExecutionFragment::new("second");
        second.add_node(node("s/a")).unwrap();
        second.add_node(node("s/b").depends_on("s/a")).unwrap();
        second.calculate_entry_and_exit_nodes();

        let prev_exits = first.exit_nodes().to_vec();
        let next_entries = second.entry_nodes().to_vec();

        let mut combined = ExecutionFragment::new("combined");
        combined.merge(first).unwrap();
        combined.merge(second).unwrap();
        combined.link(&prev_exits, &next_entries).unwrap();
        combined.calculate_entry_and_exit_nodes();

        combined.validate().unwrap();
        assert_eq!(combined.entry_nodes(), &[NodeId::from("f/a")]);
        assert_eq!(combined.exit_nodes(), &[NodeId::from("s/b")]);
    }

    #[test]
    fn validate_reports_dangling_dependency() {
        let mut fragment = ExecutionFragment::new("t");
        fragment.add_node(node("a").depends_on("missing")).unwrap();
        let err = fragment.validate().unwrap_err();
        assert!(
            matches!(err, GraphError::DanglingDependency { node, missing }
                if node.as_str() == "a" && missing.as_str() == "missing")
        );
    }

    #[test]
    fn validate_reports_cycle_with_path() {
        let mut fragment = ExecutionFragment::new("t");
        fragment.add_node(node("a").depends_on("c")).unwrap();
        fragment.add_node(node("b").depends_on("a")).unwrap();
        fragment.add_node(node("c").depends_on("b")).unwrap();

        let err = fragment.validate().unwrap_err();
        match err {
            GraphError::Cycle(path) => {
                assert!(path.len() >= 3);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn validate_rejects_empty_host_set() {
        let mut fragment = ExecutionFragment::new("t");
        fragment
            .add_node(ExecutionNode::new("a", "a", NoopStep::new(), Vec::new()))
            .unwrap();
        let err = fragment.validate().unwrap_err();
        assert!(matches!(err, GraphError::EmptyHosts(_)));
    }

    #[test]
    fn equal_fragments_produce_equal_entry_exit_sets() {
        let build = || {
            let mut fragment = ExecutionFragment::new("t");
            fragment.add_node(node("z")).unwrap();
            fragment.add_node(node("a").depends_on("z")).unwrap();
            fragment.add_node(node("m").depends_on("z")).unwrap();
            fragment.calculate_entry_and_exit_nodes();
            fragment
        };
        let one = build();
        let two = build();
        assert_eq!(one.entry_nodes(), two.entry_nodes());
        assert_eq!(one.exit_nodes(), two.exit_nodes());
    }

    #[test]
    fn empty_graph_is_valid() {
        let graph = ExecutionGraph::empty("noop");
        assert!(graph.is_empty());
        graph.validate().unwrap();
    }
}
