use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use terrace_domain::{Address, ResourceSpec};
use terrace_store::{StateEntity, StateSnapshot};

use crate::error::GraphError;

/// Why an edge exists. Every edge means "source before target".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// The target reads an attribute of the source.
    Reference,
    /// Explicit `depends_on` hint.
    DependsOn,
    /// Teardown order derived from recorded dependencies: the target is
    /// scheduled for deletion and the source used to depend on it.
    Teardown,
}

/// One resource: declared, recorded, or both.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub address: Address,
    pub spec: Option<ResourceSpec>,
    pub state: Option<StateEntity>,
}

impl GraphNode {
    /// Present in state but no longer declared; scheduled for deletion.
    pub fn is_orphan(&self) -> bool {
        self.spec.is_none()
    }

    pub fn provider_id(&self) -> &str {
        match (&self.spec, &self.state) {
            (Some(spec), _) => &spec.provider_id,
            (None, Some(state)) => &state.provider_id,
            (None, None) => "",
        }
    }
}

/// Serializable view of one node for tooling output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeView {
    pub address: Address,
    pub orphan: bool,
    pub dependencies: Vec<Address>,
}

/// Dependency graph over declared specs and recorded-but-undeclared entities.
///
/// Nodes live in a petgraph arena and are addressed by index; `order` holds a
/// stable topological order (ties broken by address).
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<GraphNode, EdgeKind>,
    index: BTreeMap<Address, NodeIndex>,
    order: Vec<NodeIndex>,
}

/// Check a spec set on its own: duplicates, dangling references and cycles.
///
/// Cheap enough to run before any lock is taken.
pub fn validate_specs(specs: &[ResourceSpec]) -> Result<(), GraphError> {
    DependencyGraph::build(specs, &StateSnapshot::new("")).map(|_| ())
}

impl DependencyGraph {
    /// Build the graph for `specs` against the entities recorded in `snapshot`.
    ///
    /// Edges:
    /// 1. referenced/hinted spec → referencing spec
    /// 2. declared node → orphan it used to depend on
    /// 3. orphan → orphan it used to depend on (reverse of the recorded edge)
    ///
    /// A recorded dependency of an orphan on a node that is still declared
    /// adds no edge; the plan builder orders that teardown against the
    /// declared node's own destroy step.
    pub fn build(specs: &[ResourceSpec], snapshot: &StateSnapshot) -> Result<Self, GraphError> {
        let mut graph: DiGraph<GraphNode, EdgeKind> = DiGraph::new();
        let mut index: BTreeMap<Address, NodeIndex> = BTreeMap::new();

        for spec in specs {
            let address = spec.address();
            if index.contains_key(&address) {
                return Err(GraphError::DuplicateAddress(address));
            }
            let node = GraphNode {
                address: address.clone(),
                spec: Some(spec.clone()),
                state: snapshot.entity(&address).cloned(),
            };
            index.insert(address, graph.add_node(node));
        }

        for entity in snapshot.entities.values() {
            if index.contains_key(&entity.address) {
                continue;
            }
            let node = GraphNode {
                address: entity.address.clone(),
                spec: None,
                state: Some(entity.clone()),
            };
            index.insert(entity.address.clone(), graph.add_node(node));
        }

        // ── Declared edges ────────────────────────────────────────────────────
        for spec in specs {
            let address = spec.address();
            let to = index[&address];
            let referenced: Vec<Address> = spec.references().into_iter().map(|r| r.address.clone()).collect();
            for dep in spec.dependencies() {
                if dep == address {
                    return Err(GraphError::Cycle(vec![address]));
                }
                let from = match index.get(&dep) {
                    Some(&ix) if !graph[ix].is_orphan() => ix,
                    _ => {
                        return Err(GraphError::DanglingReference {
                            from: address.clone(),
                            to: dep,
                        })
                    }
                };
                let kind = if referenced.contains(&dep) {
                    EdgeKind::Reference
                } else {
                    EdgeKind::DependsOn
                };
                graph.update_edge(from, to, kind);
            }
        }

        // ── Teardown edges ────────────────────────────────────────────────────
        let recorded: Vec<(NodeIndex, Vec<Address>)> = graph
            .node_indices()
            .filter_map(|ix| {
                graph[ix]
                    .state
                    .as_ref()
                    .map(|s| (ix, s.dependencies.iter().cloned().collect()))
            })
            .collect();
        for (ix, deps) in recorded {
            for dep in deps {
                let Some(&target) = index.get(&dep) else {
                    continue;
                };
                if target == ix || !graph[target].is_orphan() {
                    continue;
                }
                graph.update_edge(ix, target, EdgeKind::Teardown);
            }
        }

        if let Some(cycle) = minimal_cycle(&graph) {
            return Err(GraphError::Cycle(cycle));
        }

        let order = stable_topological_order(&graph);
        Ok(DependencyGraph { graph, index, order })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Nodes in stable topological order.
    pub fn iter(&self) -> impl Iterator<Item = &GraphNode> + '_ {
        self.order.iter().map(move |&ix| &self.graph[ix])
    }

    /// Addresses in stable topological order.
    pub fn order(&self) -> Vec<&Address> {
        self.iter().map(|n| &n.address).collect()
    }

    pub fn node(&self, address: &Address) -> Option<&GraphNode> {
        self.index.get(address).map(|&ix| &self.graph[ix])
    }

    /// Nodes that must come before `address`, sorted.
    pub fn dependencies(&self, address: &Address) -> Vec<&Address> {
        self.neighbors(address, Direction::Incoming)
    }

    /// Nodes that must come after `address`, sorted.
    pub fn dependents(&self, address: &Address) -> Vec<&Address> {
        self.neighbors(address, Direction::Outgoing)
    }

    fn neighbors(&self, address: &Address, dir: Direction) -> Vec<&Address> {
        let Some(&ix) = self.index.get(address) else {
            return Vec::new();
        };
        let mut out: Vec<&Address> = self
            .graph
            .neighbors_directed(ix, dir)
            .map(|n| &self.graph[n].address)
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Every edge as `(before, after, kind)`, sorted.
    pub fn edges(&self) -> Vec<(&Address, &Address, EdgeKind)> {
        let mut edges: Vec<(&Address, &Address, EdgeKind)> = self
            .graph
            .edge_references()
            .map(|e| {
                (
                    &self.graph[e.source()].address,
                    &self.graph[e.target()].address,
                    *e.weight(),
                )
            })
            .collect();
        edges.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        edges
    }

    pub fn views(&self) -> Vec<NodeView> {
        self.iter()
            .map(|n| NodeView {
                address: n.address.clone(),
                orphan: n.is_orphan(),
                dependencies: self.dependencies(&n.address).into_iter().cloned().collect(),
            })
            .collect()
    }

    /// Render as Graphviz DOT. Orphans are dashed.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph terrace {\n  rankdir=LR;\n  node [shape=box];\n\n");
        for node in self.iter() {
            if node.is_orphan() {
                out.push_str(&format!("  \"{}\" [style=dashed];\n", node.address));
            } else {
                out.push_str(&format!("  \"{}\";\n", node.address));
            }
        }
        out.push('\n');
        for (from, to, kind) in self.edges() {
            match kind {
                EdgeKind::Reference => out.push_str(&format!("  \"{from}\" -> \"{to}\";\n")),
                EdgeKind::DependsOn => {
                    out.push_str(&format!("  \"{from}\" -> \"{to}\" [style=dotted];\n"))
                }
                EdgeKind::Teardown => {
                    out.push_str(&format!("  \"{from}\" -> \"{to}\" [style=dashed];\n"))
                }
            }
        }
        out.push_str("}\n");
        out
    }
}

// ── Algorithms ────────────────────────────────────────────────────────────────

fn sorted_successors(graph: &DiGraph<GraphNode, EdgeKind>, ix: NodeIndex) -> Vec<NodeIndex> {
    let mut next: Vec<NodeIndex> = graph.neighbors(ix).collect();
    next.sort_by(|a, b| graph[*a].address.cmp(&graph[*b].address));
    next.dedup();
    next
}

/// Kahn's algorithm, always taking the smallest ready address.
fn stable_topological_order(graph: &DiGraph<GraphNode, EdgeKind>) -> Vec<NodeIndex> {
    let mut remaining: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|ix| (ix, graph.neighbors_directed(ix, Direction::Incoming).count()))
        .collect();
    let mut ready: BinaryHeap<Reverse<(&Address, NodeIndex)>> = remaining
        .iter()
        .filter(|(_, &n)| n == 0)
        .map(|(&ix, _)| Reverse((&graph[ix].address, ix)))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse((_, ix))) = ready.pop() {
        order.push(ix);
        for next in graph.neighbors(ix) {
            if let Some(count) = remaining.get_mut(&next) {
                *count -= 1;
                if *count == 0 {
                    ready.push(Reverse((&graph[next].address, next)));
                }
            }
        }
    }
    order
}

/// The shortest cycle in the graph, rotated to start at its smallest address.
/// Among equally short cycles the lexicographically smallest wins.
fn minimal_cycle(graph: &DiGraph<GraphNode, EdgeKind>) -> Option<Vec<Address>> {
    let mut best: Option<Vec<Address>> = None;
    for component in tarjan_scc(graph) {
        let self_loop = component.len() == 1 && graph.contains_edge(component[0], component[0]);
        if component.len() < 2 && !self_loop {
            continue;
        }
        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        for &start in &component {
            let Some(path) = shortest_cycle_through(graph, start, &members) else {
                continue;
            };
            let mut cycle: Vec<Address> = path.iter().map(|&ix| graph[ix].address.clone()).collect();
            if let Some(pos) = cycle
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.cmp(b.1))
                .map(|(i, _)| i)
            {
                cycle.rotate_left(pos);
            }
            let better = match &best {
                None => true,
                Some(current) => (cycle.len(), &cycle) < (current.len(), current),
            };
            if better {
                best = Some(cycle);
            }
        }
    }
    best
}

/// Breadth-first search for the shortest path `start → … → start` that stays
/// inside one strongly connected component.
fn shortest_cycle_through(
    graph: &DiGraph<GraphNode, EdgeKind>,
    start: NodeIndex,
    members: &HashSet<NodeIndex>,
) -> Option<Vec<NodeIndex>> {
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut seen: HashSet<NodeIndex> = HashSet::from([start]);
    let mut queue: VecDeque<NodeIndex> = VecDeque::from([start]);

    while let Some(ix) = queue.pop_front() {
        for next in sorted_successors(graph, ix) {
            if !members.contains(&next) {
                continue;
            }
            if next == start {
                let mut path = vec![ix];
                let mut cursor = ix;
                while cursor != start {
                    cursor = *parent.get(&cursor)?;
                    path.push(cursor);
                }
                path.reverse();
                return Some(path);
            }
            if seen.insert(next) {
                parent.insert(next, ix);
                queue.push_back(next);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use terrace_domain::{Attributes, Reference, Value};

    fn spec(ty: &str, name: &str) -> ResourceSpec {
        ResourceSpec::new(ty, name, "local")
    }

    fn reference(target: &str, attr: &str) -> Value {
        Value::Reference(Reference::new(Address::parse(target).unwrap(), attr))
    }

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn empty() -> StateSnapshot {
        StateSnapshot::new("lin")
    }

    fn recorded(address: &str, deps: &[&str]) -> StateEntity {
        let mut entity = StateEntity::new(addr(address), "local", Attributes::new());
        entity.dependencies = deps.iter().map(|d| addr(d)).collect();
        entity
    }

    #[test]
    fn references_order_referenced_first() {
        let specs = vec![
            spec("host", "web").with_attribute("net", reference("net.main", "id")),
            spec("net", "main"),
        ];
        let graph = DependencyGraph::build(&specs, &empty()).unwrap();
        assert_eq!(graph.order(), vec![&addr("net.main"), &addr("host.web")]);
        assert_eq!(graph.dependencies(&addr("host.web")), vec![&addr("net.main")]);
        assert_eq!(graph.edges()[0].2, EdgeKind::Reference);
    }

    #[test]
    fn ties_break_by_address() {
        let specs = vec![spec("host", "c"), spec("host", "a"), spec("host", "b")];
        let graph = DependencyGraph::build(&specs, &empty()).unwrap();
        assert_eq!(
            graph.order(),
            vec![&addr("host.a"), &addr("host.b"), &addr("host.c")]
        );
    }

    #[test]
    fn depends_on_hint_adds_edge() {
        let specs = vec![
            spec("host", "a").with_depends_on(addr("host.z")),
            spec("host", "z"),
        ];
        let graph = DependencyGraph::build(&specs, &empty()).unwrap();
        assert_eq!(graph.order(), vec![&addr("host.z"), &addr("host.a")]);
        assert_eq!(graph.edges()[0].2, EdgeKind::DependsOn);
    }

    #[test]
    fn cycle_reports_minimal_cycle() {
        // a -> b -> c -> a plus a shortcut making b <-> c the shortest loop
        let specs = vec![
            spec("host", "a").with_attribute("x", reference("host.c", "id")),
            spec("host", "b").with_attribute("x", reference("host.a", "id"))
                .with_attribute("y", reference("host.c", "id")),
            spec("host", "c").with_attribute("x", reference("host.b", "id")),
        ];
        let err = DependencyGraph::build(&specs, &empty()).unwrap_err();
        assert_eq!(err, GraphError::Cycle(vec![addr("host.b"), addr("host.c")]));
        assert_eq!(
            err.to_string(),
            "dependency cycle detected: host.b -> host.c -> host.b"
        );
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let specs = vec![spec("host", "a").with_attribute("x", reference("host.a", "id"))];
        assert_eq!(
            validate_specs(&specs),
            Err(GraphError::Cycle(vec![addr("host.a")]))
        );
    }

    #[test]
    fn dangling_reference_fails() {
        let specs = vec![spec("host", "a").with_attribute("x", reference("net.gone", "id"))];
        assert!(matches!(
            validate_specs(&specs),
            Err(GraphError::DanglingReference { .. })
        ));
    }

    #[test]
    fn reference_to_orphan_is_dangling() {
        let mut snap = empty();
        snap.upsert(recorded("net.old", &[]));
        let specs = vec![spec("host", "a").with_attribute("x", reference("net.old", "id"))];
        assert!(matches!(
            DependencyGraph::build(&specs, &snap),
            Err(GraphError::DanglingReference { .. })
        ));
    }

    #[test]
    fn duplicate_address_fails() {
        let specs = vec![spec("host", "a"), spec("host", "a")];
        assert_eq!(
            validate_specs(&specs),
            Err(GraphError::DuplicateAddress(addr("host.a")))
        );
    }

    #[test]
    fn orphans_are_torn_down_after_their_dependents() {
        // state: host.app -> net.old -> vpc.old ; config keeps only host.app
        let mut snap = empty();
        snap.upsert(recorded("host.app", &["net.old"]));
        snap.upsert(recorded("net.old", &["vpc.old"]));
        snap.upsert(recorded("vpc.old", &[]));
        let specs = vec![spec("host", "app")];

        let graph = DependencyGraph::build(&specs, &snap).unwrap();
        assert!(graph.node(&addr("net.old")).unwrap().is_orphan());
        assert!(!graph.node(&addr("host.app")).unwrap().is_orphan());
        assert_eq!(
            graph.order(),
            vec![&addr("host.app"), &addr("net.old"), &addr("vpc.old")]
        );
    }

    #[test]
    fn orphan_dependency_on_declared_node_adds_no_edge() {
        // state: host.new -> host.old -> net.main; config: host.new -> net.main
        let mut snap = empty();
        snap.upsert(recorded("host.new", &["host.old"]));
        snap.upsert(recorded("host.old", &["net.main"]));
        snap.upsert(recorded("net.main", &[]));
        let specs = vec![
            spec("host", "new").with_attribute("n", reference("net.main", "id")),
            spec("net", "main"),
        ];
        let graph = DependencyGraph::build(&specs, &snap).unwrap();
        assert!(graph.dependents(&addr("host.old")).is_empty());
        assert_eq!(graph.dependencies(&addr("host.old")), vec![&addr("host.new")]);
    }

    #[test]
    fn dot_marks_orphans() {
        let mut snap = empty();
        snap.upsert(recorded("host.gone", &[]));
        let graph = DependencyGraph::build(&[spec("host", "a")], &snap).unwrap();
        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph terrace {"));
        assert!(dot.contains("\"host.gone\" [style=dashed];"));
        assert!(dot.contains("\"host.a\";"));
    }

    #[test]
    fn views_list_dependencies() {
        let specs = vec![
            spec("host", "web").with_attribute("net", reference("net.main", "id")),
            spec("net", "main"),
        ];
        let graph = DependencyGraph::build(&specs, &empty()).unwrap();
        let views = graph.views();
        assert_eq!(views[1].address, addr("host.web"));
        assert_eq!(views[1].dependencies, vec![addr("net.main")]);
    }
}
