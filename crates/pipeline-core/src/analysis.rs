//! The dependency graph constructed during one term evaluation.
//!
//! An `Analysis` is a labeled DAG: one node per evaluated term component,
//! edges pointing from a derived node to the dependencies it was built
//! from. It is assembled bottom-up as evaluation proceeds — each
//! combinator (`Map`, `Pair`, `Bind`, ...) merges its children's
//! `Analysis` graphs and adds one node of its own, per the "sub-terms
//! shared by value-identity share nodes" and "no cycles" invariants.
//! Node ids are allocated from a monotonic counter that `term::Env`
//! resets at the start of every evaluation pass, in a fixed (post-order)
//! allocation order, so re-evaluating an unchanged term produces a
//! structurally identical graph.

use crate::input::JobId;
use std::collections::HashSet;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// Allocates node ids in evaluation order. Owned by `term::Env` and reset
/// to 1 at the start of each `Term::eval` call at the root.
#[derive(Debug, Default)]
pub struct NodeIdAllocator(u64);

impl NodeIdAllocator {
    pub fn next(&mut self) -> NodeId {
        self.0 += 1;
        NodeId(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Constant,
    Primitive,
    Bind,
    Pair,
    Map,
    Gate,
    State,
    Catch,
    All,
    ListMap,
    Failed,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Ok,
    Err,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    Running,
    ReadyToRerun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Ready(ReadyState),
    Active(ActiveState),
    /// A `Bind`/`BindInput` whose static half has not yet resolved to
    /// `Ok`, so its continuation has not been called and no dynamic
    /// children exist yet.
    Blocked,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub label: String,
    pub kind: NodeKind,
    pub state: NodeState,
    pub job_id: Option<JobId>,
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    /// `true` for a `Bind`/`BindInput`'s edge to its already-evaluated
    /// left side; `false` for the dynamic edge to the continuation's
    /// result, or for any non-Bind edge (which has no static/dynamic
    /// distinction to begin with).
    pub is_static: bool,
}

/// One evaluation's dependency graph. Constructed bottom-up via `leaf`
/// and `compose`; never mutated after an evaluation completes.
#[derive(Debug, Clone)]
pub struct Analysis {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    root: NodeId,
}

impl Analysis {
    /// Sentinel analysis shown before the engine's first tick completes.
    pub fn booting() -> Self {
        Analysis {
            nodes: vec![Node {
                id: NodeId(0),
                label: "booting".to_string(),
                kind: NodeKind::Active,
                state: NodeState::Active(ActiveState::Running),
                job_id: None,
            }],
            edges: vec![],
            root: NodeId(0),
        }
    }

    /// Build a leaf node (no children): `Return`, `Fail`, `Active`, or
    /// `Primitive`.
    pub fn leaf(
        alloc: &mut NodeIdAllocator,
        kind: NodeKind,
        label: impl Into<String>,
        state: NodeState,
        job_id: Option<JobId>,
    ) -> Self {
        let id = alloc.next();
        Analysis {
            nodes: vec![Node {
                id,
                label: label.into(),
                kind,
                state,
                job_id,
            }],
            edges: vec![],
            root: id,
        }
    }

    /// Merge `children` (each paired with whether its edge from the new
    /// node is a Bind-style static edge) under one new node.
    ///
    /// A child analysis may appear more than once among `children`, or
    /// share nodes with a sibling child, when the term tree reaches the
    /// same sub-term by value-identity through more than one path (see
    /// `term::Env`'s node cache). Nodes and edges are deduped by id so
    /// such sharing collapses onto one node with multiple incoming edges
    /// rather than duplicating the shared subtree.
    pub fn compose(
        alloc: &mut NodeIdAllocator,
        kind: NodeKind,
        label: impl Into<String>,
        state: NodeState,
        job_id: Option<JobId>,
        children: Vec<(Analysis, bool)>,
    ) -> Self {
        let id = alloc.next();
        let mut nodes = vec![Node {
            id,
            label: label.into(),
            kind,
            state,
            job_id,
        }];
        let mut edges = Vec::new();
        let mut seen_nodes: HashSet<NodeId> = HashSet::from([id]);
        let mut seen_edges: HashSet<(NodeId, NodeId, bool)> = HashSet::new();
        for (child, is_static) in children {
            if seen_edges.insert((id, child.root, is_static)) {
                edges.push(Edge {
                    from: id,
                    to: child.root,
                    is_static,
                });
            }
            for node in child.nodes {
                if seen_nodes.insert(node.id) {
                    nodes.push(node);
                }
            }
            for edge in child.edges {
                if seen_edges.insert((edge.from, edge.to, edge.is_static)) {
                    edges.push(edge);
                }
            }
        }
        Analysis { nodes, edges, root: id }
    }

    /// Rename the root node's label in place, leaving its kind/state/job
    /// untouched. Used by `Component`, which is a pure labeling wrapper
    /// and does not introduce a node of its own.
    pub fn relabel_root(mut self, label: impl Into<String>) -> Self {
        if let Some(root_node) = self.nodes.iter_mut().find(|n| n.id == self.root) {
            root_node.label = label.into();
        }
        self
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn root_node(&self) -> &Node {
        self.nodes.iter().find(|n| n.id == self.root).expect("root node always present")
    }

    /// `job_id(analysis) -> optional id`: the job attributed to the root.
    pub fn job_id(&self) -> Option<&JobId> {
        self.root_node().job_id.as_ref()
    }

    /// Assert the no-cycles invariant. Evaluation never
    /// constructs a cycle by itself; this exists to catch a `Bind`
    /// continuation that (incorrectly) closes over and re-evaluates its
    /// own input, which would otherwise manifest as non-termination
    /// rather than a clean error.
    pub fn assert_acyclic(&self) -> Result<(), NodeId> {
        let mut visiting = HashSet::new();
        let mut done = HashSet::new();
        for node in &self.nodes {
            if !done.contains(&node.id) {
                self.visit(node.id, &mut visiting, &mut done)?;
            }
        }
        Ok(())
    }

    fn visit(&self, id: NodeId, visiting: &mut HashSet<NodeId>, done: &mut HashSet<NodeId>) -> Result<(), NodeId> {
        if done.contains(&id) {
            return Ok(());
        }
        if !visiting.insert(id) {
            return Err(id);
        }
        for edge in self.edges.iter().filter(|e| e.from == id) {
            self.visit(edge.to, visiting, done)?;
        }
        visiting.remove(&id);
        done.insert(id);
        Ok(())
    }

    /// Emit the graph as Graphviz DOT text. `url_of_job` maps a job id to
    /// an optional hyperlink; nodes attributed to a job get a `URL`
    /// attribute when one is available.
    pub fn pp_dot(&self, url_of_job: impl Fn(&JobId) -> Option<String>) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph analysis {{");
        let _ = writeln!(out, "  rankdir=TB;");
        for node in &self.nodes {
            let (color, shape) = style_for(node.state);
            let mut attrs = format!(
                "label=\"{}\\n({:?})\" style=filled fillcolor=\"{}\" shape={}",
                escape(&node.label),
                node.kind,
                color,
                shape
            );
            if let Some(job) = &node.job_id {
                if let Some(url) = url_of_job(job) {
                    let _ = write!(attrs, " URL=\"{}\"", escape(&url));
                }
            }
            let _ = writeln!(out, "  n{} [{}];", node.id.0, attrs);
        }
        for edge in &self.edges {
            let style = if edge.is_static { "solid" } else { "dashed" };
            let _ = writeln!(out, "  n{} -> n{} [style={}];", edge.from.0, edge.to.0, style);
        }
        let _ = writeln!(out, "}}");
        out
    }
}

fn style_for(state: NodeState) -> (&'static str, &'static str) {
    match state {
        NodeState::Ready(ReadyState::Ok) => ("#c8e6c9", "box"),
        NodeState::Ready(ReadyState::Err) => ("#ffcdd2", "box"),
        NodeState::Active(ActiveState::Running) => ("#fff9c4", "ellipse"),
        NodeState::Active(ActiveState::ReadyToRerun) => ("#ffe0b2", "ellipse"),
        NodeState::Blocked => ("#e0e0e0", "diamond"),
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_has_no_edges_and_is_its_own_root() {
        let mut alloc = NodeIdAllocator::default();
        let a = Analysis::leaf(&mut alloc, NodeKind::Constant, "42", NodeState::Ready(ReadyState::Ok), None);
        assert_eq!(a.edges().len(), 0);
        assert_eq!(a.nodes().len(), 1);
        assert_eq!(a.root(), a.nodes()[0].id);
    }

    #[test]
    fn compose_links_new_node_to_each_child_root() {
        let mut alloc = NodeIdAllocator::default();
        let a = Analysis::leaf(&mut alloc, NodeKind::Constant, "a", NodeState::Ready(ReadyState::Ok), None);
        let b = Analysis::leaf(&mut alloc, NodeKind::Constant, "b", NodeState::Ready(ReadyState::Ok), None);
        let pair = Analysis::compose(
            &mut alloc,
            NodeKind::Pair,
            "pair",
            NodeState::Ready(ReadyState::Ok),
            None,
            vec![(a.clone(), false), (b.clone(), false)],
        );
        assert_eq!(pair.nodes().len(), 3);
        assert_eq!(pair.edges().len(), 2);
        assert!(pair.edges().iter().any(|e| e.from == pair.root() && e.to == a.root()));
        assert!(pair.edges().iter().any(|e| e.from == pair.root() && e.to == b.root()));
    }

    #[test]
    fn repeated_construction_yields_equal_ids() {
        let build = || {
            let mut alloc = NodeIdAllocator::default();
            let a = Analysis::leaf(&mut alloc, NodeKind::Constant, "a", NodeState::Ready(ReadyState::Ok), None);
            let b = Analysis::leaf(&mut alloc, NodeKind::Constant, "b", NodeState::Ready(ReadyState::Ok), None);
            Analysis::compose(
                &mut alloc,
                NodeKind::Pair,
                "pair",
                NodeState::Ready(ReadyState::Ok),
                None,
                vec![(a, false), (b, false)],
            )
        };
        let first = build();
        let second = build();
        assert_eq!(first.root(), second.root());
        let first_ids: Vec<_> = first.nodes().iter().map(|n| n.id).collect();
        let second_ids: Vec<_> = second.nodes().iter().map(|n| n.id).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn acyclic_graph_passes_assertion() {
        let mut alloc = NodeIdAllocator::default();
        let a = Analysis::leaf(&mut alloc, NodeKind::Constant, "a", NodeState::Ready(ReadyState::Ok), None);
        assert!(a.assert_acyclic().is_ok());
    }
}
