use std::fmt;

use crate::pool::{Reset, SlotRef};
use crate::tree::edge::EdgeRef;

/// A generation-checked reference to a [`TreeNode`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(pub(crate) SlotRef);

impl NodeRef {
    pub(crate) fn slot(self) -> usize {
        self.0.index()
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({:?})", self.0)
    }
}

/// The cached result of the last full selection scan: children indices and their scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SelectCache {
    pub best: usize,
    pub best_score: f64,
    pub runner_up: usize,
    pub runner_up_score: f64,
}

/// A position in the search graph.
///
/// A node is a game state together with the prefix of the joint move that has already been
/// chosen in it (`pending`).  Nodes with an empty prefix are *full-state* nodes and are shared
/// through the transposition index; nodes with a non-empty prefix are the intermediate levels of
/// a simultaneous move and belong to exactly one parent.
///
/// Score statistics live in the tree's `ScoreVectorStore` at this node's slot index.
pub(crate) struct TreeNode<S, M> {
    pub state: Option<S>,
    pub pending: Vec<M>,
    /// The role whose move led to this node.
    pub deciding_role: usize,
    /// The role choosing among `children`; valid once expanded.
    pub choosing_role: usize,
    pub depth: u32,
    pub visits: u64,
    pub updates: u64,
    pub expanded: bool,
    pub terminal: bool,
    pub complete: bool,
    pub heuristic_seeded: bool,
    pub children: Vec<EdgeRef>,
    pub parents: Vec<NodeRef>,
    pub select_cache: Option<SelectCache>,
}

impl<S, M> Default for TreeNode<S, M> {
    fn default() -> Self {
        Self {
            state: None,
            pending: Vec::new(),
            deciding_role: 0,
            choosing_role: 0,
            depth: 0,
            visits: 0,
            updates: 0,
            expanded: false,
            terminal: false,
            complete: false,
            heuristic_seeded: false,
            children: Vec::new(),
            parents: Vec::new(),
            select_cache: None,
        }
    }
}

impl<S, M> Reset for TreeNode<S, M> {
    fn reset(&mut self) {
        self.state = None;
        self.pending.clear();
        self.deciding_role = 0;
        self.choosing_role = 0;
        self.depth = 0;
        self.visits = 0;
        self.updates = 0;
        self.expanded = false;
        self.terminal = false;
        self.complete = false;
        self.heuristic_seeded = false;
        self.children.clear();
        self.parents.clear();
        self.select_cache = None;
    }
}

impl<S, M> TreeNode<S, M> {
    pub fn is_intermediate(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn add_parent(&mut self, parent: NodeRef) {
        if !self.parents.contains(&parent) {
            self.parents.push(parent);
        }
    }

    pub fn remove_parent(&mut self, parent: NodeRef) {
        self.parents.retain(|p| *p != parent);
    }
}

impl<S: fmt::Debug, M: fmt::Debug> fmt::Debug for TreeNode<S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeNode")
            .field("state", &self.state)
            .field("pending", &self.pending)
            .field("depth", &self.depth)
            .field("visits", &self.visits)
            .field("updates", &self.updates)
            .field("complete", &self.complete)
            .field("children", &self.children.len())
            .field("parents", &self.parents)
            .finish()
    }
}

/// A snapshot of a node's statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    /// Times the node was traversed by selection.
    pub visits: u64,
    /// Rollout results (and heuristic pseudo-results) averaged into the scores.
    pub updates: u64,
    /// Average score per role.
    pub scores: Vec<f64>,
    /// `true` if `scores` are exact.
    pub complete: bool,
    /// `true` if the node is a terminal state.
    pub terminal: bool,
    /// Shortest known distance from the root.
    pub depth: u32,
    /// Number of child edges (zero while unexpanded).
    pub children: usize,
    /// The role whose move led to the node.
    pub deciding_role: usize,
    /// `true` if the node's statistics started from a heuristic estimate.
    pub heuristic_seeded: bool,
}

/// A snapshot of one move available at the root.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveInfo<M> {
    /// The choosing role's move.
    pub mv: M,
    /// Times selection chose this move.
    pub visits: u64,
    /// `true` if forced moves of later roles were folded into the move's edge.
    pub hyper: bool,
    /// `None` if the child is currently trimmed.
    pub node: Option<NodeInfo>,
}
