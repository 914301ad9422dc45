use std::fmt;

use crate::pool::{Reset, SlotRef};
use crate::tree::node::NodeRef;

/// A generation-checked reference to a [`TreeEdge`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeRef(pub(crate) SlotRef);

impl fmt::Debug for EdgeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Edge({:?})", self.0)
    }
}

/// One move of a node's choosing role.
pub(crate) struct TreeEdge<M> {
    pub parent: Option<NodeRef>,
    /// The choosing role's move.
    pub mv: Option<M>,
    /// The joint-move prefix after this move, including any forced moves folded in after it.
    /// A complete joint move leads to a full-state child.
    pub joint: Vec<M>,
    /// `None` until created, or after the child was trimmed.
    pub child: Option<NodeRef>,
    pub child_visits: u64,
    /// The child was evicted and is recreated on the next traversal.
    pub trimmed: bool,
    /// Cleared once the child is a proven loss for the choosing role.
    pub selectable: bool,
    /// The edge folds in forced moves of other roles.
    pub hyper: bool,
    /// The child's heuristic seed disagreed sharply with the parent's average.
    pub heuristic_deviation: bool,
}

impl<M> Default for TreeEdge<M> {
    fn default() -> Self {
        Self {
            parent: None,
            mv: None,
            joint: Vec::new(),
            child: None,
            child_visits: 0,
            trimmed: false,
            selectable: true,
            hyper: false,
            heuristic_deviation: false,
        }
    }
}

impl<M> Reset for TreeEdge<M> {
    fn reset(&mut self) {
        self.parent = None;
        self.mv = None;
        self.joint.clear();
        self.child = None;
        self.child_visits = 0;
        self.trimmed = false;
        self.selectable = true;
        self.hyper = false;
        self.heuristic_deviation = false;
    }
}

impl<M: fmt::Debug> fmt::Debug for TreeEdge<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeEdge")
            .field("mv", &self.mv)
            .field("child", &self.child)
            .field("child_visits", &self.child_visits)
            .field("trimmed", &self.trimmed)
            .field("selectable", &self.selectable)
            .finish()
    }
}
