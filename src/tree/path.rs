use crate::tree::edge::EdgeRef;
use crate::tree::node::NodeRef;

/// One step of a selection descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathElement {
    pub(crate) parent: NodeRef,
    pub(crate) edge: EdgeRef,
    pub(crate) child: NodeRef,
}

/// The edges traversed from the root to a leaf during one selection descent.
///
/// A path is built on the tree thread, carried through the pipeline with its rollout request and
/// walked in reverse when the result comes back.  Any node or edge on it may have been trimmed
/// in the meantime; the generation checks in the tree's pools detect that, so the references are
/// only ever resolved through [`SearchTree`](crate::SearchTree).
#[derive(Debug, Clone, Default)]
pub struct TreePath {
    root: Option<NodeRef>,
    elements: Vec<PathElement>,
}

impl TreePath {
    pub(crate) fn start(&mut self, root: NodeRef) {
        self.elements.clear();
        self.root = Some(root);
    }

    pub(crate) fn push(&mut self, parent: NodeRef, edge: EdgeRef, child: NodeRef) {
        debug_assert_eq!(Some(parent), self.leaf());
        self.elements.push(PathElement {
            parent,
            edge,
            child,
        });
    }

    /// Forget the descent.
    pub fn clear(&mut self) {
        self.root = None;
        self.elements.clear();
    }

    /// The node the path ends in.
    pub fn leaf(&self) -> Option<NodeRef> {
        self.elements.last().map(|e| e.child).or(self.root)
    }

    /// Number of edges on the path.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// `true` if the path ends at its root.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub(crate) fn contains(&self, node: NodeRef) -> bool {
        self.root == Some(node) || self.elements.iter().any(|e| e.child == node)
    }

    /// Leaf-to-root iteration used by back-propagation.
    pub(crate) fn iter_rev(&self) -> impl Iterator<Item = &PathElement> + '_ {
        self.elements.iter().rev()
    }

    pub(crate) fn copy_from(&mut self, other: &TreePath) {
        self.root = other.root;
        self.elements.clear();
        self.elements.extend_from_slice(&other.elements);
    }
}
