use std::cmp::{Eq, Ord, Ordering, PartialEq, PartialOrd};
use std::collections::BinaryHeap;
use std::hash::Hash;
use std::ops::Deref;

use fnv::FnvHashSet;

struct OrdWrap<T>(T);

pub trait HeapElem {
    /// `Order` and `UID` may not be modified while stored in the `UniqueHeap` (required by
    /// `BinaryHeap` and `HashSet`, respectively)
    type Order: PartialOrd + Ord + PartialEq + Eq;
    type UID: Hash + Eq;
    fn order(&self) -> Self::Order;
    fn unique_id(&self) -> Self::UID;
}

impl<T> Deref for OrdWrap<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: HeapElem> Ord for OrdWrap<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order().cmp(&other.order())
    }
}

impl<T: HeapElem> PartialOrd for OrdWrap<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: HeapElem> PartialEq for OrdWrap<T> {
    fn eq(&self, other: &Self) -> bool {
        self.order().eq(&other.order())
    }
}

impl<T: HeapElem> Eq for OrdWrap<T> {}

/// A max-heap that holds each element at most once.
///
/// Used as the worklist of nodes awaiting a completion check: a node reached by several
/// completing children is only checked once, and the deepest pending node is always checked
/// first so a node is never examined before its descendants have settled.
pub(crate) struct UniqueHeap<N, H> {
    heap: BinaryHeap<OrdWrap<N>>,
    registry: FnvHashSet<H>,
}

impl<N, H> UniqueHeap<N, H>
where
    N: HeapElem<UID = H>,
    H: Hash + Eq,
{
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            registry: FnvHashSet::default(),
        }
    }

    /// Returns `false` (and drops `n`) if an element with the same id is already queued.
    pub fn push(&mut self, n: N) -> bool {
        if self.registry.insert(n.unique_id()) {
            let wrap = OrdWrap(n);
            self.heap.push(wrap);
            true
        } else {
            false
        }
    }

    pub fn pop(&mut self) -> Option<N> {
        let n = self.heap.pop()?.0;
        let r = self.registry.remove(&n.unique_id());
        debug_assert!(r);
        Some(n)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.registry.clear();
    }
}

impl<N, H> std::fmt::Debug for UniqueHeap<N, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniqueHeap")
            .field("len", &self.heap.len())
            .finish()
    }
}
