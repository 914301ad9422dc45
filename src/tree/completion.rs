//! Completion inference.
//!
//! A node is *complete* once its score vector is known exactly.  Terminal nodes are complete on
//! creation; the status then spreads upwards through a worklist of nodes awaiting a check, always
//! examining the deepest pending node first.  A node completes when
//!
//! - its choosing role has a complete child that is a decisive win for that role, or
//! - all of its children are complete, in which case it takes the value of the best child for the
//!   choosing role.
//!
//! Intermediate nodes of a simultaneous move need more care, since the choosing role does not get
//! to observe the moves already in the node's prefix.  Both rules above are then checked against
//! every *cousin*: the intermediate nodes at the same level below the same full-state node, one
//! for each combination of moves of the roles choosing earlier.  A win is only decisive if the
//! same move wins in every cousin, and the all-complete rule waits until every nephew is complete
//! and then picks the move with the best blend of worst case and average across cousins.

use tracing::{info, trace};

use crate::error::GameError;
use crate::state_machine::{Heuristic, StateMachine};
use crate::tree::edge::EdgeRef;
use crate::tree::node::NodeRef;
use crate::tree::SearchTree;
use crate::unique_heap::HeapElem;

/// Scores within this distance of 0 or 100 count as a loss or a win.
pub(crate) const SCORE_EPSILON: f64 = 1e-6;

/// Corrections smaller than this stop propagating towards the root.
const NEGLIGIBLE_CORRECTION: f64 = 1e-9;

/// An entry of the completion worklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingCheck {
    pub depth: u32,
    pub node: NodeRef,
}

impl HeapElem for PendingCheck {
    // deepest first
    type Order = u32;
    type UID = NodeRef;
    fn order(&self) -> Self::Order {
        self.depth
    }
    fn unique_id(&self) -> Self::UID {
        self.node
    }
}

/// `true` if `scores` is an outright win for `role` that is not shared by every role.
pub(crate) fn is_decisive_win(scores: &[f64], role: usize) -> bool {
    scores[role] >= 100.0 - SCORE_EPSILON
        && (scores.len() == 1 || scores.iter().any(|s| *s < 100.0 - SCORE_EPSILON))
}

impl<G, H> SearchTree<G, H>
where
    G: StateMachine,
    H: Heuristic<G::State>,
{
    pub(super) fn queue_completion_check(&mut self, node: NodeRef) {
        if let Some(n) = self.nodes.get(node.0) {
            if !n.complete {
                self.completions.push(PendingCheck {
                    depth: n.depth,
                    node,
                });
            }
        }
    }

    /// Queue `parent` after one of its children completed.  The cousins of an intermediate
    /// parent are queued as well, since their floor analysis looks at the same moves.
    pub(super) fn queue_parent_checks(&mut self, parent: NodeRef) {
        let intermediate = match self.nodes.get_mut(parent.0) {
            Some(p) => {
                p.select_cache = None;
                p.is_intermediate()
            }
            None => return,
        };
        self.queue_completion_check(parent);

        if intermediate {
            let (cousins, _) = self.level_members(parent);
            for cousin in cousins {
                self.queue_completion_check(cousin);
            }
        }
    }

    /// Drain the completion worklist.  Returns the number of nodes that completed.
    pub fn process_completions(&mut self) -> usize {
        let before = self.counters.completions;
        while let Some(PendingCheck { node, .. }) = self.completions.pop() {
            let ready = match self.nodes.get(node.0) {
                Some(n) => n.expanded && !n.complete,
                None => false,
            };
            if ready {
                self.check_completion(node);
            }
        }
        (self.counters.completions - before) as usize
    }

    fn check_completion(&mut self, node: NodeRef) {
        let (role, intermediate, children) = match self.nodes.get(node.0) {
            Some(n) => (n.choosing_role, n.is_intermediate(), n.children.clone()),
            None => return,
        };

        // a trimmed child is recreated by selection before it can count as complete
        let n_trimmed = self.refresh_trimmed_edges(node);
        let mut all_complete = n_trimmed == 0 && !children.is_empty();
        let mut best: Option<(f64, NodeRef)> = None;
        let mut losses = Vec::new();
        for &e in &children {
            let (mv, child) = match self.edge_child(e) {
                Some(x) => x,
                None => {
                    all_complete = false;
                    continue;
                }
            };
            if !self.nodes.get(child.0).map_or(false, |c| c.complete) {
                all_complete = false;
                continue;
            }

            let scores = self.scores.averages(child.slot());
            if is_decisive_win(scores, role)
                && (!intermediate || self.decisive_in_all_cousins(node, &mv, role))
            {
                let scores = scores.to_vec();
                trace!(?node, ?mv, "decisive win");
                self.mark_complete(node, scores);
                return;
            }

            let s = scores[role];
            if s <= SCORE_EPSILON {
                losses.push(child);
            }
            if best.map_or(true, |(b, _)| s > b) {
                best = Some((s, child));
            }
        }

        for child in losses {
            self.exclude_loss(&children, child);
        }
        if !all_complete {
            return;
        }
        let chosen = if intermediate {
            self.floor_choice(node, role)
        } else {
            best.map(|(_, c)| c)
        };
        if let Some(child) = chosen {
            let scores = self.scores.averages(child.slot()).to_vec();
            self.mark_complete(node, scores);
        }
    }

    /// The move and live child of an edge.
    fn edge_child(&self, e: EdgeRef) -> Option<(G::Move, NodeRef)> {
        let edge = self.edges.get(e.0)?;
        let child = edge.child.filter(|c| self.nodes.is_live(c.0))?;
        Some((edge.mv.clone()?, child))
    }

    /// The nearest full-state node at or above `node`.  Intermediate nodes have exactly one
    /// parent, so the walk is unique.
    fn full_state_ancestor(&self, node: NodeRef) -> Option<NodeRef> {
        let mut r = node;
        loop {
            let n = self.nodes.get(r.0)?;
            if !n.is_intermediate() {
                return Some(r);
            }
            r = *n.parents.first()?;
        }
    }

    /// The live intermediate nodes at `node`'s level below its full-state ancestor, `node`
    /// included, and whether that set is whole.  The set is partial while some node on the way
    /// down is unexpanded or a child on the way is trimmed.
    fn level_members(&self, node: NodeRef) -> (Vec<NodeRef>, bool) {
        let level = match self.nodes.get(node.0) {
            Some(n) => n.pending.len(),
            None => return (Vec::new(), false),
        };
        let top = match self.full_state_ancestor(node) {
            Some(t) => t,
            None => return (Vec::new(), false),
        };

        let mut layer = vec![top];
        let mut whole = true;
        // the prefix grows by at least one move per layer
        for _ in 0..=level {
            let mut next = Vec::new();
            for &r in &layer {
                let n = match self.nodes.get(r.0) {
                    Some(n) if n.expanded => n,
                    _ => {
                        whole = false;
                        continue;
                    }
                };
                for e in &n.children {
                    let child = self
                        .edges
                        .get(e.0)
                        .and_then(|edge| edge.child)
                        .filter(|c| self.nodes.is_live(c.0));
                    let pending = child.and_then(|c| self.nodes.get(c.0)).map(|c| c.pending.len());
                    match (child, pending) {
                        (Some(c), Some(p)) if p == level => next.push(c),
                        (Some(c), Some(p)) if p > 0 && p < level => next.push(c),
                        _ => whole = false,
                    }
                }
            }
            let at_level = next.iter().all(|c| {
                self.nodes
                    .get(c.0)
                    .map_or(false, |n| n.pending.len() == level)
            });
            layer = next;
            if at_level {
                return (layer, whole);
            }
        }
        (layer, false)
    }

    /// The cousins of an intermediate node, `node` included, or `None` while any of them is
    /// missing.
    fn cousins(&self, node: NodeRef) -> Option<Vec<NodeRef>> {
        match self.level_members(node) {
            (cousins, true) if cousins.contains(&node) => Some(cousins),
            _ => None,
        }
    }

    /// The complete child reached by `mv` in `cousin`, if any.
    fn complete_child_by_move(&self, cousin: NodeRef, mv: &G::Move) -> Option<NodeRef> {
        let n = self.nodes.get(cousin.0)?;
        if !n.expanded {
            return None;
        }
        n.children.iter().find_map(|e| {
            let edge = self.edges.get(e.0)?;
            if edge.mv.as_ref() != Some(mv) {
                return None;
            }
            edge.child
                .filter(|c| self.nodes.get(c.0).map_or(false, |n| n.complete))
        })
    }

    fn decisive_in_all_cousins(&self, node: NodeRef, mv: &G::Move, role: usize) -> bool {
        let cousins = match self.cousins(node) {
            Some(c) => c,
            None => return false,
        };
        cousins.into_iter().all(|cousin| {
            self.complete_child_by_move(cousin, mv)
                .map_or(false, |c| is_decisive_win(self.scores.averages(c.slot()), role))
        })
    }

    /// Floor analysis for an intermediate node whose children are all complete.
    ///
    /// Every move of the choosing role is rated by `(K * floor + mean) / (K + 1)` over the
    /// cousins, where `floor` is the move's worst outcome and `mean` its average outcome across
    /// them.  Returns this node's child along the best rated move, or `None` while any nephew is
    /// still open.
    fn floor_choice(&self, node: NodeRef, role: usize) -> Option<NodeRef> {
        let cousins = self.cousins(node)?;
        let weight = self.config.simultaneous_floor_weight;
        let children = self.nodes.get(node.0)?.children.clone();

        let mut best: Option<(f64, NodeRef)> = None;
        for e in children {
            let (mv, own_child) = self.edge_child(e)?;
            let mut floor = f64::INFINITY;
            let mut sum = 0.0;
            for &cousin in &cousins {
                let c = self.complete_child_by_move(cousin, &mv)?;
                let s = self.scores.average(c.slot(), role);
                floor = floor.min(s);
                sum += s;
            }
            let mean = sum / cousins.len() as f64;
            let rating = (weight * floor + mean) / (weight + 1.0);
            if best.map_or(true, |(b, _)| rating > b) {
                best = Some((rating, own_child));
            }
        }
        best.map(|(_, c)| c)
    }

    /// Settle a full-state `node` from which a rollout found an outright win for the role
    /// choosing there.
    ///
    /// With a single role that win is the node's exact value.  Otherwise the node is expanded
    /// so that the winning terminal child decides it through the decisive-win rule.
    pub(crate) fn settle_proven_win(&mut self, node: NodeRef) -> Result<(), GameError> {
        let (expanded, settled) = match self.nodes.get(node.0) {
            Some(n) => (n.expanded, n.complete || n.is_intermediate()),
            None => return Ok(()),
        };
        if settled {
            return Ok(());
        }
        if self.roles == 1 {
            trace!(?node, "playout reached a win");
            self.mark_complete(node, vec![100.0]);
            return Ok(());
        }
        if expanded || self.expand(node)? {
            self.queue_completion_check(node);
        }
        Ok(())
    }

    /// Fix the exact score of `node`, correct its ancestors for the samples it had already
    /// contributed, and queue its parents for a check.
    pub(super) fn mark_complete(&mut self, node: NodeRef, scores: Vec<f64>) {
        let (slot, updates, parents) = match self.nodes.get(node.0) {
            Some(n) if !n.complete => (node.slot(), n.updates, n.parents.clone()),
            _ => return,
        };

        if updates > 0 {
            let delta = scores
                .iter()
                .zip(self.scores.averages(slot))
                .map(|(new, old)| new - old)
                .collect::<Vec<_>>();
            self.correct_ancestors(node, delta);
        }

        // the spread seen while sampling survives as a tie-break between equal complete moves
        let spread = (0..self.roles)
            .map(|role| {
                let avg = self.scores.average(slot, role);
                (self.scores.average_squared(slot, role) - avg * avg).max(0.0)
            })
            .collect::<Vec<_>>();
        self.scores.set_exact(slot, &scores);
        for (role, v) in spread.into_iter().enumerate() {
            self.scores
                .set_average_squared(slot, role, scores[role] * scores[role] + v);
        }
        if let Some(n) = self.nodes.get_mut(node.0) {
            n.complete = true;
            n.select_cache = None;
        }
        self.counters.completions += 1;

        for parent in parents {
            self.queue_parent_checks(parent);
        }

        if Some(node) == self.root {
            info!(?scores, "root solved");
        }
    }

    /// Make the edge to a losing `child` unselectable unless it is the last selectable edge.
    fn exclude_loss(&mut self, edges: &[EdgeRef], child: NodeRef) {
        let selectable = edges
            .iter()
            .filter(|e| self.edges.get(e.0).map_or(false, |edge| edge.selectable))
            .count();
        if selectable <= 1 {
            return;
        }
        for e in edges {
            if let Some(edge) = self.edges.get_mut(e.0) {
                if edge.child == Some(child) {
                    edge.selectable = false;
                    return;
                }
            }
        }
    }

    /// Walk up the most selected parent chain, shifting each parent's average by the share of
    /// its samples that came through the newly completed child.
    fn correct_ancestors(&mut self, node: NodeRef, mut delta: Vec<f64>) {
        let mut child = node;
        // guards against cycles through transpositions
        let mut remaining_steps = self.nodes.len();

        while remaining_steps > 0 {
            remaining_steps -= 1;

            let parents = match self.nodes.get(child.0) {
                Some(n) => n.parents.clone(),
                None => return,
            };
            let best_parent = parents
                .into_iter()
                .filter_map(|p| Some((p, self.edge_between(p, child)?)))
                .max_by_key(|(_, visits)| *visits);
            let (parent, edge_visits) = match best_parent {
                Some(x) => x,
                None => return,
            };

            let updates = match self.nodes.get(parent.0) {
                Some(p) if !p.complete && p.updates > 0 => p.updates,
                _ => return,
            };
            let share = (edge_visits as f64 / updates as f64).min(1.0);
            let slot = parent.slot();
            let mut largest = 0.0_f64;
            for (role, d) in delta.iter_mut().enumerate() {
                *d *= share;
                let avg = self.scores.average(slot, role);
                self.scores
                    .set_average(slot, role, (avg + *d).max(0.0).min(100.0));
                largest = largest.max(d.abs());
            }
            if largest < NEGLIGIBLE_CORRECTION {
                return;
            }
            child = parent;
        }
    }

    /// Visits of the edge from `parent` to `child`, if they are still linked.
    fn edge_between(&self, parent: NodeRef, child: NodeRef) -> Option<u64> {
        self.nodes.get(parent.0)?.children.iter().find_map(|e| {
            self.edges
                .get(e.0)
                .filter(|edge| edge.child == Some(child))
                .map(|edge| edge.child_visits)
        })
    }
}
