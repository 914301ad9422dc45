//! UCT child selection.
//!
//! Scores are computed on a 0..1 scale:
//!
//! `exploitation + bias * sqrt(2 * min(0.5, V) * ln(max(Np, Ne) + 1) / Ne)`
//!
//! where `V` is the UCB1-tuned variance bound of the child for the choosing role, `Np` the
//! parent's visits and `Ne` the number of times the edge was selected.  Each node caches its
//! best and runner-up children; the full scan is repeated only once the best child's live score
//! drops below the score the runner-up had when the cache was filled.

use rand::Rng;

use crate::state_machine::{Heuristic, StateMachine};
use crate::tree::edge::{EdgeRef, TreeEdge};
use crate::tree::node::{NodeRef, SelectCache};
use crate::tree::SearchTree;

/// Unvisited edges are tried before any visited one.
const UNVISITED_SCORE: f64 = 1.0e6;

/// Exploration multiplier for edges whose heuristic seed disagreed with the parent.
const DEVIATION_EXPLORATION: f64 = 2.0;

impl<G, H> SearchTree<G, H>
where
    G: StateMachine,
    H: Heuristic<G::State>,
{
    /// Raw UCT score of `edge` for `role` at a parent with `parent_visits` visits, without the
    /// tie-breaking noise.  A trimmed edge is scored from the parent's own average.
    pub(super) fn edge_score(
        &self,
        parent: NodeRef,
        parent_visits: u64,
        role: usize,
        edge: &TreeEdge<G::Move>,
    ) -> f64 {
        let ne = edge.child_visits;
        if ne == 0 {
            return UNVISITED_SCORE;
        }

        let live_child = edge
            .child
            .and_then(|c| self.nodes.get(c.0).map(|n| (c, n.complete)));
        let (slot, complete) = match live_child {
            Some((c, complete)) => (c.slot(), complete),
            None => (parent.slot(), false),
        };
        let avg = self.scores.average(slot, role) / 100.0;
        let sq = self.scores.average_squared(slot, role) / 10_000.0;

        let ne = ne as f64;
        let log_term = ((parent_visits as f64).max(ne) + 1.0).ln();
        // completion propagation can push the second moment below the squared mean
        let variance_bound = (sq - avg * avg + (2.0 * log_term / ne).sqrt()).max(0.0);
        let mut exploration =
            self.config.exploration_bias * (2.0 * variance_bound.min(0.5) * log_term / ne).sqrt();
        if complete {
            exploration *= 0.5;
        } else if edge.heuristic_deviation {
            exploration *= DEVIATION_EXPLORATION;
        }
        avg + exploration
    }

    /// Mark edges whose child reference went stale as trimmed.  Returns the number of trimmed
    /// edges.
    pub(super) fn refresh_trimmed_edges(&mut self, node: NodeRef) -> usize {
        let children = match self.nodes.get(node.0) {
            Some(n) => n.children.clone(),
            None => return 0,
        };
        let mut n_trimmed = 0;
        let mut changed = false;
        for e in children {
            let (child, trimmed) = match self.edges.get(e.0) {
                Some(edge) => (edge.child, edge.trimmed),
                None => continue,
            };
            match child {
                Some(c) if self.nodes.is_live(c.0) => {}
                Some(_) => {
                    if let Some(edge) = self.edges.get_mut(e.0) {
                        edge.child = None;
                        edge.trimmed = true;
                    }
                    changed = true;
                    n_trimmed += 1;
                }
                None if trimmed => n_trimmed += 1,
                None => {}
            }
        }
        if changed {
            if let Some(n) = self.nodes.get_mut(node.0) {
                n.select_cache = None;
            }
        }
        n_trimmed
    }

    /// Choose the index of the child edge to descend into from an expanded `node`.
    pub(super) fn choose_edge(&mut self, node: NodeRef) -> usize {
        self.refresh_trimmed_edges(node);

        let (n_children, visits, role, cache) = match self.nodes.get(node.0) {
            Some(n) => (n.children.len(), n.visits, n.choosing_role, n.select_cache),
            None => return 0,
        };
        debug_assert!(n_children > 0, "selecting from a node without children");
        if n_children <= 1 {
            return 0;
        }

        let noise_bound = self.config.tie_break_noise;

        if let Some(cache) = cache {
            if let Some(score) = self.live_score(node, visits, role, cache.best) {
                let score = score + self.rng.gen::<f64>() * noise_bound;
                if score >= cache.runner_up_score {
                    if let Some(n) = self.nodes.get_mut(node.0) {
                        if let Some(c) = n.select_cache.as_mut() {
                            c.best_score = score;
                        }
                    }
                    return cache.best;
                }
            }
        }

        let mut best: Option<(usize, f64)> = None;
        let mut runner_up: Option<(usize, f64)> = None;
        for i in 0..n_children {
            let score = match self.live_score(node, visits, role, i) {
                Some(s) => s + self.rng.gen::<f64>() * noise_bound,
                None => continue,
            };
            match best {
                Some((_, b)) if score <= b => match runner_up {
                    Some((_, r)) if score <= r => {}
                    _ => runner_up = Some((i, score)),
                },
                _ => {
                    runner_up = best;
                    best = Some((i, score));
                }
            }
        }

        let (best_idx, best_score) = match best {
            Some(b) => b,
            // every edge is marked unselectable, which only happens transiently
            None => return 0,
        };
        let (runner_idx, runner_score) = runner_up.unwrap_or((best_idx, f64::NEG_INFINITY));
        if let Some(n) = self.nodes.get_mut(node.0) {
            n.select_cache = Some(SelectCache {
                best: best_idx,
                best_score,
                runner_up: runner_idx,
                runner_up_score: runner_score,
            });
        }
        best_idx
    }

    /// Score of the `i`th child edge of `node`, or `None` if it may not be selected.
    fn live_score(&self, node: NodeRef, visits: u64, role: usize, i: usize) -> Option<f64> {
        let e = *self.nodes.get(node.0)?.children.get(i)?;
        let edge = self.edges.get(e.0)?;
        if !edge.selectable {
            return None;
        }
        Some(self.edge_score(node, visits, role, edge))
    }

    /// The live child of `node` that selection is least likely to choose, with the edge leading
    /// to it.
    ///
    /// Unselectable edges are skipped: selection never revisits them, so a child trimmed there
    /// would never be recreated and its parent could no longer complete.
    pub(super) fn least_likely_child(&self, node: NodeRef) -> Option<(EdgeRef, NodeRef)> {
        let n = self.nodes.get(node.0)?;
        let mut worst: Option<(f64, EdgeRef, NodeRef)> = None;
        for &e in &n.children {
            let edge = match self.edges.get(e.0) {
                Some(edge) if edge.selectable => edge,
                _ => continue,
            };
            let child = match edge.child {
                Some(c) if self.nodes.is_live(c.0) => c,
                _ => continue,
            };
            let score = self.edge_score(node, n.visits, n.choosing_role, edge);
            match worst {
                Some((w, _, _)) if score >= w => {}
                _ => worst = Some((score, e, child)),
            }
        }
        worst.map(|(_, e, c)| (e, c))
    }
}
