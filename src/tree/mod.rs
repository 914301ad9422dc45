//! The search graph.
//!
//! [`SearchTree`] is owned and mutated by exactly one thread.  Nodes and edges live in
//! [`SlotPool`]s and refer to each other through generation-checked references, so a reference
//! held by an in-flight rollout request simply stops resolving once its target is trimmed.

mod completion;
mod edge;
mod node;
mod path;
mod select;

pub use edge::EdgeRef;
pub use node::{MoveInfo, NodeInfo, NodeRef};
pub use path::TreePath;

use std::fmt;

use fnv::{FnvHashMap, FnvHashSet};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, trace};

use crate::config::SearchConfig;
use crate::error::GameError;
use crate::pool::{PoolStats, SlotPool};
use crate::score_vector::ScoreVectorStore;
use crate::state_machine::{Heuristic, HeuristicContext, HeuristicEstimate, StateMachine};
use crate::unique_heap::UniqueHeap;

use completion::{is_decisive_win, PendingCheck};
use edge::TreeEdge;
use node::TreeNode;

/// A heuristic estimate that differs from the parent's average by more than this is flagged on
/// the incoming edge.
const HEURISTIC_DEVIATION: f64 = 20.0;

/// What the tree thread should do with the leaf of a selection descent.
#[derive(Debug)]
pub(crate) enum Leaf<S, M> {
    /// Roll out from `state` after completing the joint move `pending`.
    Rollout {
        node: NodeRef,
        state: S,
        pending: Vec<M>,
    },
    /// The leaf's value was already known and has been back-propagated.
    Resolved,
}

/// How [`SearchTree::set_root`] bound the new root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootBinding {
    /// The state was found in the transposition index; the subgraph below it was kept.
    Reused {
        /// Nodes kept.
        nodes: usize,
    },
    /// The tree was cleared and a fresh root created.
    Fresh,
}

/// Running counters of the tree thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeCounters {
    /// Back-propagation steps skipped because part of the path was trimmed.
    pub stale_updates: u64,
    /// Subtrees unlinked to make room.
    pub trims: u64,
    /// Nodes whose score became exact, terminal nodes included.
    pub completions: u64,
    /// Longest selection path seen.
    pub max_depth: usize,
}

/// Where a new child edge leads, worked out before anything is allocated.
enum ChildPlan<S> {
    Existing(NodeRef),
    Intermediate,
    Terminal {
        state: S,
        scores: Vec<f64>,
    },
    Open {
        state: S,
        seed: Option<HeuristicEstimate>,
    },
}

/// The search graph together with its transposition index and completion worklist.
pub struct SearchTree<G: StateMachine, H> {
    sm: G,
    heuristic: H,
    config: SearchConfig,
    roles: usize,
    nodes: SlotPool<TreeNode<G::State, G::Move>>,
    edges: SlotPool<TreeEdge<G::Move>>,
    scores: ScoreVectorStore,
    // only full-state nodes are indexed
    index: FnvHashMap<G::State, NodeRef>,
    root: Option<NodeRef>,
    completions: UniqueHeap<PendingCheck, NodeRef>,
    rng: StdRng,
    counters: TreeCounters,
}

impl<G: StateMachine, H> fmt::Debug for SearchTree<G, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchTree")
            .field("roles", &self.roles)
            .field("root", &self.root)
            .field("nodes", &self.nodes)
            .field("edges", &self.edges)
            .field("indexed", &self.index.len())
            .field("counters", &self.counters)
            .finish()
    }
}

impl<G, H> SearchTree<G, H>
where
    G: StateMachine,
    H: Heuristic<G::State>,
{
    /// Construct an empty tree; call [`SearchTree::set_root`] before searching.
    pub fn new(sm: G, heuristic: H, config: SearchConfig) -> Self {
        let roles = sm.role_count();
        let sizes = config.pool_sizes;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            sm,
            heuristic,
            roles,
            nodes: SlotPool::new(sizes.nodes, sizes.low_water_mark),
            edges: SlotPool::new(sizes.edges, sizes.low_water_mark),
            scores: ScoreVectorStore::new(roles, sizes.nodes),
            index: FnvHashMap::default(),
            root: None,
            completions: UniqueHeap::new(),
            rng,
            counters: TreeCounters::default(),
            config,
        }
    }

    /// Number of roles in the game.
    pub fn role_count(&self) -> usize {
        self.roles
    }

    /// The current root, once [`SearchTree::set_root`] was called.
    pub fn root(&self) -> Option<NodeRef> {
        self.root
    }

    /// `true` once the root's value is exact.
    pub fn is_solved(&self) -> bool {
        self.root
            .and_then(|r| self.nodes.get(r.0))
            .map_or(false, |n| n.complete)
    }

    /// Running counters of the tree thread.
    pub fn counters(&self) -> TreeCounters {
        self.counters
    }

    /// Occupancy of the node pool.
    pub fn node_pool_stats(&self) -> PoolStats {
        self.nodes.stats()
    }

    /// Occupancy of the edge pool.
    pub fn edge_pool_stats(&self) -> PoolStats {
        self.edges.stats()
    }

    /// The node representing a full game state, if the state is in the transposition index.
    pub fn lookup_transposition(&self, state: &G::State) -> Option<NodeRef> {
        self.index
            .get(state)
            .copied()
            .filter(|r| self.nodes.is_live(r.0))
    }

    /// Bind the root to `state`, keeping the part of the graph reachable from it if the state is
    /// already known.
    pub fn set_root(&mut self, state: G::State) -> Result<RootBinding, GameError> {
        self.completions.clear();

        if let Some(r) = self.lookup_transposition(&state) {
            let kept = self.retain_reachable(r);
            self.root = Some(r);
            debug!(nodes = kept, "reusing subtree for new root");
            return Ok(RootBinding::Reused { nodes: kept });
        }

        self.clear();
        let terminal = self.sm.is_terminal(&state)?;
        let scores = if terminal {
            Some(self.terminal_scores(&state)?)
        } else {
            None
        };

        let r = NodeRef(self.nodes.allocate(|n| {
            n.state = Some(state.clone());
            n.terminal = terminal;
            n.complete = terminal;
        }));
        match &scores {
            Some(s) => self.scores.set_exact(r.slot(), s),
            None => self.scores.reset(r.slot()),
        }
        self.index.insert(state, r);
        self.root = Some(r);
        Ok(RootBinding::Fresh)
    }

    /// Free every node and edge.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
        self.index.clear();
        self.completions.clear();
        self.root = None;
    }

    /// Drop everything not reachable from `new_root` and recompute depths.  Returns the number
    /// of nodes kept.
    fn retain_reachable(&mut self, new_root: NodeRef) -> usize {
        let mut depths = FnvHashMap::default();
        let mut frontier = vec![new_root];
        depths.insert(new_root, 0u32);
        let mut depth = 0;
        while !frontier.is_empty() {
            depth += 1;
            let mut next = Vec::new();
            for n in frontier {
                let children = match self.nodes.get(n.0) {
                    Some(node) => node.children.clone(),
                    None => continue,
                };
                for e in children {
                    if let Some(c) = self.edges.get(e.0).and_then(|edge| edge.child) {
                        if self.nodes.is_live(c.0) && !depths.contains_key(&c) {
                            depths.insert(c, depth);
                            next.push(c);
                        }
                    }
                }
            }
            frontier = next;
        }

        let reachable = depths.keys().copied().collect::<FnvHashSet<_>>();
        self.nodes
            .clear_where(|r, _| !reachable.contains(&NodeRef(r)));
        self.edges.clear_where(|_, e| {
            e.parent.map_or(true, |p| !reachable.contains(&p))
        });
        self.index.retain(|_, r| reachable.contains(r));

        for (&r, &d) in &depths {
            if let Some(n) = self.nodes.get_mut(r.0) {
                n.depth = d;
                n.parents.retain(|p| reachable.contains(p));
                if r == new_root {
                    n.parents.clear();
                }
            }
        }
        reachable.len()
    }

    /// Goal values of a terminal state with the configured win and draw bonuses applied.
    fn terminal_scores(&mut self, state: &G::State) -> Result<Vec<f64>, GameError> {
        let mut scores = (0..self.roles)
            .map(|role| {
                self.sm
                    .goal_value(state, role)
                    .map(|g| f64::from(g.min(100)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if self.roles > 1 {
            let bonus = self.config.terminal_bonus;
            let top = scores.iter().copied().fold(f64::MIN, f64::max);
            let n_top = scores.iter().filter(|s| **s >= top).count();
            if n_top == 1 {
                scores
                    .iter_mut()
                    .filter(|s| **s < top)
                    .for_each(|s| *s -= bonus.win);
            } else if n_top == self.roles {
                scores.iter_mut().for_each(|s| *s += bonus.draw);
            }
        }
        scores.iter_mut().for_each(|s| *s = s.max(0.0).min(100.0));
        Ok(scores)
    }

    /// Materialize one edge per move of the choosing role at `node`, creating every child.
    ///
    /// Roles with a single legal move are folded into the joint move instead of getting a level
    /// of their own.  Returns `false` if the pools lack room for the children, in which case the
    /// node stays unexpanded.
    fn expand(&mut self, node: NodeRef) -> Result<bool, GameError> {
        let (state, pending) = match self.nodes.get(node.0) {
            Some(n) if !n.expanded && !n.complete => match &n.state {
                Some(s) => (s.clone(), n.pending.clone()),
                None => return Ok(false),
            },
            _ => return Ok(false),
        };

        let mut prefix = pending.clone();
        let mut choosing = prefix.len();
        let mut choices = Vec::new();
        while choosing < self.roles {
            let mut moves = self.sm.legal_moves(&state, choosing)?;
            match moves.len() {
                0 => return Err(GameError::NoLegalMoves { role: choosing }),
                1 => {
                    prefix.extend(moves.pop());
                    choosing += 1;
                }
                _ => {
                    choices = moves;
                    break;
                }
            }
        }

        let mut joints = Vec::new();
        if choices.is_empty() {
            // every remaining role is forced
            choosing = pending.len();
            joints.push(prefix.clone());
        } else {
            let mut suffix = Vec::new();
            for role in choosing + 1..self.roles {
                let mut moves = self.sm.legal_moves(&state, role)?;
                match moves.len() {
                    0 => return Err(GameError::NoLegalMoves { role }),
                    1 => suffix.extend(moves.pop()),
                    _ => break,
                }
            }
            for m in choices {
                let mut joint = prefix.clone();
                joint.push(m);
                joint.extend(suffix.iter().cloned());
                joints.push(joint);
            }
        }

        let n_children = joints.len();
        if self.nodes.capacity() - self.nodes.len() < n_children
            || self.edges.capacity() - self.edges.len() < n_children
        {
            trace!(?node, n_children, "no room to expand");
            return Ok(false);
        }

        let mut plans = Vec::with_capacity(n_children);
        for joint in &joints {
            plans.push(self.plan_child(node, &state, joint, choosing)?);
        }

        let mut children = Vec::with_capacity(n_children);
        for (joint, plan) in joints.into_iter().zip(plans) {
            let hyper = joint.len() > pending.len() + 1;
            let mv = joint[choosing].clone();
            let e = EdgeRef(self.edges.allocate(|edge| {
                edge.parent = Some(node);
                edge.mv = Some(mv);
                edge.joint.extend(joint.iter().cloned());
                edge.hyper = hyper;
            }));
            self.attach_child(node, e, &state, plan);
            children.push(e);
        }

        if let Some(n) = self.nodes.get_mut(node.0) {
            n.expanded = true;
            n.choosing_role = choosing;
            n.children = children;
            n.select_cache = None;
        }
        Ok(true)
    }

    /// Work out what a new edge with joint move `joint` leads to, querying the state machine
    /// and the heuristic as needed.
    fn plan_child(
        &mut self,
        parent: NodeRef,
        state: &G::State,
        joint: &[G::Move],
        deciding_role: usize,
    ) -> Result<ChildPlan<G::State>, GameError> {
        if joint.len() < self.roles {
            return Ok(ChildPlan::Intermediate);
        }

        let next = self.sm.next_state(state, joint)?;
        if let Some(existing) = self.lookup_transposition(&next) {
            return Ok(ChildPlan::Existing(existing));
        }
        if self.sm.is_terminal(&next)? {
            let scores = self.terminal_scores(&next)?;
            return Ok(ChildPlan::Terminal {
                state: next,
                scores,
            });
        }

        let depth = self.nodes.get(parent.0).map_or(0, |p| p.depth) + 1;
        let parent_scores = self.scores.averages(parent.slot()).to_vec();
        let seed = self
            .heuristic
            .static_value(
                &next,
                HeuristicContext {
                    depth,
                    deciding_role,
                    parent_scores: &parent_scores,
                },
            )?
            .filter(|est| est.weight > 0 && est.scores.len() == self.roles);
        Ok(ChildPlan::Open { state: next, seed })
    }

    /// Link the child described by `plan` below `edge`.
    fn attach_child(
        &mut self,
        parent: NodeRef,
        edge: EdgeRef,
        parent_state: &G::State,
        plan: ChildPlan<G::State>,
    ) -> NodeRef {
        let (parent_depth, deciding_role, parent_updates) = match self.nodes.get(parent.0) {
            Some(p) => (p.depth, p.choosing_role, p.updates),
            None => (0, 0, 0),
        };
        let pending = self
            .edges
            .get(edge.0)
            .map(|e| e.joint.clone())
            .unwrap_or_default();

        // a sibling created earlier in the same expansion may have reached the state already
        let existing = match &plan {
            ChildPlan::Terminal { state, .. } | ChildPlan::Open { state, .. } => {
                self.lookup_transposition(state)
            }
            _ => None,
        };
        let plan = match existing {
            Some(c) => ChildPlan::Existing(c),
            None => plan,
        };

        let child = match plan {
            ChildPlan::Existing(c) => {
                if let Some(n) = self.nodes.get_mut(c.0) {
                    n.add_parent(parent);
                    n.depth = n.depth.min(parent_depth + 1);
                }
                c
            }
            ChildPlan::Intermediate => {
                let c = NodeRef(self.nodes.allocate(|n| {
                    n.state = Some(parent_state.clone());
                    n.pending = pending;
                    n.deciding_role = deciding_role;
                    n.depth = parent_depth + 1;
                    n.parents.push(parent);
                }));
                self.scores.reset(c.slot());
                c
            }
            ChildPlan::Terminal { state, scores } => {
                let c = NodeRef(self.nodes.allocate(|n| {
                    n.state = Some(state.clone());
                    n.deciding_role = deciding_role;
                    n.depth = parent_depth + 1;
                    n.terminal = true;
                    n.complete = true;
                    n.parents.push(parent);
                }));
                self.scores.set_exact(c.slot(), &scores);
                self.index.insert(state, c);
                self.counters.completions += 1;
                c
            }
            ChildPlan::Open { state, seed } => {
                let seeded = seed.is_some();
                let c = NodeRef(self.nodes.allocate(|n| {
                    n.state = Some(state.clone());
                    n.deciding_role = deciding_role;
                    n.depth = parent_depth + 1;
                    n.heuristic_seeded = seeded;
                    n.parents.push(parent);
                }));
                match seed {
                    Some(est) => {
                        let squares = est.scores.iter().map(|s| s * s).collect::<Vec<_>>();
                        self.scores.set(c.slot(), &est.scores, &squares);
                        if let Some(n) = self.nodes.get_mut(c.0) {
                            n.updates = u64::from(est.weight);
                        }
                        let parent_avg = self.scores.average(parent.slot(), deciding_role);
                        if parent_updates > 0
                            && (est.scores[deciding_role] - parent_avg).abs() > HEURISTIC_DEVIATION
                        {
                            if let Some(e) = self.edges.get_mut(edge.0) {
                                e.heuristic_deviation = true;
                            }
                        }
                    }
                    None => self.scores.reset(c.slot()),
                }
                self.index.insert(state, c);
                c
            }
        };

        if let Some(e) = self.edges.get_mut(edge.0) {
            e.child = Some(child);
            e.trimmed = false;
        }
        if self.nodes.get(child.0).map_or(false, |n| n.complete) {
            self.queue_parent_checks(parent);
        }
        child
    }

    /// Resolve the child of the `i`th edge of `node`, recreating it if it was trimmed.  Returns
    /// `None` if a trimmed child cannot be recreated for lack of room.
    fn child_at(
        &mut self,
        node: NodeRef,
        i: usize,
    ) -> Result<Option<(EdgeRef, NodeRef)>, GameError> {
        let e = match self.nodes.get(node.0).and_then(|n| n.children.get(i)) {
            Some(e) => *e,
            None => return Ok(None),
        };
        let (child, joint, trimmed) = match self.edges.get(e.0) {
            Some(edge) => (edge.child, edge.joint.clone(), edge.trimmed),
            None => return Ok(None),
        };
        if let Some(c) = child.filter(|c| self.nodes.is_live(c.0)) {
            return Ok(Some((e, c)));
        }

        if self.nodes.len() >= self.nodes.capacity() {
            return Ok(None);
        }
        let (state, deciding_role) = match self.nodes.get(node.0) {
            Some(n) => match &n.state {
                Some(s) => (s.clone(), n.choosing_role),
                None => return Ok(None),
            },
            None => return Ok(None),
        };
        let plan = self.plan_child(node, &state, &joint, deciding_role)?;
        if trimmed {
            if let Some(edge) = self.edges.get_mut(e.0) {
                // the old child's visits left with it
                edge.child_visits = 0;
            }
        }
        let c = self.attach_child(node, e, &state, plan);
        trace!(?node, ?c, trimmed, "created missing child");
        Ok(Some((e, c)))
    }

    /// Descend from the root by UCT, expanding the frontier node, and record the descent in
    /// `path`.  A leaf whose value is already exact is back-propagated before returning.
    pub(crate) fn select_leaf(
        &mut self,
        path: &mut TreePath,
    ) -> Result<Leaf<G::State, G::Move>, GameError> {
        let root = match self.root {
            Some(r) if self.nodes.is_live(r.0) => r,
            _ => return Ok(Leaf::Resolved),
        };
        path.start(root);

        let mut node = root;
        loop {
            let (complete, expanded) = match self.nodes.get(node.0) {
                Some(n) => (n.complete, n.expanded),
                None => break,
            };
            if complete {
                break;
            }

            let just_expanded = !expanded;
            if just_expanded && !self.expand(node)? {
                break;
            }

            let i = self.choose_edge(node);
            let (edge, child) = match self.child_at(node, i)? {
                Some(x) => x,
                None => break,
            };
            if path.contains(child) {
                // a cycle through a transposition; roll out from here
                break;
            }
            path.push(node, edge, child);
            node = child;

            if just_expanded {
                break;
            }
        }

        self.mark_visits(path);
        self.counters.max_depth = self.counters.max_depth.max(path.len());

        let leaf = path.leaf().and_then(|r| self.nodes.get(r.0).map(|n| (r, n)));
        match leaf {
            Some((r, n)) if !n.complete => match &n.state {
                Some(state) => Ok(Leaf::Rollout {
                    node: r,
                    state: state.clone(),
                    pending: n.pending.clone(),
                }),
                None => Ok(Leaf::Resolved),
            },
            Some((r, _)) => {
                let exact = self.scores.averages(r.slot()).to_vec();
                let squares = exact.iter().map(|s| s * s).collect::<Vec<_>>();
                self.back_propagate(path, &exact, &squares);
                Ok(Leaf::Resolved)
            }
            None => Ok(Leaf::Resolved),
        }
    }

    fn mark_visits(&mut self, path: &TreePath) {
        if let Some(leaf) = path.leaf() {
            if let Some(n) = self.nodes.get_mut(leaf.0) {
                n.visits += 1;
            }
        }
        for el in path.iter_rev() {
            if let Some(n) = self.nodes.get_mut(el.parent.0) {
                n.visits += 1;
            }
            if let Some(e) = self.edges.get_mut(el.edge.0) {
                e.child_visits += 1;
            }
        }
    }

    /// Fold a rollout result into every node on `path`, leaf first.
    ///
    /// Elements whose references went stale are skipped.  Above a complete node the node's exact
    /// score is propagated in place of the rollout result, and complete nodes themselves are
    /// never modified.
    pub fn back_propagate(&mut self, path: &TreePath, averages: &[f64], squares: &[f64]) {
        debug_assert_eq!(averages.len(), self.roles);
        let mut values = averages.to_vec();
        let mut squared = squares.to_vec();

        match path.leaf() {
            Some(leaf) if self.nodes.is_live(leaf.0) => {
                self.absorb(leaf, &mut values, &mut squared)
            }
            _ => self.counters.stale_updates += 1,
        }

        for el in path.iter_rev() {
            let linked = self.nodes.is_live(el.parent.0)
                && self
                    .edges
                    .get(el.edge.0)
                    .map_or(false, |e| e.child == Some(el.child));
            if !linked {
                self.counters.stale_updates += 1;
                continue;
            }
            self.absorb(el.parent, &mut values, &mut squared);
        }
    }

    fn absorb(&mut self, node: NodeRef, values: &mut Vec<f64>, squared: &mut Vec<f64>) {
        let (complete, updates) = match self.nodes.get(node.0) {
            Some(n) => (n.complete, n.updates),
            None => return,
        };
        if complete {
            values.copy_from_slice(self.scores.averages(node.slot()));
            for (sq, v) in squared.iter_mut().zip(values.iter()) {
                *sq = v * v;
            }
            return;
        }
        self.scores
            .accumulate(node.slot(), values, squared, updates as f64, 1.0);
        if let Some(n) = self.nodes.get_mut(node.0) {
            n.updates += 1;
        }
    }

    /// Trim least likely subtrees while either pool is near full.  Returns the number of trims.
    pub fn trim_if_needed(&mut self) -> usize {
        let mut trims = 0;
        while trims < self.config.max_trims_per_iteration
            && (self.nodes.is_near_full() || self.edges.is_near_full())
        {
            if !self.trim_least_likely() {
                break;
            }
            trims += 1;
        }
        if trims > 0 {
            self.counters.trims += trims as u64;
            debug!(
                trims,
                nodes = self.nodes.len(),
                edges = self.edges.len(),
                "trimmed search tree"
            );
        }
        trims
    }

    /// Descend through the least likely children until reaching one whose own children are all
    /// unexpanded, and unlink it from its parent.  Returns `false` if nothing could be trimmed.
    pub fn trim_least_likely(&mut self) -> bool {
        let mut node = match self.root {
            Some(r) => r,
            None => return false,
        };
        let mut remaining_steps = self.nodes.len();
        while remaining_steps > 0 {
            remaining_steps -= 1;
            let (edge, child) = match self.least_likely_child(node) {
                Some(x) => x,
                None => return false,
            };
            if !self.has_expanded_children(child) {
                self.unlink(node, edge, child);
                return true;
            }
            node = child;
        }
        false
    }

    fn has_expanded_children(&self, node: NodeRef) -> bool {
        let n = match self.nodes.get(node.0) {
            Some(n) => n,
            None => return false,
        };
        n.children.iter().any(|e| {
            self.edges
                .get(e.0)
                .and_then(|edge| edge.child)
                .and_then(|c| self.nodes.get(c.0))
                .map_or(false, |c| c.expanded)
        })
    }

    fn unlink(&mut self, parent: NodeRef, edge: EdgeRef, child: NodeRef) {
        if let Some(e) = self.edges.get_mut(edge.0) {
            e.child = None;
            e.trimmed = true;
        }
        if let Some(p) = self.nodes.get_mut(parent.0) {
            p.select_cache = None;
        }
        let orphaned = match self.nodes.get_mut(child.0) {
            Some(c) => {
                c.remove_parent(parent);
                c.parents.is_empty()
            }
            None => false,
        };
        if orphaned && Some(child) != self.root {
            self.free_orphans(child);
        }
    }

    /// Free `start` and every node that loses its last parent as a result.
    fn free_orphans(&mut self, start: NodeRef) {
        let mut stack = vec![start];
        while let Some(r) = stack.pop() {
            let (state, children) = match self.nodes.get_mut(r.0) {
                Some(n) => {
                    let state = if n.pending.is_empty() { n.state.take() } else { None };
                    (state, n.children.drain(..).collect::<Vec<_>>())
                }
                None => continue,
            };
            if let Some(state) = state {
                if self.index.get(&state) == Some(&r) {
                    self.index.remove(&state);
                }
            }
            for e in children {
                let child = self.edges.get(e.0).and_then(|edge| edge.child);
                if let Some(c) = child {
                    if let Some(cn) = self.nodes.get_mut(c.0) {
                        cn.remove_parent(r);
                        if cn.parents.is_empty() && Some(c) != self.root {
                            stack.push(c);
                        }
                    }
                }
                self.edges.free(e.0);
            }
            self.nodes.free(r.0);
            self.scores.reset(r.slot());
        }
    }

    /// The move `role` should play at the root, or `None` if the root is terminal or `role`
    /// has no legal move.
    ///
    /// A complete decisive win is preferred.  Otherwise each searched move is rated by its
    /// average, lowered to the worst complete reply of the opponent one ply further down.  Ties
    /// between complete moves go to the less variable one, other ties to the more visited and
    /// then the less variable move.  If nothing was searched
    /// yet an arbitrary legal move is returned.
    pub fn best_move(&mut self, role: usize) -> Result<Option<G::Move>, GameError> {
        let root = match self.root.filter(|r| self.nodes.is_live(r.0)) {
            Some(r) => r,
            None => return Ok(None),
        };
        let state = match self.nodes.get(root.0) {
            Some(n) if n.terminal => return Ok(None),
            Some(n) => match &n.state {
                Some(s) => s.clone(),
                None => return Ok(None),
            },
            None => return Ok(None),
        };

        let mut legal = self.sm.legal_moves(&state, role)?;
        if legal.len() <= 1 {
            return Ok(legal.pop());
        }

        let fallback = legal.swap_remove(0);
        let level = match self.level_of(root, role) {
            Some(n) => n,
            None => return Ok(Some(fallback)),
        };
        Ok(Some(self.best_edge_move(level, role).unwrap_or(fallback)))
    }

    /// The node at which `role` chooses, following the most visited move of any role choosing
    /// before it in the same simultaneous move.
    fn level_of(&self, root: NodeRef, role: usize) -> Option<NodeRef> {
        let mut node = root;
        loop {
            let n = self.nodes.get(node.0)?;
            if !n.expanded {
                return None;
            }
            if n.choosing_role == role {
                return Some(node);
            }
            if n.choosing_role > role {
                // the role's move was forced and folded in above this level
                return None;
            }
            node = n
                .children
                .iter()
                .filter_map(|e| self.edges.get(e.0))
                .filter_map(|e| e.child.map(|c| (e.child_visits, c)))
                .filter(|(_, c)| self.nodes.get(c.0).map_or(false, |c| c.is_intermediate()))
                .max_by_key(|(visits, _)| *visits)
                .map(|(_, c)| c)?;
        }
    }

    fn best_edge_move(&self, node: NodeRef, role: usize) -> Option<G::Move> {
        struct Candidate<M> {
            mv: M,
            rating: f64,
            visits: u64,
            variance: f64,
            complete: bool,
            decisive: bool,
        }

        let n = self.nodes.get(node.0)?;
        let mut candidates = Vec::new();
        for e in &n.children {
            let edge = match self.edges.get(e.0) {
                Some(edge) => edge,
                None => continue,
            };
            let (child, cn) = match edge
                .child
                .and_then(|c| self.nodes.get(c.0).map(|cn| (c, cn)))
            {
                Some(x) => x,
                None => continue,
            };
            if edge.child_visits == 0 && !cn.complete {
                continue;
            }
            let mv = match &edge.mv {
                Some(mv) => mv.clone(),
                None => continue,
            };

            let scores = self.scores.averages(child.slot());
            let avg = scores[role];
            let mut rating = avg;
            if !cn.complete && cn.expanded && cn.choosing_role != role {
                // the opponent's best known reply caps what this move is worth
                let worst_reply = cn
                    .children
                    .iter()
                    .filter_map(|e| self.edges.get(e.0).and_then(|edge| edge.child))
                    .filter(|gc| self.nodes.get(gc.0).map_or(false, |g| g.complete))
                    .map(|gc| self.scores.average(gc.slot(), role))
                    .fold(f64::INFINITY, f64::min);
                rating = rating.min(worst_reply);
            }

            candidates.push(Candidate {
                mv,
                rating,
                visits: edge.child_visits,
                variance: (self.scores.average_squared(child.slot(), role) - avg * avg).max(0.0),
                complete: cn.complete,
                decisive: cn.complete && is_decisive_win(scores, role),
            });
        }

        let better = |a: &Candidate<G::Move>, b: &Candidate<G::Move>| {
            if a.decisive != b.decisive {
                return a.decisive;
            }
            if (a.rating - b.rating).abs() > completion::SCORE_EPSILON {
                return a.rating > b.rating;
            }
            let steadier = (a.variance - b.variance).abs() > completion::SCORE_EPSILON;
            if a.complete && b.complete && steadier {
                return a.variance < b.variance;
            }
            if a.visits != b.visits {
                return a.visits > b.visits;
            }
            a.variance < b.variance
        };

        let mut best: Option<Candidate<G::Move>> = None;
        for c in candidates {
            let replace = match &best {
                Some(b) => better(&c, b),
                None => true,
            };
            if replace {
                best = Some(c);
            }
        }
        best.map(|c| c.mv)
    }

    /// A snapshot of `node`'s statistics.
    pub fn node_info(&self, node: NodeRef) -> Option<NodeInfo> {
        let n = self.nodes.get(node.0)?;
        Some(NodeInfo {
            visits: n.visits,
            updates: n.updates,
            scores: self.scores.averages(node.slot()).to_vec(),
            complete: n.complete,
            terminal: n.terminal,
            depth: n.depth,
            children: n.children.len(),
            deciding_role: n.deciding_role,
            heuristic_seeded: n.heuristic_seeded,
        })
    }

    /// A snapshot of the root's statistics.
    pub fn root_info(&self) -> Option<NodeInfo> {
        self.node_info(self.root?)
    }

    /// The moves available to the choosing role at the root with their statistics.  Empty until
    /// the root is expanded.
    pub fn child_infos(&self) -> Vec<MoveInfo<G::Move>> {
        let root = match self.root.and_then(|r| self.nodes.get(r.0)) {
            Some(n) => n,
            None => return Vec::new(),
        };
        root.children
            .iter()
            .filter_map(|e| self.edges.get(e.0))
            .filter_map(|edge| {
                Some(MoveInfo {
                    mv: edge.mv.clone()?,
                    visits: edge.child_visits,
                    hyper: edge.hyper,
                    node: edge.child.and_then(|c| self.node_info(c)),
                })
            })
            .collect()
    }

    /// The live child reached from `node` by the choosing role's move `mv`.
    pub fn child_by_move(&self, node: NodeRef, mv: &G::Move) -> Option<NodeRef> {
        self.nodes.get(node.0)?.children.iter().find_map(|e| {
            let edge = self.edges.get(e.0)?;
            if edge.mv.as_ref() != Some(mv) {
                return None;
            }
            edge.child.filter(|c| self.nodes.is_live(c.0))
        })
    }
}

#[cfg(any(test, feature = "test_internals"))]
impl<G, H> SearchTree<G, H>
where
    G: StateMachine,
    H: Heuristic<G::State>,
{
    /// Panic if the graph's structural invariants do not hold.
    #[doc(hidden)]
    pub fn check_invariants(&self) {
        let root = match self.root {
            Some(r) => r,
            None => return,
        };
        let root_node = self.nodes.get(root.0).expect("root is live");
        assert!(root_node.parents.is_empty(), "root has parents");

        for r in self.nodes.live_refs().map(NodeRef) {
            let n = self.nodes.get(r.0).expect("live node");
            for &p in &n.parents {
                let parent = self
                    .nodes
                    .get(p.0)
                    .unwrap_or_else(|| panic!("{:?} has stale parent {:?}", r, p));
                assert!(
                    parent.children.iter().any(|e| self
                        .edges
                        .get(e.0)
                        .map_or(false, |edge| edge.child == Some(r))),
                    "{:?} lists {:?} as parent without an edge",
                    r,
                    p
                );
            }
            for &e in &n.children {
                let edge = self
                    .edges
                    .get(e.0)
                    .unwrap_or_else(|| panic!("{:?} has stale edge {:?}", r, e));
                assert_eq!(edge.parent, Some(r));
                if let Some(c) = edge.child {
                    if let Some(child) = self.nodes.get(c.0) {
                        assert!(child.parents.contains(&r), "{:?} not in parents of {:?}", r, c);
                        assert!(
                            edge.child_visits <= child.visits,
                            "edge visits {} exceed child visits {}",
                            edge.child_visits,
                            child.visits
                        );
                    }
                }
            }
            for s in self.scores.averages(r.slot()) {
                assert!(
                    *s >= -1e-9 && *s <= 100.0 + 1e-9,
                    "score {} out of range",
                    s
                );
            }
            if n.terminal {
                assert!(n.complete, "terminal node is not complete");
            }
        }

        for (state, r) in &self.index {
            let n = self
                .nodes
                .get(r.0)
                .unwrap_or_else(|| panic!("index entry {:?} is stale", r));
            assert!(n.pending.is_empty(), "intermediate node in the index");
            assert_eq!(n.state.as_ref(), Some(state));
        }
    }
}
