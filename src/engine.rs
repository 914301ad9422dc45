//! The search driver.
//!
//! [`SearchEngine`] is owned by the tree thread.  Every iteration it trims the tree if a pool runs
//! low, back-propagates the rollout results that are ready, settles pending completions and, if
//! the pipeline has room, selects a new leaf and publishes a rollout request for it.  Other
//! threads steer a running search through the shared [`SearchControl`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::config::{PoolSizes, SearchConfig};
use crate::error::SearchError;
use crate::pipeline::{Backoff, Pipeline};
use crate::state_machine::{Heuristic, StateMachine};
use crate::tree::{Leaf, MoveInfo, NodeInfo, RootBinding, SearchTree, TreePath};
use crate::worker::{Rollout, RolloutWorker};

/// Counters describing the work done since [`SearchEngine::setup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    /// Selection descents performed.
    pub iterations: u64,
    /// Rollout requests published.
    pub rollouts: u64,
    /// Rollouts whose state machine reported an error.
    pub failed_rollouts: u64,
    /// Time the workers spent executing rollouts.
    pub rollout_time: Duration,
    /// Back-propagation steps skipped because part of the path was trimmed.
    pub stale_updates: u64,
    /// Subtrees unlinked to make room.
    pub trims: u64,
    /// Live tree nodes.
    pub nodes_in_use: usize,
    /// Nodes whose score became exact.
    pub completions: u64,
    /// Longest selection path seen.
    pub max_depth: usize,
}

/// Per-request figures summed up while draining the pipeline.
#[derive(Debug, Clone, Copy, Default)]
struct RolloutTotals {
    failed: u64,
    time: Duration,
}

/// Why [`SearchEngine::search_until`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    /// The root's value is exact; further search cannot change it.
    Solved,
    /// The deadline passed.
    Deadline,
    /// A stop was requested through [`SearchControl::request_stop`].
    Stopped,
}

/// The state of the search published while the driver is yielded.
#[derive(Debug, Clone)]
pub struct SearchSnapshot<M> {
    /// Counters at the time of the yield.
    pub stats: SearchStats,
    /// The root's statistics.
    pub root: Option<NodeInfo>,
    /// The moves of the root's choosing role.
    pub moves: Vec<MoveInfo<M>>,
    /// The move each role would currently play.
    pub best_moves: Vec<Option<M>>,
}

/// A handle for steering a search from other threads.
#[derive(Debug)]
pub struct SearchControl<M> {
    yield_requested: AtomicBool,
    yielded: AtomicBool,
    stop_requested: AtomicBool,
    searching: AtomicBool,
    epoch: Instant,
    // microseconds since `epoch`
    heartbeat: AtomicU64,
    snapshot: Mutex<Option<SearchSnapshot<M>>>,
}

impl<M> SearchControl<M> {
    fn new() -> Self {
        Self {
            yield_requested: AtomicBool::new(false),
            yielded: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            searching: AtomicBool::new(false),
            epoch: Instant::now(),
            heartbeat: AtomicU64::new(0),
            snapshot: Mutex::new(None),
        }
    }

    /// Ask the driver to pause (`true`) or resume (`false`) at the next iteration boundary.
    pub fn request_yield(&self, yield_now: bool) {
        self.yield_requested.store(yield_now, Ordering::SeqCst);
    }

    /// `true` while a yield is requested.
    pub fn is_yield_requested(&self) -> bool {
        self.yield_requested.load(Ordering::SeqCst)
    }

    /// `true` while the driver is paused and its snapshot is current.
    pub fn is_yielded(&self) -> bool {
        self.yielded.load(Ordering::SeqCst)
    }

    /// Ask the driver to drain in-flight rollouts and return.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// `true` once a stop was requested and not yet cleared by a new search.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// `true` while [`SearchEngine::search_until`] is running.
    pub fn is_searching(&self) -> bool {
        self.searching.load(Ordering::SeqCst)
    }

    /// Time since the driver last reported progress.
    pub fn since_heartbeat(&self) -> Duration {
        let last = Duration::from_micros(self.heartbeat.load(Ordering::SeqCst));
        self.epoch.elapsed().checked_sub(last).unwrap_or_default()
    }

    /// Fail with [`SearchError::Stalled`] if a running search has not reported progress for
    /// longer than `max_silence`.  The engine is not expected to recover from a stall.
    pub fn check_liveness(&self, max_silence: Duration) -> Result<(), SearchError> {
        if !self.is_searching() {
            return Ok(());
        }
        let silent_for = self.since_heartbeat();
        if silent_for > max_silence {
            error!(?silent_for, "search engine stalled");
            return Err(SearchError::Stalled { silent_for });
        }
        Ok(())
    }

    /// Run `f` on the snapshot published by the last yield, if any.
    pub fn with_snapshot<R>(&self, f: impl FnOnce(Option<&SearchSnapshot<M>>) -> R) -> R {
        let guard = match self.snapshot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(guard.as_ref())
    }

    fn beat(&self) {
        let now = self.epoch.elapsed().as_micros() as u64;
        self.heartbeat.store(now, Ordering::SeqCst);
    }

    fn publish(&self, snapshot: SearchSnapshot<M>) {
        match self.snapshot.lock() {
            Ok(mut guard) => *guard = Some(snapshot),
            Err(poisoned) => *poisoned.into_inner() = Some(snapshot),
        }
        self.yielded.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.yielded.store(false, Ordering::SeqCst);
    }

    fn set_searching(&self, searching: bool) {
        self.searching.store(searching, Ordering::SeqCst);
        if !searching {
            self.resume();
        }
    }

    fn reset(&self) {
        self.yield_requested.store(false, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
        self.resume();
    }
}

/// Drives a pipelined Monte Carlo tree search over a [`StateMachine`].
///
/// ```no_run
/// # use ggp_mcts::prelude::*;
/// # use std::time::{Duration, Instant};
/// # fn play<G: StateMachine>(sm: G, state: G::State) -> Result<G::Move, SearchError> {
/// let mut engine = SearchEngine::new(SearchConfig::default());
/// engine.setup(sm, state.clone(), NoHeuristic, PoolSizes::default())?;
/// let deadline = Instant::now() + Duration::from_secs(1);
/// engine.start_search(deadline, state)?;
/// engine.search_until(deadline)?;
/// engine.get_best_move(0)
/// # }
/// ```
pub struct SearchEngine<G: StateMachine, H> {
    config: SearchConfig,
    tree: Option<SearchTree<G, H>>,
    pipeline: Option<Pipeline<G::State, G::Move>>,
    workers: Vec<RolloutWorker>,
    // executes rollouts on the tree thread when there are no workers
    inline: Option<Rollout<G>>,
    control: Arc<SearchControl<G::Move>>,
    path: TreePath,
    backoff: Backoff,
    deadline: Option<Instant>,
    iterations: u64,
    rollouts: u64,
    totals: RolloutTotals,
}

impl<G: StateMachine, H> fmt::Debug for SearchEngine<G, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchEngine")
            .field("config", &self.config)
            .field("tree", &self.tree)
            .field("pipeline", &self.pipeline)
            .field("workers", &self.workers.len())
            .field("deadline", &self.deadline)
            .field("iterations", &self.iterations)
            .finish()
    }
}

impl<G, H> SearchEngine<G, H>
where
    G: StateMachine,
    H: Heuristic<G::State>,
{
    /// An engine that still needs [`SearchEngine::setup`].
    pub fn new(config: SearchConfig) -> Self {
        let backoff = Backoff::new(config.spin_limit);
        Self {
            config,
            tree: None,
            pipeline: None,
            workers: Vec::new(),
            inline: None,
            control: Arc::new(SearchControl::new()),
            path: TreePath::default(),
            backoff,
            deadline: None,
            iterations: 0,
            rollouts: 0,
            totals: RolloutTotals::default(),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Build a fresh tree rooted at `initial_state` and start the rollout workers, each with its
    /// own copy of `sm`.  Any previous tree and workers are discarded.
    pub fn setup(
        &mut self,
        sm: G,
        initial_state: G::State,
        heuristic: H,
        pool_sizes: PoolSizes,
    ) -> Result<(), SearchError> {
        self.shutdown_workers();
        self.tree = None;
        self.pipeline = None;
        self.inline = None;
        self.iterations = 0;
        self.rollouts = 0;
        self.totals = RolloutTotals::default();
        self.control.reset();
        self.config.pool_sizes = pool_sizes;

        let roles = sm.role_count();
        let pipeline = Pipeline::new(
            self.config.shard_count(),
            self.config.pipeline_capacity,
            roles,
        );
        if self.config.worker_count == 0 {
            self.inline = Some(Rollout::new(sm.clone(), &self.config, 0));
        } else {
            for index in 0..self.config.worker_count {
                let worker = RolloutWorker::spawn(
                    index,
                    pipeline.shard(index),
                    Rollout::new(sm.clone(), &self.config, index as u64 + 1),
                    self.config.spin_limit,
                    self.config.idle_sleep,
                )?;
                self.workers.push(worker);
            }
        }

        let mut tree = SearchTree::new(sm, heuristic, self.config.clone());
        tree.set_root(initial_state)?;
        info!(
            roles,
            workers = self.config.worker_count,
            nodes = pool_sizes.nodes,
            edges = pool_sizes.edges,
            "search engine set up"
        );
        self.tree = Some(tree);
        self.pipeline = Some(pipeline);
        Ok(())
    }

    /// Rebind the root to `state` and arm the search for `deadline`.
    ///
    /// In-flight rollouts are drained first.  If `state` is already in the tree the subgraph
    /// reachable from it is kept and everything else is freed.
    pub fn start_search(
        &mut self,
        deadline: Instant,
        state: G::State,
    ) -> Result<RootBinding, SearchError> {
        self.drain_in_flight();
        let tree = self.tree.as_mut().ok_or(SearchError::NotSetUp)?;
        let binding = tree.set_root(state)?;
        self.deadline = Some(deadline);
        self.control.reset();
        self.control.beat();
        info!(
            ?binding,
            nodes = tree.node_pool_stats().in_use,
            "search started"
        );
        Ok(binding)
    }

    /// Perform one iteration.  Returns `true` once the root is solved.
    pub fn grow_tree(&mut self) -> Result<bool, SearchError> {
        let tree = self.tree.as_mut().ok_or(SearchError::NotSetUp)?;
        let pipeline = self.pipeline.as_mut().ok_or(SearchError::NotSetUp)?;
        self.control.beat();

        tree.trim_if_needed();
        let drained = drain_ready(tree, pipeline, &mut self.totals);
        tree.process_completions();
        if tree.is_solved() {
            return Ok(true);
        }

        if !pipeline.can_expand() {
            if drained == 0 {
                self.backoff.snooze();
            }
            return Ok(false);
        }
        self.backoff.reset();

        self.iterations += 1;
        if let Leaf::Rollout {
            node,
            state,
            pending,
        } = tree.select_leaf(&mut self.path)?
        {
            let path = &self.path;
            let sample_size = self.config.sample_size;
            let submitted = pipeline.submit(|request| {
                request.state = Some(state);
                request.pending = pending;
                request.node = Some(node);
                request.path.copy_from(path);
                request.sample_size = sample_size;
            });
            debug_assert!(submitted.is_some(), "pipeline filled up during selection");
            self.rollouts += 1;

            if let Some(rollout) = self.inline.as_mut() {
                pipeline
                    .shard(0)
                    .with_rollout_slot(|request| rollout.execute(request));
                drain_ready(tree, pipeline, &mut self.totals);
            }
        }
        tree.process_completions();
        Ok(tree.is_solved())
    }

    /// Grow the tree until `deadline`, until the root is solved, or until a stop is requested.
    ///
    /// Errors reported by the state machine abandon the current iteration only.  While a yield
    /// is requested the driver publishes a [`SearchSnapshot`] and sleeps in short increments.
    pub fn search_until(&mut self, deadline: Instant) -> Result<SearchOutcome, SearchError> {
        if self.tree.is_none() {
            return Err(SearchError::NotSetUp);
        }
        self.control.set_searching(true);
        let outcome = self.search_loop(deadline);
        self.control.set_searching(false);
        let stats = self.stats();
        debug!(?outcome, iterations = stats.iterations, nodes = stats.nodes_in_use, "search ended");
        outcome
    }

    /// [`SearchEngine::search_until`] the deadline given to [`SearchEngine::start_search`].
    pub fn search(&mut self) -> Result<SearchOutcome, SearchError> {
        let deadline = self.deadline.ok_or(SearchError::NotSetUp)?;
        self.search_until(deadline)
    }

    fn search_loop(&mut self, deadline: Instant) -> Result<SearchOutcome, SearchError> {
        loop {
            self.control.beat();
            if self.control.is_stop_requested() {
                self.drain_in_flight();
                return Ok(SearchOutcome::Stopped);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(SearchOutcome::Deadline);
            }

            if self.control.is_yield_requested() {
                if !self.control.is_yielded() {
                    let snapshot = self.snapshot()?;
                    self.control.publish(snapshot);
                    debug!("search yielded");
                }
                thread::sleep(self.config.idle_sleep.min(deadline - now));
                continue;
            }
            self.control.resume();

            match self.grow_tree() {
                Ok(true) => {
                    self.drain_in_flight();
                    return Ok(SearchOutcome::Solved);
                }
                Ok(false) => {}
                Err(SearchError::Game(e)) => warn!(error = %e, "abandoning search iteration"),
                Err(e) => return Err(e),
            }
        }
    }

    /// The move `role` should play from the root.
    ///
    /// Falls back to an arbitrary legal move when nothing has been searched yet.
    pub fn get_best_move(&mut self, role: usize) -> Result<G::Move, SearchError> {
        let tree = self.tree.as_mut().ok_or(SearchError::NotSetUp)?;
        tree.best_move(role)?.ok_or(SearchError::NoMoveAvailable)
    }

    /// Ask a running [`SearchEngine::search_until`] to pause (`true`) or resume (`false`).
    pub fn request_yield(&self, yield_now: bool) {
        self.control.request_yield(yield_now);
    }

    /// Drain in-flight rollouts and shut down the workers.  The tree stays readable, but a new
    /// [`SearchEngine::setup`] is needed to search again.
    pub fn stop(&mut self) {
        self.control.request_stop();
        self.drain_in_flight();
        self.shutdown_workers();
        self.pipeline = None;
        self.inline = None;
        info!(iterations = self.iterations, "search engine stopped");
    }

    /// A shared handle for steering the search from other threads.
    pub fn control(&self) -> Arc<SearchControl<G::Move>> {
        Arc::clone(&self.control)
    }

    /// Counters of the search so far.
    pub fn stats(&self) -> SearchStats {
        let mut stats = SearchStats {
            iterations: self.iterations,
            rollouts: self.rollouts,
            failed_rollouts: self.totals.failed,
            rollout_time: self.totals.time,
            ..SearchStats::default()
        };
        if let Some(tree) = &self.tree {
            let counters = tree.counters();
            stats.stale_updates = counters.stale_updates;
            stats.trims = counters.trims;
            stats.completions = counters.completions;
            stats.max_depth = counters.max_depth;
            stats.nodes_in_use = tree.node_pool_stats().in_use;
        }
        stats
    }

    /// `true` once the root's value is exact.
    pub fn is_solved(&self) -> bool {
        self.tree.as_ref().map_or(false, |t| t.is_solved())
    }

    /// Statistics of the root node.
    pub fn root_info(&self) -> Option<NodeInfo> {
        self.tree.as_ref()?.root_info()
    }

    /// Statistics of the moves available at the root.
    pub fn child_infos(&self) -> Vec<MoveInfo<G::Move>> {
        self.tree
            .as_ref()
            .map(|t| t.child_infos())
            .unwrap_or_default()
    }

    /// Direct access to the search graph.
    #[cfg(any(test, feature = "test_internals"))]
    #[doc(hidden)]
    pub fn tree(&self) -> Option<&SearchTree<G, H>> {
        self.tree.as_ref()
    }

    fn snapshot(&mut self) -> Result<SearchSnapshot<G::Move>, SearchError> {
        let stats = self.stats();
        let tree = self.tree.as_mut().ok_or(SearchError::NotSetUp)?;
        // a role whose moves cannot be listed gets no best move
        let best_moves = (0..tree.role_count())
            .map(|role| {
                tree.best_move(role).unwrap_or_else(|e| {
                    warn!(role, error = %e, "no best move for snapshot");
                    None
                })
            })
            .collect::<Vec<_>>();
        Ok(SearchSnapshot {
            stats,
            root: tree.root_info(),
            moves: tree.child_infos(),
            best_moves,
        })
    }

    /// Back-propagate every published request.  Gives up if a worker with work in flight has
    /// exited.
    fn drain_in_flight(&mut self) {
        let (tree, pipeline) = match (self.tree.as_mut(), self.pipeline.as_mut()) {
            (Some(tree), Some(pipeline)) => (tree, pipeline),
            _ => return,
        };
        let mut backoff = Backoff::new(self.config.spin_limit);
        while pipeline.in_flight() > 0 {
            if let Some(rollout) = self.inline.as_mut() {
                pipeline
                    .shard(0)
                    .with_rollout_slot(|request| rollout.execute(request));
            }
            if drain_ready(tree, pipeline, &mut self.totals) > 0 {
                backoff.reset();
                continue;
            }
            let stuck = self
                .workers
                .iter()
                .any(|w| w.is_finished() && pipeline.shard(w.index()).in_flight() > 0);
            if stuck {
                error!(
                    in_flight = pipeline.in_flight(),
                    "rollout worker exited with work in flight"
                );
                break;
            }
            backoff.snooze();
        }
        tree.process_completions();
    }

    fn shutdown_workers(&mut self) {
        for worker in &self.workers {
            worker.request_stop();
        }
        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

/// Back-propagate the results that are ready.  Returns the number of requests consumed.
///
/// A request whose rollout proved an outright win from its leaf's own state settles that leaf
/// before its result is folded in.
fn drain_ready<G, H>(
    tree: &mut SearchTree<G, H>,
    pipeline: &mut Pipeline<G::State, G::Move>,
    totals: &mut RolloutTotals,
) -> usize
where
    G: StateMachine,
    H: Heuristic<G::State>,
{
    let mut drained = 0;
    while pipeline
        .drain_one(|request| {
            totals.time += request.rollout_time;
            if let Some(e) = &request.failed {
                warn!(seq = request.seq, error = %e, "rollout failed");
                totals.failed += 1;
                return;
            }
            trace!(
                seq = request.seq,
                playouts = request.playouts,
                latency = ?request.latency(),
                rollout_time = ?request.rollout_time,
                "back-propagating rollout"
            );
            if request.win_found && request.pending.is_empty() {
                if let Some(node) = request.node {
                    if let Err(e) = tree.settle_proven_win(node) {
                        warn!(seq = request.seq, error = %e, "could not settle proven win");
                    }
                }
            }
            tree.back_propagate(&request.path, &request.averages, &request.squares);
        })
        .is_some()
    {
        drained += 1;
    }
    drained
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::GameError;
    use crate::state_machine::test::{Subtract, SubtractState};
    use crate::state_machine::NoHeuristic;

    type Engine = SearchEngine<Subtract, NoHeuristic>;

    /// [`Subtract`] whose second role cannot list its moves.
    #[derive(Debug, Clone)]
    struct SilentSecond(Subtract);

    impl StateMachine for SilentSecond {
        type State = SubtractState;
        type Move = u32;

        fn role_count(&self) -> usize {
            2
        }

        fn is_terminal(&mut self, state: &SubtractState) -> Result<bool, GameError> {
            self.0.is_terminal(state)
        }

        fn legal_moves(
            &mut self,
            state: &SubtractState,
            role: usize,
        ) -> Result<Vec<u32>, GameError> {
            if role == 1 {
                return Err(GameError::Malformed("role 1 has no move list".into()));
            }
            self.0.legal_moves(state, role)
        }

        fn next_state(
            &mut self,
            state: &SubtractState,
            joint_move: &[u32],
        ) -> Result<SubtractState, GameError> {
            self.0.next_state(state, joint_move)
        }

        fn goal_value(&mut self, state: &SubtractState, role: usize) -> Result<u32, GameError> {
            self.0.goal_value(state, role)
        }
    }

    fn engine(start: u32, config: SearchConfig) -> Engine {
        let sm = Subtract { start };
        let pool_sizes = config.pool_sizes;
        let mut engine = Engine::new(config);
        engine
            .setup(sm.clone(), sm.initial(), NoHeuristic, pool_sizes)
            .unwrap();
        engine
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn test_requires_setup() {
        let mut engine = Engine::new(SearchConfig::for_testing());
        assert!(matches!(engine.grow_tree(), Err(SearchError::NotSetUp)));
        assert!(matches!(engine.get_best_move(0), Err(SearchError::NotSetUp)));
        assert!(matches!(
            engine.search_until(far_deadline()),
            Err(SearchError::NotSetUp)
        ));
        assert!(engine.root_info().is_none());
    }

    #[test]
    fn test_inline_search_solves_subtract() {
        let mut engine = engine(7, SearchConfig::for_testing());
        let state = Subtract { start: 7 }.initial();
        assert_eq!(
            engine.start_search(far_deadline(), state).unwrap(),
            RootBinding::Reused { nodes: 1 }
        );
        assert_eq!(engine.search().unwrap(), SearchOutcome::Solved);
        assert!(engine.is_solved());
        assert_eq!(engine.get_best_move(0).unwrap(), 1);
        assert_eq!(engine.get_best_move(1).unwrap(), 0);

        let stats = engine.stats();
        assert!(stats.iterations > 0);
        assert!(stats.completions > 0);
        assert_eq!(stats.failed_rollouts, 0);
        assert_eq!(stats.stale_updates, 0);
        engine.tree().unwrap().check_invariants();
    }

    /// Compare the root's average with the visit-weighted average of its children.
    fn assert_root_matches_children(engine: &Engine) {
        let root = engine.root_info().unwrap();
        let moves = engine.child_infos();
        // seeds count as updates the edges never saw
        assert!(moves
            .iter()
            .all(|m| !m.node.as_ref().unwrap().heuristic_seeded));
        let total = moves.iter().map(|m| m.visits).sum::<u64>();
        assert_eq!(total, root.updates);
        for role in 0..2 {
            let weighted = moves
                .iter()
                .map(|m| m.visits as f64 * m.node.as_ref().unwrap().scores[role])
                .sum::<f64>()
                / total as f64;
            assert!(
                (weighted - root.scores[role]).abs() < 1e-3,
                "role {}: children {} vs root {}",
                role,
                weighted,
                root.scores[role]
            );
        }
    }

    #[test]
    fn test_root_average_matches_children() {
        let mut engine = engine(30, SearchConfig::for_testing());
        let mut checked = 0;
        for _ in 0..400 {
            if engine.grow_tree().unwrap() {
                break;
            }
            assert_root_matches_children(&engine);
            checked += 1;
        }
        assert!(checked > 10);
        // terminal positions were reached, so completions and their corrections took part
        assert!(engine.stats().completions > 0);
    }

    #[test]
    fn test_threaded_search() {
        let config = SearchConfig::for_testing()
            .with_workers(2)
            .with_pipeline_capacity(8);
        let mut engine = engine(40, config);
        let deadline = Instant::now() + Duration::from_millis(300);
        let outcome = engine.search_until(deadline).unwrap();
        assert_ne!(outcome, SearchOutcome::Stopped);

        let stats = engine.stats();
        assert!(stats.rollouts > 10);
        assert_eq!(stats.failed_rollouts, 0);
        engine.stop();
        engine.tree().unwrap().check_invariants();
        assert!(engine.get_best_move(0).is_ok());
        // the workers are gone
        assert!(matches!(engine.grow_tree(), Err(SearchError::NotSetUp)));
    }

    #[test]
    fn test_yield_publishes_snapshot_and_stop_returns() {
        let config = SearchConfig::for_testing().with_workers(1);
        // far too large to be solved before the yield
        let mut engine = engine(100_000, config);
        let control = engine.control();

        let observer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            control.request_yield(true);
            while !control.is_yielded() {
                thread::sleep(Duration::from_millis(1));
            }
            let (iterations, moves) = control.with_snapshot(|s| {
                let s = s.expect("published before yielding");
                assert_eq!(s.best_moves.len(), 2);
                (s.stats.iterations, s.moves.len())
            });
            assert!(control.check_liveness(Duration::from_secs(5)).is_ok());
            control.request_stop();
            (iterations, moves)
        });

        let outcome = engine.search_until(far_deadline()).unwrap();
        assert_eq!(outcome, SearchOutcome::Stopped);
        let (iterations, moves) = observer.join().unwrap();
        assert!(iterations > 0);
        assert_eq!(moves, 2);
        // a stopped search leaves nothing in flight
        assert_eq!(engine.pipeline.as_ref().unwrap().in_flight(), 0);
        assert!(!engine.control().is_searching());
    }

    #[test]
    fn test_liveness_check() {
        let control = SearchControl::<u32>::new();
        assert!(control.check_liveness(Duration::from_millis(0)).is_ok());

        control.set_searching(true);
        control.beat();
        thread::sleep(Duration::from_millis(20));
        match control.check_liveness(Duration::from_millis(5)) {
            Err(SearchError::Stalled { silent_for }) => {
                assert!(silent_for >= Duration::from_millis(5))
            }
            other => panic!("expected a stall, got {:?}", other),
        }
        control.beat();
        assert!(control.check_liveness(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_start_search_reuses_subtree() {
        let mut engine = engine(12, SearchConfig::for_testing());
        for _ in 0..200 {
            engine.grow_tree().unwrap();
        }
        let before = engine.stats().nodes_in_use;

        let next = SubtractState {
            remaining: 10,
            to_move: 0,
        };
        match engine.start_search(far_deadline(), next).unwrap() {
            RootBinding::Reused { nodes } => assert!(nodes < before),
            RootBinding::Fresh => panic!("the state was searched"),
        }
        assert_eq!(engine.root_info().unwrap().depth, 0);
        engine.tree().unwrap().check_invariants();

        let unseen = SubtractState {
            remaining: 90,
            to_move: 1,
        };
        assert_eq!(
            engine.start_search(far_deadline(), unseen).unwrap(),
            RootBinding::Fresh
        );
        assert_eq!(engine.stats().nodes_in_use, 1);
    }

    #[test]
    fn test_proven_win_settles_leaf_on_drain() {
        let config = SearchConfig {
            greedy_terminal_check: false,
            ..SearchConfig::for_testing()
        };
        let mut engine = engine(4, config);
        assert!(!engine.grow_tree().unwrap());

        let tree = engine.tree.as_mut().unwrap();
        let pipeline = engine.pipeline.as_mut().unwrap();
        let state = SubtractState {
            remaining: 2,
            to_move: 1,
        };
        let two = tree.lookup_transposition(&state).unwrap();
        assert!(!tree.node_info(two).unwrap().complete);

        let mut path = TreePath::default();
        path.start(two);
        pipeline
            .submit(|request| {
                request.state = Some(state);
                request.node = Some(two);
                request.path.copy_from(&path);
                request.sample_size = 1;
            })
            .unwrap();
        // what a worker reports after its greedy check found the winning take
        pipeline.shard(0).with_rollout_slot(|request| {
            request.averages.copy_from_slice(&[0.0, 100.0]);
            request.squares.copy_from_slice(&[0.0, 10_000.0]);
            request.win_found = true;
            request.playouts = 1;
            request.rollout_time = Duration::from_millis(3);
        });

        let mut totals = RolloutTotals::default();
        assert_eq!(drain_ready(tree, pipeline, &mut totals), 1);
        tree.process_completions();
        let info = tree.node_info(two).unwrap();
        assert!(info.complete);
        assert_eq!(info.scores, vec![0.0, 100.0]);
        assert_eq!(totals.time, Duration::from_millis(3));
        assert_eq!(totals.failed, 0);
    }

    #[test]
    fn test_state_machine_errors_do_not_end_search() {
        let sm = SilentSecond(Subtract { start: 9 });
        let config = SearchConfig::for_testing();
        let pool_sizes = config.pool_sizes;
        let mut engine = SearchEngine::new(config);
        engine
            .setup(sm.clone(), sm.0.initial(), NoHeuristic, pool_sizes)
            .unwrap();

        // every expansion fails, yet the search runs until its deadline
        let deadline = Instant::now() + Duration::from_millis(30);
        assert_eq!(engine.search_until(deadline).unwrap(), SearchOutcome::Deadline);

        // the same holds while publishing a snapshot
        engine.request_yield(true);
        let deadline = Instant::now() + Duration::from_millis(30);
        assert_eq!(engine.search_until(deadline).unwrap(), SearchOutcome::Deadline);
        let best_moves = engine
            .control()
            .with_snapshot(|s| s.map(|s| s.best_moves.clone()));
        assert_eq!(best_moves, Some(vec![Some(1), None]));
    }

    #[test]
    fn test_best_move_falls_back_before_search() {
        let mut engine = engine(9, SearchConfig::for_testing());
        assert_eq!(engine.get_best_move(0).unwrap(), 1);
    }
}
