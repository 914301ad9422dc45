use std::time::{Duration, Instant};

use crate::tree::{NodeRef, TreePath};

/// A unit of rollout work carried through the pipeline.
///
/// Requests live in the slots of a pipeline shard and are reused in place: the tree thread fills
/// in the target, a worker fills in the result, and the tree thread reads the result back before
/// the slot is handed out again.  Which thread may touch a request is decided solely by the
/// shard's cursors.
#[derive(Debug)]
pub struct RolloutRequest<S, M> {
    /// Position of the request in its shard's sequence.
    pub seq: u64,
    /// The state to roll out from.
    pub state: Option<S>,
    /// Moves already chosen in `state`, to be completed at random before the first transition.
    pub pending: Vec<M>,
    /// The leaf the rollout is for.
    pub node: Option<NodeRef>,
    /// The selection path the result is back-propagated along.
    pub path: TreePath,
    /// Independent playouts to average.
    pub sample_size: usize,
    /// Weighted mean score per role.
    pub averages: Vec<f64>,
    /// Weighted mean squared score per role.
    pub squares: Vec<f64>,
    /// A playout reached an outright win for the leaf's deciding role.
    pub win_found: bool,
    /// Playouts actually run.
    pub playouts: usize,
    /// Mean length of the playouts run.
    pub mean_length: f64,
    /// Set by the worker if the state machine failed.
    pub failed: Option<String>,
    /// When the tree thread published the request.
    pub enqueued_at: Option<Instant>,
    /// Time the worker spent on the request.
    pub rollout_time: Duration,
}

impl<S, M> Default for RolloutRequest<S, M> {
    fn default() -> Self {
        Self {
            seq: 0,
            state: None,
            pending: Vec::new(),
            node: None,
            path: TreePath::default(),
            sample_size: 0,
            averages: Vec::new(),
            squares: Vec::new(),
            win_found: false,
            playouts: 0,
            mean_length: 0.0,
            failed: None,
            enqueued_at: None,
            rollout_time: Duration::default(),
        }
    }
}

impl<S, M> RolloutRequest<S, M> {
    /// Prepare a recycled request for a new rollout.
    pub(crate) fn reset(&mut self, seq: u64, roles: usize) {
        self.seq = seq;
        self.state = None;
        self.pending.clear();
        self.node = None;
        self.path.clear();
        self.sample_size = 0;
        self.averages.clear();
        self.averages.resize(roles, 0.0);
        self.squares.clear();
        self.squares.resize(roles, 0.0);
        self.win_found = false;
        self.playouts = 0;
        self.mean_length = 0.0;
        self.failed = None;
        self.enqueued_at = None;
        self.rollout_time = Duration::default();
    }

    /// Time from publication until now.
    pub fn latency(&self) -> Option<Duration> {
        self.enqueued_at.map(|t| t.elapsed())
    }
}
