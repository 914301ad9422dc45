use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, trace};

use crate::config::SearchConfig;
use crate::error::{GameError, SearchError};
use crate::pipeline::{Backoff, PipelineShard};
use crate::request::RolloutRequest;
use crate::state_machine::StateMachine;

/// Playouts longer than this multiple of the running mean length are down-weighted.
const DECAY_THRESHOLD: f64 = 1.5;
/// Number of recent playouts the running mean length roughly reflects.
const LENGTH_WINDOW: u64 = 1_000;
/// A worker without work for this long sleeps between polls.
const PARK_AFTER: Duration = Duration::from_millis(50);

/// Executes rollout requests against a private copy of the state machine.
#[derive(Debug)]
pub struct Rollout<G> {
    sm: G,
    rng: StdRng,
    depth_limit: usize,
    length_decay: bool,
    greedy_terminal_check: bool,
    mean_length: f64,
    observed: u64,
}

impl<G: StateMachine> Rollout<G> {
    /// A rollout executor whose rng is derived from the configured seed and `stream`.
    pub fn new(sm: G, config: &SearchConfig, stream: u64) -> Self {
        let rng = match config.seed {
            Some(seed) => {
                StdRng::seed_from_u64(seed.wrapping_add(stream.wrapping_mul(0x9e37_79b9)))
            }
            None => StdRng::from_entropy(),
        };
        Self {
            sm,
            rng,
            depth_limit: config.rollout_depth_limit,
            length_decay: config.playout_length_decay,
            greedy_terminal_check: config.greedy_terminal_check,
            mean_length: 0.0,
            observed: 0,
        }
    }

    /// Running mean length of the playouts this executor has seen.
    pub fn mean_length(&self) -> f64 {
        self.mean_length
    }

    /// Perform `request`, recording a failure in the request instead of returning it.
    pub fn execute(&mut self, request: &mut RolloutRequest<G::State, G::Move>) {
        let started = Instant::now();
        if let Err(e) = self.run(request) {
            request.failed = Some(e.to_string());
        }
        request.rollout_time = started.elapsed();
    }

    /// Fill in the request's averages from `sample_size` playouts.
    pub fn run(
        &mut self,
        request: &mut RolloutRequest<G::State, G::Move>,
    ) -> Result<(), GameError> {
        let roles = self.sm.role_count();
        let state = request
            .state
            .clone()
            .ok_or_else(|| GameError::Malformed("rollout request without a state".into()))?;

        let start = if request.pending.is_empty() {
            state
        } else {
            let mut joint = request.pending.clone();
            for role in joint.len()..roles {
                let moves = self.sm.legal_moves(&state, role)?;
                let m = moves
                    .choose(&mut self.rng)
                    .ok_or(GameError::NoLegalMoves { role })?
                    .clone();
                joint.push(m);
            }
            self.sm.next_state(&state, &joint)?
        };

        request.averages.resize(roles, 0.0);
        request.squares.resize(roles, 0.0);

        if self.sm.is_terminal(&start)? {
            let scores = (0..roles)
                .map(|role| self.sm.goal_value(&start, role).map(|g| f64::from(g.min(100))))
                .collect::<Result<Vec<_>, _>>()?;
            self.record_exact(request, &scores);
            return Ok(());
        }

        if self.greedy_terminal_check {
            if let Some(scores) = self.immediate_win(&start)? {
                trace!(seq = request.seq, "greedy check found a winning move");
                request.win_found = true;
                self.record_exact(request, &scores);
                return Ok(());
            }
        }

        let mut total_weight = 0.0;
        let mut total_length = 0.0;
        for _ in 0..request.sample_size.max(1) {
            let charge = self.sm.depth_charge(&start, self.depth_limit, &mut self.rng)?;
            let length = charge.length as f64;
            let weight = self.weight_of(length);
            self.observe_length(length);

            total_weight += weight;
            total_length += length;
            request.playouts += 1;
            if total_weight > 0.0 {
                let share = weight / total_weight;
                for (role, s) in charge.scores.iter().enumerate().take(roles) {
                    request.averages[role] += (s - request.averages[role]) * share;
                    request.squares[role] += (s * s - request.squares[role]) * share;
                }
            }

            if roles == 1 && charge.terminal && charge.scores[0] >= 100.0 {
                request.win_found = true;
                break;
            }
        }
        request.mean_length = total_length / request.playouts as f64;
        Ok(())
    }

    fn record_exact(&mut self, request: &mut RolloutRequest<G::State, G::Move>, scores: &[f64]) {
        for (role, s) in scores.iter().enumerate() {
            request.averages[role] = *s;
            request.squares[role] = s * s;
        }
        request.playouts = 1;
        request.mean_length = 0.0;
    }

    /// If exactly one role has a choice in `state` and one of its moves ends the game with that
    /// role as the only winner, the goal values of the resulting state.
    fn immediate_win(&mut self, state: &G::State) -> Result<Option<Vec<f64>>, GameError> {
        let roles = self.sm.role_count();
        let mut joint = Vec::with_capacity(roles);
        let mut mover = None;
        let mut choices = Vec::new();
        for role in 0..roles {
            let mut moves = self.sm.legal_moves(state, role)?;
            match moves.len() {
                0 => return Err(GameError::NoLegalMoves { role }),
                1 => joint.extend(moves.pop()),
                _ if mover.is_some() => return Ok(None),
                _ => {
                    mover = Some(role);
                    joint.extend(moves.first().cloned());
                    choices = moves;
                }
            }
        }
        let mover = match mover {
            Some(m) => m,
            None => return Ok(None),
        };

        for m in choices {
            joint[mover] = m;
            let next = self.sm.next_state(state, &joint)?;
            if !self.sm.is_terminal(&next)? {
                continue;
            }
            let scores = (0..roles)
                .map(|role| self.sm.goal_value(&next, role).map(|g| f64::from(g.min(100))))
                .collect::<Result<Vec<_>, _>>()?;
            let outright = scores[mover] >= 100.0
                && scores
                    .iter()
                    .enumerate()
                    .all(|(role, s)| role == mover || *s < 100.0);
            if outright {
                return Ok(Some(scores));
            }
        }
        Ok(None)
    }

    fn weight_of(&self, length: f64) -> f64 {
        if !self.length_decay || self.observed == 0 || self.mean_length <= 0.0 {
            return 1.0;
        }
        let threshold = DECAY_THRESHOLD * self.mean_length;
        if length <= threshold {
            1.0
        } else {
            (-(length - threshold) / self.mean_length).exp()
        }
    }

    fn observe_length(&mut self, length: f64) {
        self.observed = (self.observed + 1).min(LENGTH_WINDOW);
        self.mean_length += (length - self.mean_length) / self.observed as f64;
    }
}

/// A thread that services one pipeline shard until stopped.
#[derive(Debug)]
pub struct RolloutWorker {
    index: usize,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RolloutWorker {
    /// Spawn worker `index`, executing the requests published on `shard` with `rollout`.
    pub fn spawn<G: StateMachine>(
        index: usize,
        shard: Arc<PipelineShard<G::State, G::Move>>,
        mut rollout: Rollout<G>,
        spin_limit: Duration,
        idle_sleep: Duration,
    ) -> Result<Self, SearchError> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("Worker {}", index))
                .spawn(move || {
                    debug!(worker = index, "rollout worker started");
                    let mut backoff = Backoff::new(spin_limit);
                    let mut idle_since = Instant::now();
                    let mut completed = 0u64;
                    while !stop.load(Ordering::Acquire) {
                        match shard.with_rollout_slot(|request| rollout.execute(request)) {
                            Some(()) => {
                                completed += 1;
                                backoff.reset();
                                idle_since = Instant::now();
                            }
                            None if idle_since.elapsed() > PARK_AFTER => thread::sleep(idle_sleep),
                            None => backoff.snooze(),
                        }
                    }
                    debug!(worker = index, completed, "rollout worker stopped");
                })
                .map_err(SearchError::WorkerSpawn)?
        };
        Ok(Self {
            index,
            stop,
            thread: Some(thread),
        })
    }

    /// The worker's index, which is also the index of its shard.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Ask the worker to exit once its current rollout is done.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// `true` if the thread has exited, whether stopped or by panicking.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop the worker and wait for its thread to exit.
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                debug!(worker = self.index, "rollout worker panicked");
            }
        }
    }
}

impl Drop for RolloutWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
