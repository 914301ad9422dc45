//! Hand-off of rollout requests between the tree thread and the rollout workers.
//!
//! Each worker owns one [`PipelineShard`], a ring of request slots described by three
//! monotonically increasing cursors:
//!
//! * `last_expanded`: requests published by the tree thread,
//! * `last_rolled_out`: requests the worker has finished,
//! * `last_back_propagated`: results the tree thread has consumed.
//!
//! Each cursor has exactly one writer, and a slot is only ever touched by the thread whose stage
//! the cursors currently assign it to.  The slot mutexes are therefore never contended; they are
//! claimed with `try_lock` and a failed claim is a sequencing bug.

use std::fmt;
use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::request::RolloutRequest;

/// One worker's bounded ring of rollout requests.
pub struct PipelineShard<S, M> {
    slots: Box<[Mutex<RolloutRequest<S, M>>]>,
    last_expanded: AtomicU64,
    last_rolled_out: AtomicU64,
    last_back_propagated: AtomicU64,
}

impl<S, M> fmt::Debug for PipelineShard<S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineShard")
            .field("capacity", &self.capacity())
            .field("last_expanded", &self.last_expanded.load(Ordering::Relaxed))
            .field("last_rolled_out", &self.last_rolled_out.load(Ordering::Relaxed))
            .field(
                "last_back_propagated",
                &self.last_back_propagated.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl<S, M> PipelineShard<S, M> {
    /// A shard that admits up to `capacity` requests in flight.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "pipeline capacity must be positive");
        let slots = (0..capacity)
            .map(|_| Mutex::new(RolloutRequest::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            last_expanded: AtomicU64::new(0),
            last_rolled_out: AtomicU64::new(0),
            last_back_propagated: AtomicU64::new(0),
        }
    }

    /// Maximum number of requests in flight.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// `true` if the tree thread may publish another request.
    pub fn can_expand(&self) -> bool {
        self.last_expanded.load(Ordering::Relaxed)
            < self.last_back_propagated.load(Ordering::Relaxed) + self.capacity() as u64
    }

    /// `true` if a published request awaits its rollout.
    pub fn can_roll_out(&self) -> bool {
        self.last_rolled_out.load(Ordering::Relaxed) < self.last_expanded.load(Ordering::Acquire)
    }

    /// `true` if a finished rollout awaits back-propagation.
    pub fn can_back_propagate(&self) -> bool {
        self.last_back_propagated.load(Ordering::Relaxed)
            < self.last_rolled_out.load(Ordering::Acquire)
    }

    /// Requests published but not yet back-propagated.
    pub fn in_flight(&self) -> u64 {
        self.last_expanded.load(Ordering::Acquire)
            - self.last_back_propagated.load(Ordering::Acquire)
    }

    fn claim(&self, seq: u64) -> MutexGuard<'_, RolloutRequest<S, M>> {
        let slot = &self.slots[(seq % self.capacity() as u64) as usize];
        match slot.try_lock() {
            Ok(guard) => guard,
            // a worker panicked mid-rollout; the request is reset before reuse anyway
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                panic!("pipeline slot for request {} claimed out of order", seq)
            }
        }
    }

    /// Fill in the next request with `f` and publish it to the worker.
    ///
    /// # Panics
    ///
    /// Panics if the shard is full; check [`PipelineShard::can_expand`] first.
    pub fn with_expand_slot<R>(
        &self,
        roles: usize,
        f: impl FnOnce(&mut RolloutRequest<S, M>) -> R,
    ) -> R {
        assert!(self.can_expand(), "expanding into a full pipeline shard");
        let seq = self.last_expanded.load(Ordering::Relaxed);
        let result = {
            let mut request = self.claim(seq);
            request.reset(seq, roles);
            request.enqueued_at = Some(Instant::now());
            f(&mut request)
        };
        self.last_expanded.store(seq + 1, Ordering::Release);
        result
    }

    /// Run `f` on the oldest request awaiting its rollout, if any, and hand it back.
    pub fn with_rollout_slot<R>(
        &self,
        f: impl FnOnce(&mut RolloutRequest<S, M>) -> R,
    ) -> Option<R> {
        if !self.can_roll_out() {
            return None;
        }
        let seq = self.last_rolled_out.load(Ordering::Relaxed);
        let result = {
            let mut request = self.claim(seq);
            debug_assert_eq!(request.seq, seq);
            f(&mut request)
        };
        self.last_rolled_out.store(seq + 1, Ordering::Release);
        Some(result)
    }

    /// Run `f` on the oldest finished request, if any, and free its slot.
    pub fn with_back_propagate_slot<R>(
        &self,
        f: impl FnOnce(&mut RolloutRequest<S, M>) -> R,
    ) -> Option<R> {
        if !self.can_back_propagate() {
            return None;
        }
        let seq = self.last_back_propagated.load(Ordering::Relaxed);
        let result = {
            let mut request = self.claim(seq);
            debug_assert_eq!(request.seq, seq);
            f(&mut request)
        };
        self.last_back_propagated.store(seq + 1, Ordering::Release);
        Some(result)
    }
}

/// The tree thread's view of all shards.
///
/// Requests go to the next shard with a free slot and results are drained from the next shard
/// with ready output.  Both searches start one past the shard used last, so every shard gets its
/// turn.
pub struct Pipeline<S, M> {
    shards: Vec<Arc<PipelineShard<S, M>>>,
    roles: usize,
    next_expand: usize,
    next_drain: usize,
}

impl<S, M> fmt::Debug for Pipeline<S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("shards", &self.shards)
            .field("roles", &self.roles)
            .finish()
    }
}

impl<S, M> Pipeline<S, M> {
    /// `shard_count` shards of `capacity` slots each, for requests over `roles` roles.
    pub fn new(shard_count: usize, capacity: usize, roles: usize) -> Self {
        assert!(shard_count > 0, "a pipeline needs at least one shard");
        Self {
            shards: (0..shard_count)
                .map(|_| Arc::new(PipelineShard::new(capacity)))
                .collect(),
            roles,
            next_expand: 0,
            next_drain: 0,
        }
    }

    /// Number of shards, one per worker.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The shard at `index`, for handing to its worker.
    pub fn shard(&self, index: usize) -> Arc<PipelineShard<S, M>> {
        Arc::clone(&self.shards[index])
    }

    /// `true` if any shard has a free slot.
    pub fn can_expand(&self) -> bool {
        self.shards.iter().any(|s| s.can_expand())
    }

    /// `true` if any shard has a result ready.
    pub fn can_back_propagate(&self) -> bool {
        self.shards.iter().any(|s| s.can_back_propagate())
    }

    /// Requests published but not yet back-propagated, over all shards.
    pub fn in_flight(&self) -> u64 {
        self.shards.iter().map(|s| s.in_flight()).sum()
    }

    /// Fill in and publish a request on the next shard with room.  Returns `None` without
    /// calling `f` if every shard is full.
    pub fn submit<R>(&mut self, f: impl FnOnce(&mut RolloutRequest<S, M>) -> R) -> Option<R> {
        let n = self.shards.len();
        let i = (0..n)
            .map(|k| (self.next_expand + k) % n)
            .find(|&i| self.shards[i].can_expand())?;
        self.next_expand = (i + 1) % n;
        Some(self.shards[i].with_expand_slot(self.roles, f))
    }

    /// Consume one finished request from the next shard with ready output.
    pub fn drain_one<R>(&mut self, f: impl FnOnce(&mut RolloutRequest<S, M>) -> R) -> Option<R> {
        let n = self.shards.len();
        let i = (0..n)
            .map(|k| (self.next_drain + k) % n)
            .find(|&i| self.shards[i].can_back_propagate())?;
        self.next_drain = (i + 1) % n;
        self.shards[i].with_back_propagate_slot(f)
    }
}

/// Waits on a condition by spinning for a short while and then yielding the time slice.
#[derive(Debug)]
pub struct Backoff {
    spin_limit: Duration,
    started: Option<Instant>,
}

impl Backoff {
    /// Spin for `spin_limit` before yielding.
    pub fn new(spin_limit: Duration) -> Self {
        Self {
            spin_limit,
            started: None,
        }
    }

    /// Wait a little.  Call [`Backoff::reset`] once the awaited condition held.
    pub fn snooze(&mut self) {
        let started = *self.started.get_or_insert_with(Instant::now);
        if started.elapsed() < self.spin_limit {
            hint::spin_loop();
        } else {
            thread::yield_now();
        }
    }

    /// Start spinning again on the next wait.
    pub fn reset(&mut self) {
        self.started = None;
    }

    /// `true` once spinning has given way to yielding.
    pub fn is_yielding(&self) -> bool {
        self.started
            .map_or(false, |started| started.elapsed() >= self.spin_limit)
    }
}
