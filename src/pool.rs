//! A fixed-capacity arena of reusable objects addressed by generation-checked references.
//!
//! Every slot carries a generation that is bumped both when the slot is allocated and when it is
//! freed.  A [`SlotRef`] remembers the generation it was handed out with, so a reference to a
//! slot that has since been freed (and possibly reallocated) no longer resolves.  Generations
//! never wrap: a slot whose generation counter is used up is retired and never handed out again.
//! This lets the search graph hold plain integer handles to nodes that may be trimmed out from
//! under it without reference counting or locking.

use std::collections::VecDeque;
use std::fmt;

/// Objects stored in a [`SlotPool`] are constructed once and then recycled in place.
pub trait Reset: Default {
    /// Return the object to its default state, keeping any owned buffers for reuse.
    fn reset(&mut self);
}

/// A `(slot, generation)` reference into a [`SlotPool`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotRef {
    index: u32,
    generation: u32,
}

impl SlotRef {
    /// Slot index, shared by every generation of the slot.
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Generation the reference was handed out with.
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    live: bool,
    value: T,
}

impl<T> Slot<T> {
    /// Mark the slot free.  Returns `false` if no generation is left for another allocation.
    fn release(&mut self) -> bool {
        self.live = false;
        match self.generation.checked_add(1) {
            Some(g) if g < u32::MAX => {
                self.generation = g;
                true
            }
            _ => {
                self.generation = u32::MAX;
                false
            }
        }
    }
}

/// Counters describing the occupancy of a [`SlotPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Maximum number of live objects.
    pub capacity: usize,
    /// Live objects.
    pub in_use: usize,
    /// Objects constructed so far; never exceeds `capacity`.
    pub constructed: usize,
    /// Allocations since the pool was created.
    pub allocations: u64,
    /// Frees since the pool was created.
    pub frees: u64,
    /// Slots taken out of service because their generation counter ran out.
    pub retired: usize,
}

/// A fixed-capacity arena handing out [`SlotRef`]s.
///
/// Objects are constructed lazily up to the capacity and recycled in the order they were freed,
/// so a freed slot is reused as late as possible.
pub struct SlotPool<T> {
    slots: Vec<Slot<T>>,
    // oldest freed slot first
    free: VecDeque<u32>,
    capacity: usize,
    low_water_mark: usize,
    in_use: usize,
    retired: usize,
    allocations: u64,
    frees: u64,
}

impl<T: Reset> SlotPool<T> {
    /// An empty pool of `capacity` slots that reports itself near full once fewer than
    /// `low_water_mark` slots are free.
    pub fn new(capacity: usize, low_water_mark: usize) -> Self {
        assert!(capacity > 0, "pool capacity must be positive");
        assert!(
            capacity <= u32::MAX as usize,
            "pool capacity exceeds the reference index range"
        );
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
            capacity,
            low_water_mark,
            in_use: 0,
            retired: 0,
            allocations: 0,
            frees: 0,
        }
    }

    /// Allocate a slot and initialize it with `init`.
    ///
    /// A new object is constructed while the pool has never reached `capacity`; afterwards the
    /// oldest freed slot is reset and reused.
    ///
    /// # Panics
    ///
    /// Panics if the pool is full.  Callers are expected to watch [`SlotPool::is_near_full`] and
    /// free slots before this can happen.
    pub fn allocate(&mut self, init: impl FnOnce(&mut T)) -> SlotRef {
        let index = if self.slots.len() < self.capacity {
            self.slots.push(Slot {
                generation: 0,
                live: false,
                value: T::default(),
            });
            self.slots.len() - 1
        } else {
            match self.free.pop_front() {
                Some(index) => index as usize,
                None => panic!(
                    "slot pool exhausted: {} of {} slots in use",
                    self.in_use, self.capacity
                ),
            }
        };

        let slot = &mut self.slots[index];
        debug_assert!(!slot.live, "allocating a live slot");
        // a free slot always has a generation left, see `Slot::release`
        slot.generation += 1;
        slot.live = true;
        slot.value.reset();
        init(&mut slot.value);

        self.in_use += 1;
        self.allocations += 1;

        SlotRef {
            index: index as u32,
            generation: slot.generation,
        }
    }

    /// Return a slot to the free list, invalidating every outstanding reference to it.
    ///
    /// Freeing a reference that is already stale is a no-op and returns `false`.
    pub fn free(&mut self, r: SlotRef) -> bool {
        match self.slots.get_mut(r.index()) {
            Some(slot) if slot.live && slot.generation == r.generation => {
                if slot.release() {
                    self.free.push_back(r.index);
                } else {
                    self.retired += 1;
                }
                self.in_use -= 1;
                self.frees += 1;
                true
            }
            _ => false,
        }
    }

    /// The object behind `r`, or `None` if `r` is stale.
    pub fn get(&self, r: SlotRef) -> Option<&T> {
        match self.slots.get(r.index()) {
            Some(slot) if slot.live && slot.generation == r.generation => Some(&slot.value),
            _ => None,
        }
    }

    /// The object behind `r`, or `None` if `r` is stale.
    pub fn get_mut(&mut self, r: SlotRef) -> Option<&mut T> {
        match self.slots.get_mut(r.index()) {
            Some(slot) if slot.live && slot.generation == r.generation => Some(&mut slot.value),
            _ => None,
        }
    }

    /// `true` if `r` still refers to a live object.
    pub fn is_live(&self, r: SlotRef) -> bool {
        self.get(r).is_some()
    }

    /// `true` once fewer than the low-water mark of slots remain available.
    pub fn is_near_full(&self) -> bool {
        self.capacity() - self.in_use < self.low_water_mark
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.in_use
    }

    /// `true` if no object is live.
    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    /// Maximum number of live objects, excluding retired slots.
    pub fn capacity(&self) -> usize {
        self.capacity - self.retired
    }

    /// Free every live slot.
    pub fn clear(&mut self) {
        self.clear_where(|_, _| true);
    }

    /// Free every live slot for which `filter` returns `true`.  Returns the number of slots
    /// freed.
    pub fn clear_where(&mut self, mut filter: impl FnMut(SlotRef, &T) -> bool) -> usize {
        let mut n_freed = 0;
        let mut n_retired = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !slot.live {
                continue;
            }
            let r = SlotRef {
                index: index as u32,
                generation: slot.generation,
            };
            if filter(r, &slot.value) {
                if slot.release() {
                    self.free.push_back(index as u32);
                } else {
                    n_retired += 1;
                }
                n_freed += 1;
            }
        }
        self.retired += n_retired;
        self.in_use -= n_freed;
        self.frees += n_freed as u64;
        n_freed
    }

    /// Iterate over the references of all live slots.
    pub fn live_refs(&self) -> impl Iterator<Item = SlotRef> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.live)
            .map(|(index, slot)| SlotRef {
                index: index as u32,
                generation: slot.generation,
            })
    }

    /// Occupancy counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            in_use: self.in_use,
            constructed: self.slots.len(),
            allocations: self.allocations,
            frees: self.frees,
            retired: self.retired,
        }
    }
}

impl<T> fmt::Debug for SlotPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPool")
            .field("capacity", &self.capacity)
            .field("in_use", &self.in_use)
            .field("constructed", &self.slots.len())
            .finish()
    }
}
