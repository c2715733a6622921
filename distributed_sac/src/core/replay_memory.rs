//! Bounded replay memory with uniform sampling.
//!
//! ```text
//! relay intake ─┐                                    ┌─> Learner
//! local worker ─┼─> append ─> [ ring | cursor ] ─────┤   (sample_blocking)
//! relay intake ─┘             Mutex + Condvar        └─> checkpoint / tests
//! ```
//!
//! Writes go through one mutex that guards both the write cursor and the
//! stored length, so concurrent producers never lose an update. Once the
//! memory is full the write cursor wraps and the oldest slot is overwritten.
//! Sampling draws indices uniformly with replacement from `0..len`, so it can
//! never reach a slot that was not written.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::transition::Transition;

/// How often a blocked sampler re-checks its shutdown flag.
const WAIT_SLICE: Duration = Duration::from_millis(50);

struct Ring {
    slots: Vec<Transition>,
    cursor: usize,
    rng: fastrand::Rng,
}

impl Ring {
    fn push(&mut self, capacity: usize, item: Transition) {
        if self.slots.len() < capacity {
            self.slots.push(item);
        } else {
            self.slots[self.cursor] = item;
        }
        self.cursor = (self.cursor + 1) % capacity;
    }
}

/// Thread-shared ring buffer of transitions.
pub struct ReplayMemory {
    ring: Mutex<Ring>,
    grown: Condvar,
    capacity: usize,
}

/// Replay memory shared between the intake path and the learner.
pub type SharedReplayMemory = Arc<ReplayMemory>;

impl ReplayMemory {
    /// Create an empty memory. A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self::with_rng(capacity, fastrand::Rng::new())
    }

    /// Create an empty memory whose sampling sequence is reproducible.
    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        Self::with_rng(capacity, fastrand::Rng::with_seed(seed))
    }

    fn with_rng(capacity: usize, rng: fastrand::Rng) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                slots: Vec::with_capacity(capacity.min(1 << 16)),
                cursor: 0,
                rng,
            }),
            grown: Condvar::new(),
            capacity,
        }
    }

    /// Maximum number of stored transitions.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored transitions (never above capacity).
    pub fn len(&self) -> usize {
        self.ring.lock().slots.len()
    }

    /// True when nothing has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store one transition, overwriting the oldest once full.
    pub fn append(&self, transition: Transition) {
        self.ring.lock().push(self.capacity, transition);
        self.grown.notify_all();
    }

    /// Store a batch of transitions under a single lock acquisition.
    ///
    /// Order within the batch is preserved.
    pub fn extend<I>(&self, transitions: I)
    where
        I: IntoIterator<Item = Transition>,
    {
        {
            let mut ring = self.ring.lock();
            for t in transitions {
                ring.push(self.capacity, t);
            }
        }
        self.grown.notify_all();
    }

    /// Uniformly sample `batch_size` transitions with replacement.
    ///
    /// Returns `None` while fewer than `batch_size` transitions are stored.
    pub fn sample(&self, batch_size: usize) -> Option<Vec<Transition>> {
        let mut ring = self.ring.lock();
        Self::draw(&mut ring, batch_size)
    }

    /// Block until at least `min_len` transitions are stored.
    ///
    /// Returns `false` if `shutdown` was raised while waiting.
    pub fn wait_for_len(&self, min_len: usize, shutdown: &AtomicBool) -> bool {
        let mut ring = self.ring.lock();
        while ring.slots.len() < min_len {
            if shutdown.load(Ordering::Relaxed) {
                return false;
            }
            self.grown.wait_for(&mut ring, WAIT_SLICE);
        }
        true
    }

    /// Block until a batch can be drawn, then draw it.
    ///
    /// Returns `None` only if `shutdown` was raised while waiting.
    pub fn sample_blocking(&self, batch_size: usize, shutdown: &AtomicBool) -> Option<Vec<Transition>> {
        let mut ring = self.ring.lock();
        loop {
            if let Some(batch) = Self::draw(&mut ring, batch_size) {
                return Some(batch);
            }
            if shutdown.load(Ordering::Relaxed) {
                return None;
            }
            self.grown.wait_for(&mut ring, WAIT_SLICE);
        }
    }

    /// Every stored transition, oldest first.
    pub fn retained(&self) -> Vec<Transition> {
        let ring = self.ring.lock();
        if ring.slots.len() < self.capacity {
            ring.slots.clone()
        } else {
            let (newer, older) = ring.slots.split_at(ring.cursor);
            older.iter().chain(newer).cloned().collect()
        }
    }

    fn draw(ring: &mut Ring, batch_size: usize) -> Option<Vec<Transition>> {
        let len = ring.slots.len();
        if len < batch_size {
            return None;
        }
        let mut batch = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let idx = ring.rng.usize(..len);
            batch.push(ring.slots[idx].clone());
        }
        Some(batch)
    }
}


#[cfg(test)]
mod proptest_memory {
    use super::*;
    use crate::core::observation::Observation;
    use proptest::prelude::*;

    fn numbered(i: usize) -> Transition {
        Transition::new(
            Observation::vector(vec![0.0]),
            vec![0.0],
            i as f32,
            Observation::vector(vec![0.0]),
            false,
        )
    }

    proptest! {
        /// Property: size never exceeds capacity and exactly the newest entries survive
        #[test]
        fn test_ring_keeps_newest(capacity in 1usize..32, inserted in 0usize..100) {
            let memory = ReplayMemory::with_seed(capacity, 0);
            memory.extend((0..inserted).map(numbered));

            prop_assert!(memory.len() <= capacity);
            prop_assert_eq!(memory.len(), inserted.min(capacity));

            let kept: Vec<usize> = memory.retained().iter().map(|t| t.reward as usize).collect();
            let expected: Vec<usize> = (inserted.saturating_sub(capacity)..inserted).collect();
            prop_assert_eq!(kept, expected);
        }

        /// Property: samples only ever contain retained entries
        #[test]
        fn test_samples_come_from_retained(
            capacity in 1usize..32,
            inserted in 1usize..100,
            seed in any::<u64>(),
        ) {
            let memory = ReplayMemory::with_seed(capacity, seed);
            memory.extend((0..inserted).map(numbered));
            let oldest = inserted.saturating_sub(capacity);

            let batch = memory.sample(memory.len()).unwrap();
            for t in batch {
                let i = t.reward as usize;
                prop_assert!(i >= oldest && i < inserted, "sampled {} outside {}..{}", i, oldest, inserted);
            }
        }
    }
}
