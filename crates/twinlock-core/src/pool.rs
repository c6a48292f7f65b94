//! Bounded pool of shadow requests shared by every element in a domain.
//!
//! A shadow stands for one cross-node exchange: an outgoing request awaiting a
//! grant, an incoming peer request, or a grant on its way out. Permits return
//! their slot when dropped.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

struct PoolState {
    free: Vec<u32>,
    allocated: usize,
}

struct PoolInner {
    capacity: usize,
    state: Mutex<PoolState>,
    exhausted: AtomicU64,
}

/// Fixed-size shadow-request pool.
#[derive(Clone)]
pub struct ShadowPool {
    inner: Arc<PoolInner>,
}

impl ShadowPool {
    /// Creates a pool with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        let free = (0..capacity as u32).rev().collect();
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                state: Mutex::new(PoolState { free, allocated: 0 }),
                exhausted: AtomicU64::new(0),
            }),
        }
    }

    /// Takes a slot, or returns `None` when the pool is empty.
    pub fn acquire(&self) -> Option<ShadowPermit> {
        let mut state = self.inner.state.lock();
        match state.free.pop() {
            Some(slot) => {
                state.allocated += 1;
                Some(ShadowPermit {
                    pool: Arc::clone(&self.inner),
                    slot,
                })
            }
            None => {
                drop(state);
                self.inner.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!("shadow pool exhausted ({} slots)", self.inner.capacity);
                None
            }
        }
    }

    /// Total slots.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.inner.state.lock().free.len()
    }

    /// Slots currently handed out.
    pub fn allocated(&self) -> usize {
        self.inner.state.lock().allocated
    }

    /// `(allocated, free)` read under one lock.
    pub fn snapshot(&self) -> (usize, usize) {
        let state = self.inner.state.lock();
        (state.allocated, state.free.len())
    }

    /// Times `acquire` found the pool empty.
    pub fn exhaustion_count(&self) -> u64 {
        self.inner.exhausted.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ShadowPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (allocated, free) = self.snapshot();
        f.debug_struct("ShadowPool")
            .field("capacity", &self.inner.capacity)
            .field("allocated", &allocated)
            .field("free", &free)
            .finish()
    }
}

/// Ownership of one pool slot.
pub struct ShadowPermit {
    pool: Arc<PoolInner>,
    slot: u32,
}

impl ShadowPermit {
    /// Slot index.
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

impl fmt::Debug for ShadowPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShadowPermit({})", self.slot)
    }
}

impl Drop for ShadowPermit {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.free.push(self.slot);
        state.allocated -= 1;
    }
}
