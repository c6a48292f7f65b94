//! Sharded stripe-lock table.
//!
//! Stripes are grouped into slices of `stripes_per_slice`; each slice hashes
//! to one shard whose mutex guards the queue and every request rooted there.
//! A request spanning slices merges all shards into the global entry until
//! the last such request is released.
//!
//! Lock order: a shard, then the global entry. Whole-table operations take
//! every shard in index order, then the global entry.

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use tracing::debug;
use twinlock_cmi::StripeRegion;

use crate::flags::ElementAttributes;
use crate::request::{LockRequest, RequestId};

/// One independently locked queue and the requests it owns.
#[derive(Debug, Default)]
pub(crate) struct SliceEntry {
    /// Top-level requests in grant order.
    pub queue: Vec<RequestId>,
    /// Every request on this entry, top-level or waiting.
    pub requests: HashMap<RequestId, LockRequest>,
}

impl SliceEntry {
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.requests.is_empty()
    }

    /// Removes a top-level request and every request waiting on it,
    /// depth first.
    fn take_tree(&mut self, root: RequestId) -> Vec<LockRequest> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(req) = self.requests.remove(&id) {
                stack.extend(req.wait_queue.iter().copied());
                out.push(req);
            }
        }
        out
    }
}

/// Ownership of a slice between the two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SliceState {
    /// This node may read and write without asking.
    ExclusiveLocal,
    /// Both nodes may read; writes need the peer.
    Shared,
    /// The peer owns the slice.
    ExclusivePeer,
}

/// Per-slice ownership over the full stripe space.
///
/// Stored as breakpoints: the state of slice `s` is the value at the greatest
/// key not above `s`. Key zero is always present.
#[derive(Debug, Clone)]
pub(crate) struct SliceStateMap {
    points: BTreeMap<u64, SliceState>,
}

impl SliceStateMap {
    pub fn new(initial: SliceState) -> Self {
        let mut points = BTreeMap::new();
        points.insert(0, initial);
        Self { points }
    }

    pub fn reset(&mut self, state: SliceState) {
        self.points.clear();
        self.points.insert(0, state);
    }

    pub fn state_at(&self, slice: u64) -> SliceState {
        self.points
            .range(..=slice)
            .next_back()
            .map(|(_, state)| *state)
            .unwrap_or(SliceState::ExclusiveLocal)
    }

    /// States present anywhere in `[first, last]`.
    pub fn states_in(&self, first: u64, last: u64) -> Vec<SliceState> {
        let mut out = vec![self.state_at(first)];
        if first < last {
            out.extend(self.points.range(first + 1..=last).map(|(_, s)| *s));
        }
        out
    }

    /// Applies `f` to every slice in `[first, last]`.
    pub fn update(&mut self, first: u64, last: u64, f: impl Fn(SliceState) -> SliceState) {
        if first > last {
            return;
        }
        if let Some(after) = last.checked_add(1) {
            let state = self.state_at(after);
            self.points.insert(after, state);
        }
        let state = self.state_at(first);
        self.points.insert(first, state);
        for state in self.points.range_mut(first..=last).map(|(_, s)| s) {
            *state = f(*state);
        }
        self.coalesce(first, last);
    }

    pub fn assign(&mut self, first: u64, last: u64, state: SliceState) {
        self.update(first, last, |_| state);
    }

    fn coalesce(&mut self, first: u64, last: u64) {
        let lo = first.saturating_sub(1);
        let hi = last.saturating_add(1);
        let keys: Vec<u64> = self.points.range(lo..=hi).map(|(k, _)| *k).collect();
        let mut prev = if lo == 0 { None } else { Some(self.state_at(lo - 1)) };
        for key in keys {
            let Some(&state) = self.points.get(&key) else {
                continue;
            };
            if key != 0 && prev == Some(state) {
                self.points.remove(&key);
            } else {
                prev = Some(state);
            }
        }
    }

    #[cfg(test)]
    pub fn breakpoints(&self) -> usize {
        self.points.len()
    }
}

/// Guard over the entry a stripe currently maps to.
pub(crate) enum EntryGuard<'a> {
    Shard(MutexGuard<'a, SliceEntry>),
    Global {
        _shard: MutexGuard<'a, SliceEntry>,
        global: MutexGuard<'a, SliceEntry>,
    },
}

impl Deref for EntryGuard<'_> {
    type Target = SliceEntry;

    fn deref(&self) -> &SliceEntry {
        match self {
            EntryGuard::Shard(guard) => guard,
            EntryGuard::Global { global, .. } => global,
        }
    }
}

impl DerefMut for EntryGuard<'_> {
    fn deref_mut(&mut self) -> &mut SliceEntry {
        match self {
            EntryGuard::Shard(guard) => guard,
            EntryGuard::Global { global, .. } => global,
        }
    }
}

/// Guard over every shard and the global entry.
pub(crate) struct TableGuard<'a> {
    pub shards: Vec<MutexGuard<'a, SliceEntry>>,
    pub global: MutexGuard<'a, SliceEntry>,
}

impl TableGuard<'_> {
    /// Every entry, shards first.
    pub fn entries_mut(&mut self) -> Vec<&mut SliceEntry> {
        let mut out: Vec<&mut SliceEntry> = self.shards.iter_mut().map(|g| &mut **g).collect();
        out.push(&mut *self.global);
        out
    }

    pub fn request_count(&self) -> usize {
        self.shards.iter().map(|g| g.requests.len()).sum::<usize>() + self.global.requests.len()
    }
}

/// Sharded lock table of one element.
pub(crate) struct SliceTable {
    shards: Vec<Mutex<SliceEntry>>,
    global: Mutex<SliceEntry>,
    stripes_per_slice: u64,
    slots: Mutex<SliceStateMap>,
}

impl SliceTable {
    pub fn new(table_size: usize, stripes_per_slice: u64, initial: SliceState) -> Self {
        Self {
            shards: (0..table_size.max(1)).map(|_| Mutex::new(SliceEntry::default())).collect(),
            global: Mutex::new(SliceEntry::default()),
            stripes_per_slice: stripes_per_slice.max(1),
            slots: Mutex::new(SliceStateMap::new(initial)),
        }
    }

    pub fn slice_of(&self, stripe: u64) -> u64 {
        stripe / self.stripes_per_slice
    }

    pub fn spans_slices(&self, region: &StripeRegion) -> bool {
        self.slice_of(region.first) != self.slice_of(region.last)
    }

    /// Expands `region` outward to whole slices.
    pub fn expand_to_slices(&self, region: &StripeRegion) -> StripeRegion {
        let first = self.slice_of(region.first) * self.stripes_per_slice;
        let last = (self.slice_of(region.last) + 1)
            .saturating_mul(self.stripes_per_slice)
            .saturating_sub(1)
            .min(u64::MAX - 1);
        StripeRegion::new(first, last)
    }

    fn shard_index(&self, stripe: u64) -> usize {
        (self.slice_of(stripe) % self.shards.len() as u64) as usize
    }

    /// Locks the entry `stripe` currently maps to.
    ///
    /// The hash-disabled bit only changes under [`SliceTable::lock_all`], so
    /// reading it while holding the shard is stable.
    pub fn entry(&self, stripe: u64, attrs: &ElementAttributes) -> EntryGuard<'_> {
        let shard = self.shards[self.shard_index(stripe)].lock();
        if attrs.is_hash_disabled() {
            EntryGuard::Global {
                _shard: shard,
                global: self.global.lock(),
            }
        } else {
            EntryGuard::Shard(shard)
        }
    }

    pub fn lock_all(&self) -> TableGuard<'_> {
        let shards = self.shards.iter().map(|m| m.lock()).collect();
        TableGuard {
            shards,
            global: self.global.lock(),
        }
    }

    /// Runs `f` on each entry in turn, holding one lock at a time.
    pub fn for_each_entry(&self, mut f: impl FnMut(&mut SliceEntry)) {
        for shard in &self.shards {
            f(&mut shard.lock());
        }
        f(&mut self.global.lock());
    }

    /// Merges every shard into the global entry.
    ///
    /// Slices end up highest first, as a shard queue holds them; roots of the
    /// same slice keep their shard order. The caller sets the hash-disabled
    /// attribute while still holding `guard`.
    pub fn disable_hash(&self, guard: &mut TableGuard<'_>) {
        let mut roots: Vec<(u64, Vec<LockRequest>)> = Vec::new();
        for shard in guard.shards.iter_mut() {
            let queue = std::mem::take(&mut shard.queue);
            for root in queue {
                let slice = shard.requests.get(&root).map(|r| self.slice_of(r.stripe.first));
                let tree = shard.take_tree(root);
                if let Some(slice) = slice {
                    roots.push((slice, tree));
                }
            }
            shard.requests.clear();
        }
        roots.sort_by_key(|(slice, _)| Reverse(*slice));
        let moved = roots.len();
        for (_, tree) in roots {
            if let Some(root) = tree.first() {
                guard.global.queue.push(root.id);
            }
            for req in tree {
                guard.global.requests.insert(req.id, req);
            }
        }
        debug!(moved, "stripe lock hash disabled");
    }

    /// Moves every tree from the global entry back to the shard its root
    /// maps to. The caller clears the hash-disabled attribute while still
    /// holding `guard`.
    pub fn enable_hash(&self, guard: &mut TableGuard<'_>) {
        let queue = std::mem::take(&mut guard.global.queue);
        let moved = queue.len();
        for root in queue {
            let Some(first) = guard.global.requests.get(&root).map(|r| r.stripe.first) else {
                continue;
            };
            let tree = guard.global.take_tree(root);
            let shard = &mut guard.shards[self.shard_index(first)];
            shard.queue.push(root);
            for req in tree {
                shard.requests.insert(req.id, req);
            }
        }
        debug!(moved, "stripe lock hash enabled");
    }

    pub fn slice_states(&self, region: &StripeRegion) -> Vec<SliceState> {
        self.slots
            .lock()
            .states_in(self.slice_of(region.first), self.slice_of(region.last))
    }

    pub fn update_slices(
        &self,
        region: &StripeRegion,
        f: impl Fn(SliceState) -> SliceState,
    ) {
        self.slots
            .lock()
            .update(self.slice_of(region.first), self.slice_of(region.last), f);
    }

    pub fn reset_slices(&self, state: SliceState) {
        self.slots.lock().reset(state);
    }

    pub fn slice_state(&self, stripe: u64) -> SliceState {
        self.slots.lock().state_at(self.slice_of(stripe))
    }
}

/// Collects every request id on `queue` and, recursively, their waiters.
pub(crate) fn collect_tree(entry: &SliceEntry, roots: &[RequestId]) -> Vec<RequestId> {
    let mut out = Vec::new();
    let mut pending: VecDeque<RequestId> = roots.iter().copied().collect();
    while let Some(id) = pending.pop_front() {
        if let Some(req) = entry.requests.get(&id) {
            pending.extend(req.wait_queue.iter().copied());
            out.push(id);
        }
    }
    out
}
