//! Lock and replication counters.
//!
//! Counters are bumped with relaxed atomics on the hot path and read back as
//! serializable snapshots for the management layer.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct ElementStats {
    pub locks_requested: AtomicU64,
    pub locks_granted: AtomicU64,
    pub unlocks: AtomicU64,
    pub peer_collisions: AtomicU64,
    pub deadlocks_broken: AtomicU64,
    pub peer_requests_sent: AtomicU64,
    pub peer_requests_received: AtomicU64,
    pub grants_sent: AtomicU64,
    pub grants_received: AtomicU64,
    pub releases_sent: AtomicU64,
    pub aborts: AtomicU64,
    pub cancels: AtomicU64,
    pub nonpaged_updates: AtomicU64,
    pub nonpaged_received: AtomicU64,
    pub truncated_updates: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl ElementStats {
    pub fn inc_lock_requested(&self) {
        bump(&self.locks_requested);
    }

    pub fn inc_granted(&self) {
        bump(&self.locks_granted);
    }

    pub fn inc_unlock(&self) {
        bump(&self.unlocks);
    }

    pub fn inc_collision(&self) {
        bump(&self.peer_collisions);
    }

    pub fn add_deadlocks(&self, count: usize) {
        self.deadlocks_broken
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn inc_request_sent(&self) {
        bump(&self.peer_requests_sent);
    }

    pub fn inc_request_received(&self) {
        bump(&self.peer_requests_received);
    }

    pub fn inc_grant_sent(&self) {
        bump(&self.grants_sent);
    }

    pub fn inc_grant_received(&self) {
        bump(&self.grants_received);
    }

    pub fn inc_release_sent(&self) {
        bump(&self.releases_sent);
    }

    pub fn inc_abort(&self) {
        bump(&self.aborts);
    }

    pub fn inc_cancel(&self) {
        bump(&self.cancels);
    }

    pub fn inc_nonpaged_update(&self) {
        bump(&self.nonpaged_updates);
    }

    pub fn inc_nonpaged_received(&self) {
        bump(&self.nonpaged_received);
    }

    pub fn inc_truncated(&self) {
        bump(&self.truncated_updates);
    }

    pub fn snapshot(&self) -> ElementStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ElementStatsSnapshot {
            locks_requested: get(&self.locks_requested),
            locks_granted: get(&self.locks_granted),
            unlocks: get(&self.unlocks),
            peer_collisions: get(&self.peer_collisions),
            deadlocks_broken: get(&self.deadlocks_broken),
            peer_requests_sent: get(&self.peer_requests_sent),
            peer_requests_received: get(&self.peer_requests_received),
            grants_sent: get(&self.grants_sent),
            grants_received: get(&self.grants_received),
            releases_sent: get(&self.releases_sent),
            aborts: get(&self.aborts),
            cancels: get(&self.cancels),
            nonpaged_updates: get(&self.nonpaged_updates),
            nonpaged_received: get(&self.nonpaged_received),
            truncated_updates: get(&self.truncated_updates),
        }
    }
}

/// Point-in-time copy of [`ElementStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementStatsSnapshot {
    pub locks_requested: u64,
    pub locks_granted: u64,
    pub unlocks: u64,
    pub peer_collisions: u64,
    pub deadlocks_broken: u64,
    pub peer_requests_sent: u64,
    pub peer_requests_received: u64,
    pub grants_sent: u64,
    pub grants_received: u64,
    pub releases_sent: u64,
    pub aborts: u64,
    pub cancels: u64,
    pub nonpaged_updates: u64,
    pub nonpaged_received: u64,
    pub truncated_updates: u64,
}

#[derive(Default)]
pub struct DomainStats {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub send_failures: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub blobs_dispatched: AtomicU64,
    pub peer_lost_events: AtomicU64,
}

impl DomainStats {
    pub fn inc_sent(&self) {
        bump(&self.messages_sent);
    }

    pub fn inc_received(&self) {
        bump(&self.messages_received);
    }

    pub fn inc_send_failure(&self) {
        bump(&self.send_failures);
    }

    pub fn inc_protocol_error(&self) {
        bump(&self.protocol_errors);
    }

    pub fn inc_blob_dispatched(&self) {
        bump(&self.blobs_dispatched);
    }

    pub fn inc_peer_lost(&self) {
        bump(&self.peer_lost_events);
    }
}

/// Point-in-time domain counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainStatsSnapshot {
    pub elements: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub send_failures: u64,
    pub protocol_errors: u64,
    pub blobs_dispatched: u64,
    pub peer_lost_events: u64,
    pub shadow_pool_capacity: usize,
    pub shadow_pool_allocated: usize,
    pub shadow_pool_exhausted: u64,
}
