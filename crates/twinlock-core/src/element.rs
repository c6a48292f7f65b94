//! Per-object control block.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use twinlock_cmi::{ElementHandle, ObjectId};

use crate::blob::PeerBlob;
use crate::config::{DomainConfig, ElementConfig};
use crate::flags::ElementAttributes;
use crate::pool::ShadowPermit;
use crate::request::RequestId;
use crate::slice::{SliceState, SliceTable};
use crate::stats::ElementStats;

/// Role of this node for an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ElementState {
    /// Not yet assigned.
    #[default]
    Invalid,
    /// Authoritative side.
    Active,
    /// Mirror side.
    Passive,
}

impl ElementState {
    /// Slice ownership assumed before any exchange with the peer.
    pub fn initial_slice_state(&self) -> SliceState {
        match self {
            ElementState::Passive => SliceState::ExclusivePeer,
            ElementState::Active | ElementState::Invalid => SliceState::ExclusiveLocal,
        }
    }
}

/// Non-paged record and its replication bookkeeping.
#[derive(Debug)]
pub(crate) struct NonpagedRecord {
    pub data: Vec<u8>,
    /// Last sequence number stamped on an outgoing update.
    pub seq_number: u64,
    /// Last sequence number received from the peer.
    pub peer_seq_number: u64,
}

pub(crate) struct MetadataElement {
    handle: ElementHandle,
    config: ElementConfig,
    state: RwLock<ElementState>,
    peer_handle: Mutex<ElementHandle>,
    pub attributes: ElementAttributes,
    pub table: SliceTable,
    pub blob: PeerBlob,
    large_io_count: AtomicU32,
    /// Shadows of local requests sent to the peer and not yet answered.
    pub awaiting: Mutex<HashMap<RequestId, ShadowPermit>>,
    pub nonpaged: Mutex<NonpagedRecord>,
    memory: Mutex<Vec<u8>>,
    peer_memory: Mutex<Vec<u8>>,
    pub stats: ElementStats,
}

impl MetadataElement {
    pub fn new(handle: ElementHandle, config: ElementConfig, domain: &DomainConfig) -> Self {
        let state = ElementState::Invalid;
        Self {
            handle,
            table: SliceTable::new(
                domain.slice_table_size,
                domain.stripes_per_slice,
                state.initial_slice_state(),
            ),
            state: RwLock::new(state),
            peer_handle: Mutex::new(ElementHandle::NULL),
            attributes: ElementAttributes::new(),
            blob: PeerBlob::new(),
            large_io_count: AtomicU32::new(0),
            awaiting: Mutex::new(HashMap::new()),
            nonpaged: Mutex::new(NonpagedRecord {
                data: vec![0; config.nonpaged_size],
                seq_number: 0,
                peer_seq_number: 0,
            }),
            memory: Mutex::new(vec![0; config.memory_size]),
            peer_memory: Mutex::new(vec![0; config.memory_size]),
            stats: ElementStats::default(),
            config,
        }
    }

    pub fn handle(&self) -> ElementHandle {
        self.handle
    }

    pub fn object_id(&self) -> ObjectId {
        self.config.object_id
    }

    pub fn config(&self) -> &ElementConfig {
        &self.config
    }

    pub fn state(&self) -> ElementState {
        *self.state.read()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ElementState::Active
    }

    /// Switches role; slice ownership restarts from the new role's default.
    /// Returns false if the state did not change.
    pub fn set_state(&self, state: ElementState) -> bool {
        let mut current = self.state.write();
        if *current == state {
            return false;
        }
        *current = state;
        self.table.reset_slices(state.initial_slice_state());
        true
    }

    pub fn peer_handle(&self) -> ElementHandle {
        *self.peer_handle.lock()
    }

    /// Records the peer's handle; returns the previous one.
    pub fn set_peer_handle(&self, handle: ElementHandle) -> ElementHandle {
        std::mem::replace(&mut *self.peer_handle.lock(), handle)
    }

    pub fn large_io_count(&self) -> u32 {
        self.large_io_count.load(Ordering::Acquire)
    }

    pub fn inc_large(&self) {
        self.large_io_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the count after the decrement.
    pub fn dec_large(&self) -> u32 {
        let prev = self
            .large_io_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn memory(&self) -> Vec<u8> {
        self.memory.lock().clone()
    }

    pub fn peer_memory(&self) -> Vec<u8> {
        self.peer_memory.lock().clone()
    }

    /// Copies `data` into the local block; returns the bytes stored.
    pub fn store_memory(&self, data: &[u8]) -> usize {
        copy_clamped(&mut self.memory.lock(), data)
    }

    /// Copies `data` into the peer mirror; returns the bytes stored.
    pub fn store_peer_memory(&self, data: &[u8]) -> usize {
        copy_clamped(&mut self.peer_memory.lock(), data)
    }

    pub fn clear_peer_memory(&self) {
        self.peer_memory.lock().fill(0);
    }
}

fn copy_clamped(dest: &mut [u8], data: &[u8]) -> usize {
    let n = data.len().min(dest.len());
    dest[..n].copy_from_slice(&data[..n]);
    n
}
