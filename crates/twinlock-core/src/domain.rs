//! Lock domain: the context object owning everything shared across elements.
//!
//! A domain owns the element registry, the shadow pool, the blob queue and
//! its worker thread, and the transport. Several domains can coexist in one
//! process, which is how two-node scenarios run in tests.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use twinlock_cmi::{
    CmiClient, CmiMessage, CmiTransport, ElementHandle, MessageBody, MessageHeader, RequestToken,
    SendToken, StripeRegion,
};

use crate::completion::Completer;
use crate::config::{DomainConfig, ElementConfig};
use crate::element::{ElementState, MetadataElement};
use crate::error::{MetadataError, MetadataResult};
use crate::flags::ElementAttr;
use crate::nonpaged::ReplicationOutcome;
use crate::pool::{ShadowPermit, ShadowPool};
use crate::registry::Registry;
use crate::request::{LockStatus, RequestId};
use crate::slice::SliceState;
use crate::stats::{DomainStats, DomainStatsSnapshot, ElementStatsSnapshot};
use crate::worker::{self, BlobQueue};

/// What to do when a send's delivery outcome comes back.
pub(crate) enum InFlight {
    /// Outgoing lock request; the shadow stays reserved until answered.
    Request {
        element: ElementHandle,
        request: RequestToken,
        permit: ShadowPermit,
    },
    /// Grant whose shadow is freed once the message is out.
    Grant { permit: Option<ShadowPermit> },
    /// Need-release grant; the shadow stays queued until the peer releases
    /// it, or is dropped here if the grant never arrives.
    HeldGrant {
        element: ElementHandle,
        grant: RequestToken,
    },
    /// Release that completes an unlock once transmitted.
    Release { completer: Completer<LockStatus> },
    /// Non-paged update that completes its caller on transmit.
    Nonpaged {
        completer: Option<Completer<ReplicationOutcome>>,
    },
    /// Nothing waits on this message.
    Control,
}

/// Shared context for a set of metadata elements on one node.
pub struct LockDomain {
    pub(crate) config: DomainConfig,
    pub(crate) registry: Registry,
    pub(crate) pool: ShadowPool,
    pub(crate) blobs: Arc<BlobQueue>,
    transport: RwLock<Option<Arc<dyn CmiTransport>>>,
    in_flight: Mutex<HashMap<SendToken, InFlight>>,
    next_token: AtomicU64,
    next_request: AtomicU64,
    pub(crate) stats: DomainStats,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl LockDomain {
    /// Creates a domain. The worker thread is not started; call
    /// [`LockDomain::start_worker`] or drive it with [`LockDomain::run_worker`].
    pub fn new(config: DomainConfig) -> MetadataResult<Arc<Self>> {
        config.validate()?;
        let pool = ShadowPool::new(config.shadow_pool_size());
        info!(
            shadow_pool = pool.capacity(),
            shards = config.slice_table_size,
            "lock domain created"
        );
        Ok(Arc::new(Self {
            config,
            registry: Registry::new(),
            pool,
            blobs: Arc::new(BlobQueue::new()),
            transport: RwLock::new(None),
            in_flight: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
            stats: DomainStats::default(),
            worker: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    /// Starts the background blob dispatcher.
    pub fn start_worker(self: &Arc<Self>) -> MetadataResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let handle = worker::spawn(
            Arc::downgrade(self),
            Arc::clone(&self.blobs),
            Duration::from_millis(self.config.worker_idle_timeout_ms),
        )
        .map_err(|e| MetadataError::InvalidConfig(format!("cannot spawn worker: {}", e)))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stops the worker and refuses new lock requests.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.blobs.stop();
        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                warn!("blob worker panicked");
            }
        }
        info!("lock domain stopped");
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Installs the transport used to reach the peer.
    pub fn attach_transport(&self, transport: Arc<dyn CmiTransport>) {
        *self.transport.write() = Some(transport);
    }

    /// Removes the transport; every element then behaves as if alone.
    pub fn detach_transport(&self) {
        *self.transport.write() = None;
    }

    /// Receiver half to hand to the transport.
    pub fn cmi_client(self: &Arc<Self>) -> Weak<dyn CmiClient> {
        let weak: Weak<LockDomain> = Arc::downgrade(self);
        weak
    }

    pub(crate) fn transport(&self) -> Option<Arc<dyn CmiTransport>> {
        self.transport.read().clone()
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    /// True when lock traffic for `el` can reach the peer.
    pub(crate) fn peer_alive(&self, el: &MetadataElement) -> bool {
        !el.attributes
            .intersects(ElementAttr::PEER_DEAD | ElementAttr::CMI_DISABLED)
            && el.blob.is_started()
            && self.transport().is_some_and(|t| t.is_peer_alive())
    }

    /// True when metadata updates for `el` should be mirrored.
    pub(crate) fn replication_enabled(&self, el: &MetadataElement) -> bool {
        !el.attributes
            .intersects(ElementAttr::PEER_DEAD | ElementAttr::CMI_DISABLED)
            && self.transport().is_some_and(|t| t.is_peer_alive())
    }

    pub(crate) fn element(&self, handle: ElementHandle) -> MetadataResult<Arc<MetadataElement>> {
        self.registry
            .get(handle)
            .ok_or(MetadataError::UnknownElement(handle))
    }

    pub(crate) fn header(&self, el: &MetadataElement) -> MessageHeader {
        MessageHeader::new(el.handle(), el.peer_handle(), el.object_id())
    }

    /// Queues `el` for the worker unless it is already queued.
    pub(crate) fn reschedule(&self, el: &MetadataElement) {
        if el.blob.mark_queued() {
            self.blobs.push(el.handle());
        }
    }

    /// Sends `body` for `el`; `in_flight` decides what happens on delivery.
    pub(crate) fn transmit(&self, header: MessageHeader, body: MessageBody, in_flight: InFlight) {
        let message = CmiMessage::new(header, body);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        match self.transport() {
            Some(transport) => {
                self.in_flight.lock().insert(token, in_flight);
                self.stats.inc_sent();
                transport.send(message, token);
            }
            None => {
                debug!(kind = ?message.message_type(), "no transport, message not sent");
                self.stats.inc_send_failure();
                self.delivery_outcome(twinlock_cmi::CmiEvent::PeerNotPresent, in_flight);
            }
        }
    }

    pub(crate) fn take_in_flight(&self, token: SendToken) -> Option<InFlight> {
        self.in_flight.lock().remove(&token)
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    // ---- element lifecycle ----

    /// Registers a new element in state `Invalid`.
    pub fn register(&self, config: ElementConfig) -> MetadataResult<ElementHandle> {
        if self.is_stopped() {
            return Err(MetadataError::DomainStopped);
        }
        if config.nonpaged_size > self.config.max_nonpaged_size {
            return Err(MetadataError::RecordTooLarge {
                size: config.nonpaged_size,
                max_size: self.config.max_nonpaged_size,
            });
        }
        if config.memory_size > self.config.memory_update_size {
            return Err(MetadataError::RecordTooLarge {
                size: config.memory_size,
                max_size: self.config.memory_update_size,
            });
        }
        let domain_config = &self.config;
        let el = self
            .registry
            .insert(config.object_id, |handle| {
                MetadataElement::new(handle, config, domain_config)
            })?;
        Ok(el.handle())
    }

    /// Drains every stripe lock with destroy semantics and removes the element.
    pub fn unregister(&self, handle: ElementHandle) -> MetadataResult<()> {
        let el = self.element(handle)?;
        el.attributes.set_destroy_abort();
        self.abort_waiters(&el, true);
        self.stripe_lock_stop(handle)?;
        el.attributes.set_cmi_disabled();
        let dropped = self.drop_all_requests(&el);
        el.blob.drain();
        el.awaiting.lock().clear();
        if dropped > 0 {
            warn!(object_id = el.object_id(), dropped, "element unregistered with locks held");
        }
        self.registry.remove(handle);
        Ok(())
    }

    /// Changes the element's role.
    pub fn set_state(&self, handle: ElementHandle, state: ElementState) -> MetadataResult<()> {
        let el = self.element(handle)?;
        if el.set_state(state) {
            info!(object_id = el.object_id(), ?state, "element state changed");
            self.reschedule(&el);
        }
        Ok(())
    }

    pub fn state(&self, handle: ElementHandle) -> MetadataResult<ElementState> {
        Ok(self.element(handle)?.state())
    }

    /// Moves every registered element to `state`.
    pub fn switch_all_elements_to_state(&self, state: ElementState) {
        for el in self.registry.all() {
            if el.set_state(state) {
                self.reschedule(&el);
            }
        }
        info!(?state, "all elements switched");
    }

    /// Aborts pending stripe locks except non-paged ones.
    pub fn abort_io(&self, handle: ElementHandle) -> MetadataResult<()> {
        let el = self.element(handle)?;
        el.attributes.set_abort();
        self.abort_waiters(&el, false);
        Ok(())
    }

    /// Aborts every pending stripe lock ahead of destroying the element.
    pub fn destroy_abort_io(&self, handle: ElementHandle) -> MetadataResult<()> {
        let el = self.element(handle)?;
        el.attributes.set_destroy_abort();
        self.abort_waiters(&el, true);
        Ok(())
    }

    /// Lifts every abort condition.
    pub fn restart_io(&self, handle: ElementHandle) -> MetadataResult<()> {
        let el = self.element(handle)?;
        el.attributes.clear(
            ElementAttr::ABORT_STRIPE_LOCKS
                | ElementAttr::DESTROY_ABORT_STRIPE_LOCKS
                | ElementAttr::ABORT_MONITOR_OPS
                | ElementAttr::ABORTED_REQUESTS_PRESENT,
        );
        self.reschedule(&el);
        Ok(())
    }

    /// Lifts the plain abort condition only.
    pub fn clear_abort(&self, handle: ElementHandle) -> MetadataResult<()> {
        self.element(handle)?.attributes.clear_abort();
        Ok(())
    }

    /// Stops replicating this element to the peer.
    pub fn disable_cmi(&self, handle: ElementHandle) -> MetadataResult<()> {
        self.element(handle)?.attributes.set_cmi_disabled();
        Ok(())
    }

    /// Resumes replicating this element to the peer.
    pub fn enable_cmi(&self, handle: ElementHandle) -> MetadataResult<()> {
        self.element(handle)?.attributes.clear_cmi_disabled();
        Ok(())
    }

    pub fn attributes(&self, handle: ElementHandle) -> MetadataResult<ElementAttr> {
        Ok(self.element(handle)?.attributes.load())
    }

    pub fn peer_handle(&self, handle: ElementHandle) -> MetadataResult<ElementHandle> {
        Ok(self.element(handle)?.peer_handle())
    }

    /// Ownership of the slice containing `stripe`.
    pub fn slice_state(&self, handle: ElementHandle, stripe: u64) -> MetadataResult<SliceState> {
        Ok(self.element(handle)?.table.slice_state(stripe))
    }

    /// Number of requests currently spanning slices.
    pub fn large_io_count(&self, handle: ElementHandle) -> MetadataResult<u32> {
        Ok(self.element(handle)?.large_io_count())
    }

    pub fn is_hash_disabled(&self, handle: ElementHandle) -> MetadataResult<bool> {
        Ok(self.element(handle)?.attributes.is_hash_disabled())
    }

    pub fn element_stats(&self, handle: ElementHandle) -> MetadataResult<ElementStatsSnapshot> {
        Ok(self.element(handle)?.stats.snapshot())
    }

    pub fn stats(&self) -> DomainStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let (allocated, _) = self.pool.snapshot();
        DomainStatsSnapshot {
            elements: self.registry.len(),
            messages_sent: get(&self.stats.messages_sent),
            messages_received: get(&self.stats.messages_received),
            send_failures: get(&self.stats.send_failures),
            protocol_errors: get(&self.stats.protocol_errors),
            blobs_dispatched: get(&self.stats.blobs_dispatched),
            peer_lost_events: get(&self.stats.peer_lost_events),
            shadow_pool_capacity: self.pool.capacity(),
            shadow_pool_allocated: allocated,
            shadow_pool_exhausted: self.pool.exhaustion_count(),
        }
    }

    /// `(allocated, free)` shadow counts.
    pub fn shadow_pool_usage(&self) -> (usize, usize) {
        self.pool.snapshot()
    }

    /// Local metadata memory block.
    pub fn get_metadata_memory(&self, handle: ElementHandle) -> MetadataResult<Vec<u8>> {
        Ok(self.element(handle)?.memory())
    }

    /// Peer's metadata memory block as last mirrored here.
    pub fn get_peer_metadata_memory(&self, handle: ElementHandle) -> MetadataResult<Vec<u8>> {
        Ok(self.element(handle)?.peer_memory())
    }

    /// Full-range helper used by whole-object locks.
    pub(crate) fn whole_object() -> StripeRegion {
        StripeRegion::new(0, u64::MAX - 1)
    }
}

impl Drop for LockDomain {
    fn drop(&mut self) {
        self.blobs.stop();
    }
}
