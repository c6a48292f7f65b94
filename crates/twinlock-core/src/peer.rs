//! Peer request channel: the worker's blob pass and delivery outcomes.

use tracing::{debug, info, trace};
use twinlock_cmi::{
    CmiEvent, CmiLockFlags, ElementHandle, MessageBody, MessageHeader, ObjectId, RequestToken,
    StripeLockMessage,
};

use crate::blob::{OutgoingRequest, PeerWork};
use crate::domain::{InFlight, LockDomain};
use crate::element::{ElementState, MetadataElement};
use crate::flags::{ElementAttr, RequestFlags};
use crate::nonpaged::ReplicationOutcome;
use crate::request::{LockRequest, LockStatus};
use crate::slice::SliceEntry;
use crate::stripe_lock::Ready;

impl LockDomain {
    /// Dispatches every queued blob once. Returns how many were processed.
    ///
    /// The background worker calls this in a loop; tests call it directly to
    /// step the engine deterministically.
    pub fn run_worker(&self) -> usize {
        let handles = self.blobs.pop_all();
        let count = handles.len();
        for handle in handles {
            let Some(el) = self.registry.get(handle) else {
                continue;
            };
            el.blob.clear_queued();
            self.dispatch_blob(&el);
            self.stats.inc_blob_dispatched();
        }
        count
    }

    fn dispatch_blob(&self, el: &MetadataElement) {
        if el.state() == ElementState::Invalid {
            trace!(object_id = el.object_id(), "blob skipped, element not initialised");
            return;
        }
        let mut ready = Ready::default();
        let mut requests: Vec<OutgoingRequest> = Vec::new();

        for work in el.blob.drain() {
            match work {
                PeerWork::Outgoing(out) => requests.push(out),
                PeerWork::Incoming(sl) => self.accept_peer_request(el, sl, &mut ready),
            }
        }

        self.scan_for_grants(el, &mut ready);

        // Work queued while the scan ran: requests go out with this pass,
        // peer requests wait for the next one.
        for work in el.blob.drain() {
            match work {
                PeerWork::Outgoing(out) => requests.push(out),
                PeerWork::Incoming(sl) => {
                    el.blob.push(PeerWork::Incoming(sl));
                    ready.reschedule = true;
                }
            }
        }

        self.flush(el, ready);
        for out in requests {
            self.send_outgoing(el, out);
        }

        if el.blob.take_hash_enable() {
            let mut guard = el.table.lock_all();
            if el.attributes.is_hash_disabled() && el.large_io_count() == 0 {
                el.table.enable_hash(&mut guard);
                el.attributes.clear_hash_disabled();
            }
        }
    }

    /// Inserts a peer request into the local queue, or refuses it.
    fn accept_peer_request(&self, el: &MetadataElement, mut sl: LockRequest, ready: &mut Ready) {
        let attrs = el.attributes.load();
        if attrs.intersects(ElementAttr::SL_PEER_LOST | ElementAttr::PEER_DEAD) {
            debug!(object_id = el.object_id(), "peer request dropped, peer is gone");
            return;
        }
        let destroy = attrs.contains(ElementAttr::DESTROY_ABORT_STRIPE_LOCKS);
        let refuse = destroy
            || attrs.contains(ElementAttr::ABORT_STRIPE_LOCKS)
            || (attrs.contains(ElementAttr::ABORT_MONITOR_OPS) && sl.monitor_op);
        if refuse {
            if let Some(request) = sl.request_token {
                let flags = if destroy {
                    CmiLockFlags::ABORT_DESTROY
                } else {
                    CmiLockFlags::empty()
                };
                ready.send(StripeLockMessage::Aborted { request, flags }, InFlight::Control);
            }
            el.stats.inc_abort();
            return;
        }

        if el.table.spans_slices(&sl.stripe) {
            self.make_large(el, &mut sl);
        }
        let id = sl.id;
        let mut entry = el.table.entry(sl.stripe.first, &el.attributes);
        entry.requests.insert(id, sl);
        let result = entry.insert(id, el.is_active());
        el.stats.add_deadlocks(result.deadlocks_broken);
        if result.granted {
            self.on_granted(el, &mut entry, id, ready);
        }
        self.handle_exhausted(el, &mut entry, ready);
    }

    /// Builds grant messages for peer requests granted since the last pass.
    fn scan_for_grants(&self, el: &MetadataElement, ready: &mut Ready) {
        el.table.for_each_entry(|entry| {
            while let Some(id) = next_grant(entry) {
                let Some(sl) = entry.requests.get_mut(&id) else {
                    break;
                };
                sl.flags.insert(RequestFlags::GRANTED);
                let Some(request) = sl.request_token else {
                    continue;
                };
                let grant = StripeLockMessage::Grant {
                    mode: sl.mode(),
                    read_region: sl.read_region,
                    write_region: sl.write_region,
                    request,
                    grant: sl.token(),
                    flags: sl.cmi_flags,
                };
                el.stats.inc_grant_sent();
                if sl.need_release() {
                    let held = InFlight::HeldGrant {
                        element: el.handle(),
                        grant: sl.token(),
                    };
                    ready.send(grant, held);
                } else if let Some(mut sl) = self.take_off(el, entry, id, ready) {
                    let permit = sl.take_permit();
                    ready.send(grant, InFlight::Grant { permit });
                }
            }
            self.handle_exhausted(el, entry, ready);
        });
    }

    fn send_outgoing(&self, el: &MetadataElement, out: OutgoingRequest) {
        if !self.peer_alive(el) {
            let request = out.request;
            drop(out.permit);
            self.request_undeliverable(el, request);
            return;
        }
        el.stats.inc_request_sent();
        let body = MessageBody::StripeLock(StripeLockMessage::Request {
            mode: out.mode,
            region: out.region,
            request: out.request,
            flags: Some(out.flags),
        });
        self.transmit(
            self.header(el),
            body,
            InFlight::Request {
                element: el.handle(),
                request: out.request,
                permit: out.permit,
            },
        );
    }

    /// A request never reached the peer. While the peer is still there the
    /// request fails; otherwise it is settled as if there were no peer.
    pub(crate) fn request_undeliverable(&self, el: &MetadataElement, token: RequestToken) {
        let mut ready = Ready::default();
        self.with_entry(el, token, |entry| {
            let Some(sl) = entry.requests.get_mut(&token.id) else {
                return;
            };
            if !sl.waiting_for_peer() {
                return;
            }
            sl.flags.remove(RequestFlags::WAITING_FOR_PEER);
            if self.peer_alive(el) {
                self.finish_detached(el, entry, token.id, LockStatus::Aborted, &mut ready);
            } else {
                self.send_request_sl(el, sl, &mut ready);
            }
            self.handle_exhausted(el, entry, &mut ready);
        });
        el.awaiting.lock().remove(&token.id);
        self.flush(el, ready);
    }

    /// A need-release grant never reached the peer. Its shadow comes off
    /// the queue and whatever waited behind it is dispatched.
    fn grant_undeliverable(&self, el: &MetadataElement, grant: RequestToken) {
        let mut ready = Ready::default();
        self.with_entry(el, grant, |entry| {
            if !entry.requests.get(&grant.id).is_some_and(|sl| sl.is_peer()) {
                return;
            }
            self.take_off(el, entry, grant.id, &mut ready);
            self.handle_exhausted(el, entry, &mut ready);
        });
        self.flush(el, ready);
    }

    fn is_waiting(&self, el: &MetadataElement, token: RequestToken) -> bool {
        self.with_entry(el, token, |entry| {
            entry
                .requests
                .get(&token.id)
                .is_some_and(|sl| sl.waiting_for_peer())
        })
        .unwrap_or(false)
    }

    /// Applies the delivery outcome of one send.
    pub(crate) fn delivery_outcome(&self, event: CmiEvent, in_flight: InFlight) {
        match in_flight {
            InFlight::Request {
                element,
                request,
                permit,
            } => {
                let Some(el) = self.registry.get(element) else {
                    return;
                };
                if event == CmiEvent::Transmitted {
                    if self.is_waiting(&el, request) {
                        el.awaiting.lock().insert(request.id, permit);
                    }
                } else {
                    debug!(object_id = el.object_id(), ?event, "lock request not delivered");
                    drop(permit);
                    self.request_undeliverable(&el, request);
                }
            }
            InFlight::Grant { permit } => drop(permit),
            InFlight::HeldGrant { element, grant } => {
                if !event.is_failure() {
                    return;
                }
                let Some(el) = self.registry.get(element) else {
                    return;
                };
                debug!(object_id = el.object_id(), ?event, "grant not delivered, shadow dropped");
                self.grant_undeliverable(&el, grant);
            }
            InFlight::Release { completer } => completer.complete(LockStatus::Ok),
            InFlight::Nonpaged { completer } => {
                if let Some(completer) = completer {
                    completer.complete(ReplicationOutcome::from_event(event));
                }
            }
            InFlight::Control => {}
        }
    }

    /// Runs peer-loss recovery on every element.
    pub(crate) fn contact_lost(&self) {
        self.stats.inc_peer_lost();
        let elements = self.registry.all();
        info!(elements = elements.len(), "peer contact lost");
        for el in elements {
            self.peer_lost_element(&el);
        }
    }

    /// Replies `Aborted` to a lock request this node cannot take.
    pub(crate) fn reply_aborted(
        &self,
        sender: ElementHandle,
        receiver: ElementHandle,
        object_id: ObjectId,
        request: RequestToken,
    ) {
        let header = MessageHeader::new(sender, receiver, object_id);
        self.transmit(
            header,
            MessageBody::StripeLock(StripeLockMessage::Aborted {
                request,
                flags: CmiLockFlags::empty(),
            }),
            InFlight::Control,
        );
    }
}

/// First top-level peer request granted but not yet announced.
fn next_grant(entry: &SliceEntry) -> Option<u64> {
    entry.queue.iter().copied().find(|id| {
        entry.requests.get(id).is_some_and(|sl| {
            sl.is_peer()
                && sl.flags.contains(RequestFlags::GRANT)
                && !sl.flags.contains(RequestFlags::GRANTED)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DomainConfig, ElementConfig};
    use crate::pool::ShadowPool;
    use std::sync::Arc;
    use twinlock_cmi::{LockMode, StripeRegion};

    fn domain() -> Arc<LockDomain> {
        LockDomain::new(DomainConfig {
            cpu_count: 1,
            max_peer_sl_per_cpu: 4,
            stripes_per_slice: 16,
            ..DomainConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_run_worker_skips_invalid_element() {
        let d = domain();
        let h = d.register(ElementConfig::new(1)).unwrap();
        let el = d.element(h).unwrap();
        d.reschedule(&el);
        assert_eq!(d.run_worker(), 1);
        assert_eq!(d.run_worker(), 0);
    }

    #[test]
    fn test_next_grant_finds_unannounced() {
        let pool = ShadowPool::new(1);
        let mut entry = SliceEntry::default();
        let mut sl = LockRequest::peer(
            5,
            LockMode::Write,
            StripeRegion::new(0, 0),
            StripeRegion::new(0, 15),
            RequestToken::new(1, 0),
            pool.acquire().unwrap(),
        );
        sl.flags.insert(RequestFlags::GRANT);
        entry.requests.insert(5, sl);
        entry.queue.push(5);
        assert_eq!(next_grant(&entry), Some(5));
        if let Some(sl) = entry.requests.get_mut(&5) {
            sl.flags.insert(RequestFlags::GRANTED);
        }
        assert_eq!(next_grant(&entry), None);
    }

    #[test]
    fn test_release_outcome_completes_unlock() {
        let d = domain();
        let (completer, mut completion) = crate::completion::Completion::channel();
        d.delivery_outcome(CmiEvent::PeerNotPresent, InFlight::Release { completer });
        assert_eq!(completion.poll(), Some(LockStatus::Ok));
    }

    #[test]
    fn test_nonpaged_outcome_mapping() {
        let d = domain();
        for (event, expected) in [
            (CmiEvent::Transmitted, ReplicationOutcome::Replicated),
            (CmiEvent::PeerContactLost, ReplicationOutcome::LocalOnly),
            (CmiEvent::PeerBusy, ReplicationOutcome::Failed),
        ] {
            let (completer, mut completion) = crate::completion::Completion::channel();
            d.delivery_outcome(
                event,
                InFlight::Nonpaged {
                    completer: Some(completer),
                },
            );
            assert_eq!(completion.poll(), Some(expected));
        }
    }
}
