//! Inbound CMI traffic: element resolution and stripe-lock message handling.

use std::sync::Arc;
use tracing::{debug, error, info, warn};
use twinlock_cmi::{
    CmiClient, CmiEvent, CmiLockFlags, CmiMessage, ElementHandle, LockMode, MessageBody,
    MessageHeader, RequestToken, SendToken, StripeLockMessage, StripeRegion,
};

use crate::blob::PeerWork;
use crate::domain::{InFlight, LockDomain};
use crate::element::{ElementState, MetadataElement};
use crate::flags::RequestFlags;
use crate::request::{LockClass, LockRequest, LockStatus};
use crate::stripe_lock::{complete, Ready};

impl LockDomain {
    /// Finds the element a message is addressed to.
    ///
    /// A receiver handle must name a live element guarding the header's
    /// object; a null or stale handle falls back to the object id.
    fn resolve(&self, header: &MessageHeader) -> Option<Arc<MetadataElement>> {
        if header.receiver.is_null() {
            return self.registry.by_object(header.object_id);
        }
        match self.registry.get(header.receiver) {
            Some(el) if el.object_id() == header.object_id => Some(el),
            Some(el) => {
                error!(
                    receiver = ?header.receiver,
                    expected = header.object_id,
                    found = el.object_id(),
                    "message handle names a different object"
                );
                self.stats.inc_protocol_error();
                None
            }
            None => {
                debug!(receiver = ?header.receiver, "stale receiver handle, resolving by object id");
                self.registry.by_object(header.object_id)
            }
        }
    }

    fn handle_message(&self, message: CmiMessage) {
        self.stats.inc_received();
        let CmiMessage { header, body } = message;
        let Some(el) = self.resolve(&header) else {
            if let MessageBody::StripeLock(StripeLockMessage::Request { request, .. }) = body {
                warn!(object_id = header.object_id, "lock request for unknown element");
                self.reply_aborted(ElementHandle::NULL, header.sender, header.object_id, request);
            } else {
                debug!(object_id = header.object_id, "message for unknown element dropped");
            }
            return;
        };

        el.attributes.set_cmi_msg_processing();
        match body {
            MessageBody::StripeLock(lock) => self.on_stripe_lock(&el, &header, lock),
            MessageBody::MemoryUpdate { data } => {
                let stored = el.store_peer_memory(&data);
                if stored < data.len() {
                    warn!(
                        object_id = el.object_id(),
                        received = data.len(),
                        stored,
                        "peer memory update truncated"
                    );
                }
            }
            body => self.apply_peer_nonpaged(&el, &header, body),
        }
        el.attributes.clear_cmi_msg_processing();
    }

    fn on_stripe_lock(&self, el: &MetadataElement, header: &MessageHeader, message: StripeLockMessage) {
        match message {
            StripeLockMessage::Start => {
                let previous = el.set_peer_handle(header.sender);
                el.attributes.clear_peer_dead();
                info!(object_id = el.object_id(), peer = ?header.sender, "peer stripe lock blob attached");
                if previous != header.sender {
                    self.transmit(
                        self.header(el),
                        MessageBody::StripeLock(StripeLockMessage::Start),
                        InFlight::Control,
                    );
                }
            }
            StripeLockMessage::Stop => {
                info!(object_id = el.object_id(), "peer stripe lock blob detached");
            }
            StripeLockMessage::Request {
                mode,
                region,
                request,
                flags,
            } => self.on_peer_request(el, header, mode, region, request, flags),
            StripeLockMessage::Grant {
                request,
                grant,
                flags,
                ..
            } => self.on_grant(el, request, grant, flags),
            StripeLockMessage::Release { grant } => self.on_release(el, grant),
            StripeLockMessage::Aborted { request, flags } => self.on_aborted(el, request, flags),
        }
    }

    /// Builds the local shadow of a peer request and queues it for the worker.
    fn on_peer_request(
        &self,
        el: &MetadataElement,
        header: &MessageHeader,
        mode: LockMode,
        region: StripeRegion,
        request: RequestToken,
        flags: Option<CmiLockFlags>,
    ) {
        el.stats.inc_request_received();
        let refuse = |reason: &str| {
            debug!(object_id = el.object_id(), reason, "peer lock request refused");
            self.reply_aborted(el.handle(), header.sender, el.object_id(), request);
        };
        if el.state() == ElementState::Invalid || el.attributes.is_cmi_disabled() {
            refuse("element not accepting peer traffic");
            return;
        }
        if !region.is_valid() || region.last < region.first || region.last == u64::MAX {
            error!(object_id = el.object_id(), ?region, "peer lock request with invalid range");
            self.stats.inc_protocol_error();
            refuse("invalid range");
            return;
        }
        let Some(permit) = self.pool.acquire() else {
            warn!(object_id = el.object_id(), "no shadow for peer lock request");
            refuse("shadow pool exhausted");
            return;
        };

        let expanded = el.table.expand_to_slices(&region);
        let id = self.next_request_id();
        let mut sl = match flags {
            Some(flags) => {
                let mut sl = LockRequest::peer(id, mode, region, expanded, request, permit)
                    .with_class(LockClass::from_wire(flags));
                if flags.contains(CmiLockFlags::MONITOR_OP) {
                    sl.cmi_flags.insert(CmiLockFlags::MONITOR_OP);
                }
                sl
            }
            None => {
                let mut sl = LockRequest::peer(id, mode, expanded, expanded, request, permit);
                sl.flags.insert(RequestFlags::FULL_SLOT);
                sl
            }
        };
        sl.monitor_op = sl.cmi_flags.contains(CmiLockFlags::MONITOR_OP);
        el.blob.push(PeerWork::Incoming(sl));
        self.reschedule(el);
    }

    fn on_grant(
        &self,
        el: &MetadataElement,
        request: RequestToken,
        grant: RequestToken,
        flags: CmiLockFlags,
    ) {
        el.stats.inc_grant_received();
        let mut ready = Ready::default();
        let applied = self.with_entry(el, request, |entry| {
            let Some(sl) = entry.requests.get_mut(&request.id).filter(|sl| !sl.is_peer()) else {
                return false;
            };
            el.awaiting.lock().remove(&request.id);
            if !flags.contains(CmiLockFlags::NEED_RELEASE) {
                self.mark_grant_from_peer(el, sl);
            }
            sl.grant_token = Some(grant);
            sl.cmi_flags.insert(flags);
            sl.flags.remove(
                RequestFlags::PEER_COLLISION
                    | RequestFlags::WAITING_FOR_PEER
                    | RequestFlags::DEAD_LOCK,
            );
            if sl.is_local_grant() {
                complete(el, sl, LockStatus::Ok, &mut ready);
            }
            true
        });
        if applied != Some(true) {
            error!(object_id = el.object_id(), ?request, "grant for unknown request");
            self.stats.inc_protocol_error();
        }
        self.flush(el, ready);
    }

    fn on_release(&self, el: &MetadataElement, grant: RequestToken) {
        let mut ready = Ready::default();
        let released = self.with_entry(el, grant, |entry| {
            if !entry.requests.get(&grant.id).is_some_and(LockRequest::is_peer) {
                return false;
            }
            self.take_off(el, entry, grant.id, &mut ready);
            self.handle_exhausted(el, entry, &mut ready);
            true
        });
        if released != Some(true) {
            error!(object_id = el.object_id(), ?grant, "release for unknown grant");
            self.stats.inc_protocol_error();
        }
        self.flush(el, ready);
    }

    fn on_aborted(&self, el: &MetadataElement, request: RequestToken, flags: CmiLockFlags) {
        el.awaiting.lock().remove(&request.id);
        let mut ready = Ready::default();
        let found = self.with_entry(el, request, |entry| {
            let Some(sl) = entry.requests.get_mut(&request.id).filter(|sl| !sl.is_peer()) else {
                return false;
            };
            if flags.contains(CmiLockFlags::ABORT_DESTROY) {
                // The peer is going away; wait for contact loss to settle it.
                sl.flags.remove(RequestFlags::WAITING_FOR_PEER);
                sl.cmi_flags.insert(CmiLockFlags::ABORT_DESTROY);
            } else {
                self.finish_detached(el, entry, request.id, LockStatus::Aborted, &mut ready);
                self.handle_exhausted(el, entry, &mut ready);
            }
            true
        });
        if found != Some(true) {
            debug!(object_id = el.object_id(), ?request, "abort for request no longer held");
        }
        self.flush(el, ready);
    }
}

impl CmiClient for LockDomain {
    fn on_message(&self, message: CmiMessage) {
        self.handle_message(message);
    }

    fn on_event(&self, event: CmiEvent, message: CmiMessage, token: SendToken) {
        let Some(in_flight) = self.take_in_flight(token) else {
            debug!(token, kind = ?message.message_type(), "delivery outcome for unknown send");
            return;
        };
        if event.is_failure() {
            debug!(?event, kind = ?message.message_type(), "send failed");
            self.stats.inc_send_failure();
        }
        self.delivery_outcome(event, in_flight);
    }

    fn on_contact_lost(&self) {
        self.contact_lost();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DomainConfig, ElementConfig};
    use twinlock_cmi::OperationFlags;

    fn domain() -> Arc<LockDomain> {
        LockDomain::new(DomainConfig {
            cpu_count: 1,
            max_peer_sl_per_cpu: 2,
            stripes_per_slice: 16,
            ..DomainConfig::default()
        })
        .unwrap()
    }

    fn message(receiver: ElementHandle, object_id: u32, body: StripeLockMessage) -> CmiMessage {
        CmiMessage::new(
            MessageHeader::new(ElementHandle::new(9, 9), receiver, object_id),
            MessageBody::StripeLock(body),
        )
    }

    #[test]
    fn test_resolve_by_object_and_handle() {
        let d = domain();
        let h = d.register(ElementConfig::new(7)).unwrap();
        let by_object = MessageHeader::new(ElementHandle::NULL, ElementHandle::NULL, 7);
        assert_eq!(d.resolve(&by_object).unwrap().handle(), h);
        let by_handle = MessageHeader::new(ElementHandle::NULL, h, 7);
        assert_eq!(d.resolve(&by_handle).unwrap().handle(), h);
    }

    #[test]
    fn test_resolve_rejects_mismatched_object() {
        let d = domain();
        let h = d.register(ElementConfig::new(7)).unwrap();
        d.register(ElementConfig::new(8)).unwrap();
        let header = MessageHeader::new(ElementHandle::NULL, h, 8);
        assert!(d.resolve(&header).is_none());
        assert_eq!(d.stats().protocol_errors, 1);
    }

    #[test]
    fn test_start_learns_peer_handle() {
        let d = domain();
        let h = d.register(ElementConfig::new(7)).unwrap();
        d.on_message(message(ElementHandle::NULL, 7, StripeLockMessage::Start));
        assert_eq!(d.peer_handle(h).unwrap(), ElementHandle::new(9, 9));
        assert!(!d.attributes(h).unwrap().contains(crate::flags::ElementAttr::PEER_DEAD));
    }

    #[test]
    fn test_request_on_invalid_element_not_queued() {
        let d = domain();
        let h = d.register(ElementConfig::new(7)).unwrap();
        d.on_message(message(
            h,
            7,
            StripeLockMessage::Request {
                mode: LockMode::Write,
                region: StripeRegion::new(0, 0),
                request: RequestToken::new(1, 0),
                flags: Some(CmiLockFlags::empty()),
            },
        ));
        assert_eq!(d.outstanding_stripe_lock_request(h).unwrap(), 0);
        assert_eq!(d.shadow_pool_usage(), (0, 2));
    }

    #[test]
    fn test_request_queued_as_full_slot_for_version_zero() {
        let d = domain();
        let h = d.register(ElementConfig::new(7)).unwrap();
        d.set_state(h, ElementState::Active).unwrap();
        d.on_message(message(
            h,
            7,
            StripeLockMessage::Request {
                mode: LockMode::Read,
                region: StripeRegion::new(3, 4),
                request: RequestToken::new(1, 3),
                flags: None,
            },
        ));
        assert_eq!(d.outstanding_stripe_lock_request(h).unwrap(), 1);
        assert_eq!(d.shadow_pool_usage(), (1, 1));
        d.run_worker();
        // Granted and announced; the full-slot grant needs no release.
        assert_eq!(d.outstanding_stripe_lock_request(h).unwrap(), 0);
        assert_eq!(d.slice_state(h, 0).unwrap(), crate::slice::SliceState::ExclusiveLocal);
    }

    #[test]
    fn test_grant_for_unknown_request_is_protocol_error() {
        let d = domain();
        let h = d.register(ElementConfig::new(7)).unwrap();
        d.on_message(message(
            h,
            7,
            StripeLockMessage::Grant {
                mode: LockMode::Write,
                read_region: StripeRegion::INVALID,
                write_region: StripeRegion::new(0, 0),
                request: RequestToken::new(44, 0),
                grant: RequestToken::new(1, 0),
                flags: CmiLockFlags::empty(),
            },
        ));
        assert_eq!(d.stats().protocol_errors, 1);
    }

    #[test]
    fn test_memory_update_mirrored() {
        let d = domain();
        let h = d.register(ElementConfig::new(7)).unwrap();
        d.on_message(CmiMessage::new(
            MessageHeader::new(ElementHandle::new(1, 1), h, 7).with_flags(OperationFlags::empty()),
            MessageBody::MemoryUpdate { data: vec![5; 16] },
        ));
        assert_eq!(&d.get_peer_metadata_memory(h).unwrap()[..16], &[5; 16]);
        assert_eq!(d.stats().messages_received, 1);
    }
}
