//! Stripe-lock engine: acquire, release, abort sweeps and peer-loss recovery.
//!
//! Queue work runs under the owning entry's lock and records its side effects
//! in a [`Ready`] batch. Caller completions, outbound messages and worker
//! wake-ups are released by [`LockDomain::flush`] once every table lock has
//! been dropped.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use twinlock_cmi::{
    CmiLockFlags, ElementHandle, LockMode, MessageBody, RequestToken, StripeLockMessage,
    StripeRegion,
};

use crate::blob::{OutgoingRequest, PeerWork};
use crate::completion::{Completer, Completion};
use crate::domain::{InFlight, LockDomain};
use crate::element::MetadataElement;
use crate::error::{MetadataError, MetadataResult};
use crate::flags::{ElementAttr, PrivateFlags, RequestFlags};
use crate::queue::Detached;
use crate::request::{
    LockClass, LockOpcode, LockOptions, LockRequest, LockStatus, LockTicket, RequestId,
};
use crate::slice::{collect_tree, SliceEntry, SliceState};

/// Side effects gathered while table locks are held.
#[derive(Default)]
pub(crate) struct Ready {
    completions: Vec<(Completer<LockStatus>, LockStatus)>,
    pub outbound: Vec<(MessageBody, InFlight)>,
    /// Local requests that needed a shadow when the pool was empty.
    pub exhausted: Vec<RequestId>,
    pub reschedule: bool,
}

impl Ready {
    pub fn send(&mut self, message: StripeLockMessage, in_flight: InFlight) {
        self.outbound
            .push((MessageBody::StripeLock(message), in_flight));
    }
}

/// Records `status` and queues the caller's completion if one is still owed.
pub(crate) fn complete(
    el: &MetadataElement,
    sl: &mut LockRequest,
    status: LockStatus,
    ready: &mut Ready,
) {
    if let Some(pair) = sl.finish(status) {
        match status {
            LockStatus::Ok => el.stats.inc_granted(),
            LockStatus::Aborted => el.stats.inc_abort(),
            LockStatus::Cancelled => el.stats.inc_cancel(),
            _ => {}
        }
        ready.completions.push(pair);
    }
}

/// A lock currently held by a local caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantedLock {
    pub token: RequestToken,
    pub mode: LockMode,
    pub stripe: StripeRegion,
}

/// Top-level local requests still owed an answer.
fn parked_locals(entry: &SliceEntry) -> Vec<RequestId> {
    entry
        .queue
        .iter()
        .copied()
        .filter(|id| {
            entry
                .requests
                .get(id)
                .is_some_and(|sl| !sl.is_peer() && !sl.is_reported())
        })
        .collect()
}

impl LockDomain {
    /// Requests a stripe lock over `region`.
    ///
    /// The returned ticket resolves to `Ok` once the lock is held on both
    /// nodes, or to `Aborted`/`Cancelled`. A decision made during the call is
    /// already visible through [`LockTicket::status`].
    pub fn lock(
        &self,
        handle: ElementHandle,
        mode: LockMode,
        region: StripeRegion,
        options: LockOptions,
    ) -> MetadataResult<LockTicket> {
        if self.is_stopped() {
            return Err(MetadataError::DomainStopped);
        }
        if !region.is_valid() || region.last < region.first || region.last == u64::MAX {
            return Err(MetadataError::InvalidRange {
                first: region.first,
                last: region.last,
            });
        }
        let el = self.element(handle)?;
        let (completer, completion) = Completion::channel();
        let mut sl = LockRequest::local(self.next_request_id(), mode, region, &options, completer);
        let token = sl.token();
        el.stats.inc_lock_requested();

        let mut ready = Ready::default();
        if el.table.spans_slices(&region) {
            self.make_large(&el, &mut sl);
        } else if el.attributes.is_hash_disabled() && el.large_io_count() == 0 {
            el.blob.request_hash_enable();
            ready.reschedule = true;
        }

        match self.gate(&el, &sl) {
            Some(status) => {
                debug!(object_id = el.object_id(), ?status, "lock refused");
                self.release_large(&el, &mut sl, &mut ready);
                complete(&el, &mut sl, status, &mut ready);
            }
            None => {
                sl.status = LockStatus::Pending;
                let id = sl.id;
                let mut entry = el.table.entry(region.first, &el.attributes);
                entry.requests.insert(id, sl);
                let result = entry.insert(id, el.is_active());
                el.stats.add_deadlocks(result.deadlocks_broken);
                if result.granted {
                    self.on_granted(&el, &mut entry, id, &mut ready);
                }
                self.handle_exhausted(&el, &mut entry, &mut ready);
            }
        }
        self.flush(&el, ready);
        Ok(LockTicket::new(handle, token, mode, completion))
    }

    /// Releases a granted lock. The completion resolves once any release
    /// owed to the peer has gone out.
    pub fn unlock(
        &self,
        handle: ElementHandle,
        token: RequestToken,
    ) -> MetadataResult<Completion<LockStatus>> {
        let el = self.element(handle)?;
        let mut ready = Ready::default();
        let outcome = self
            .with_entry(&el, token, |entry| {
                let sl = entry
                    .requests
                    .get(&token.id)
                    .filter(|sl| !sl.is_peer())
                    .ok_or(MetadataError::UnknownRequest { id: token.id })?;
                if !sl.is_reported() || sl.status != LockStatus::Ok {
                    return Ok(Completion::ready(LockStatus::IllegalRequest));
                }
                let Some(mut sl) = self.take_off(&el, entry, token.id, &mut ready) else {
                    return Err(MetadataError::UnknownRequest { id: token.id });
                };
                sl.opcode = LockOpcode::unlock(sl.mode());
                el.stats.inc_unlock();
                self.handle_exhausted(&el, entry, &mut ready);
                match sl.grant_token {
                    Some(grant) if sl.need_release() && self.peer_alive(&el) => {
                        let (completer, completion) = Completion::channel();
                        ready.send(
                            StripeLockMessage::Release { grant },
                            InFlight::Release { completer },
                        );
                        el.stats.inc_release_sent();
                        Ok(completion)
                    }
                    _ => Ok(Completion::ready(LockStatus::Ok)),
                }
            })
            .unwrap_or(Err(MetadataError::UnknownRequest { id: token.id }));
        self.flush(&el, ready);
        outcome
    }

    /// Write-locks the whole object.
    pub fn lock_all(
        &self,
        handle: ElementHandle,
        options: LockOptions,
    ) -> MetadataResult<LockTicket> {
        self.lock(handle, LockMode::Write, Self::whole_object(), options)
    }

    /// Releases a lock taken with [`LockDomain::lock_all`].
    pub fn unlock_all(
        &self,
        handle: ElementHandle,
        token: RequestToken,
    ) -> MetadataResult<Completion<LockStatus>> {
        self.unlock(handle, token)
    }

    /// Attaches the element's blob to peer traffic and announces it.
    pub fn stripe_lock_start(&self, handle: ElementHandle) -> MetadataResult<()> {
        let el = self.element(handle)?;
        el.blob.set_started(true);
        self.transmit(
            self.header(&el),
            MessageBody::StripeLock(StripeLockMessage::Start),
            InFlight::Control,
        );
        info!(object_id = el.object_id(), "stripe lock blob attached");
        self.reschedule(&el);
        Ok(())
    }

    /// Detaches the element's blob from peer traffic.
    pub fn stripe_lock_stop(&self, handle: ElementHandle) -> MetadataResult<()> {
        let el = self.element(handle)?;
        if el.blob.is_started() {
            self.transmit(
                self.header(&el),
                MessageBody::StripeLock(StripeLockMessage::Stop),
                InFlight::Control,
            );
        }
        el.blob.set_started(false);
        info!(object_id = el.object_id(), "stripe lock blob detached");
        Ok(())
    }

    /// Aborts future monitor operations and one waiting monitor request.
    ///
    /// With `abort_peer` the victim is a monitor request from the peer, which
    /// is told its request was aborted. Returns true if a request was found.
    pub fn abort_monitor_ops(&self, handle: ElementHandle, abort_peer: bool) -> MetadataResult<bool> {
        let el = self.element(handle)?;
        el.attributes.set_abort_monitor_ops();
        let mut ready = Ready::default();
        let mut found = false;
        {
            let mut guard = el.table.lock_all();
            'entries: for entry in guard.entries_mut() {
                for id in entry.waiting_ids() {
                    let Some(sl) = entry.requests.get(&id) else {
                        continue;
                    };
                    if !sl.monitor_op || sl.is_peer() != abort_peer || sl.waiting_for_peer() {
                        continue;
                    }
                    if abort_peer {
                        if let Some(request) = sl.request_token {
                            ready.send(
                                StripeLockMessage::Aborted {
                                    request,
                                    flags: CmiLockFlags::empty(),
                                },
                                InFlight::Control,
                            );
                        }
                        el.stats.inc_abort();
                        self.take_off(&el, entry, id, &mut ready);
                    } else {
                        self.finish_detached(&el, entry, id, LockStatus::Aborted, &mut ready);
                    }
                    self.handle_exhausted(&el, entry, &mut ready);
                    found = true;
                    break 'entries;
                }
            }
        }
        if found {
            info!(object_id = el.object_id(), abort_peer, "monitor operation aborted");
        }
        self.flush(&el, ready);
        Ok(found)
    }

    /// Completes every cancelled request not yet handed to the peer.
    /// Returns how many were completed.
    pub fn complete_cancelled(&self, handle: ElementHandle) -> MetadataResult<usize> {
        let el = self.element(handle)?;
        let mut ready = Ready::default();
        let mut count = 0;
        {
            let mut guard = el.table.lock_all();
            for entry in guard.entries_mut() {
                let mut ids = entry.waiting_ids();
                ids.extend(parked_locals(entry));
                for id in ids {
                    let cancelled = entry.requests.get(&id).is_some_and(|sl| {
                        !sl.is_peer()
                            && !sl.waiting_for_peer()
                            && !sl.is_reported()
                            && sl.is_cancelled()
                    });
                    if cancelled {
                        self.finish_detached(&el, entry, id, LockStatus::Cancelled, &mut ready);
                        count += 1;
                    }
                }
                self.handle_exhausted(&el, entry, &mut ready);
            }
        }
        self.flush(&el, ready);
        Ok(count)
    }

    /// Requests on the element plus peer work not yet dispatched.
    pub fn outstanding_stripe_lock_request(&self, handle: ElementHandle) -> MetadataResult<usize> {
        let el = self.element(handle)?;
        let held = el.table.lock_all().request_count();
        Ok(held + el.blob.pending())
    }

    pub fn is_quiesced(&self, handle: ElementHandle) -> MetadataResult<bool> {
        Ok(self.outstanding_stripe_lock_request(handle)? == 0)
    }

    /// Locks currently held by local callers.
    pub fn granted_locks(&self, handle: ElementHandle) -> MetadataResult<Vec<GrantedLock>> {
        let el = self.element(handle)?;
        let mut out = Vec::new();
        el.table.for_each_entry(|entry| {
            out.extend(
                entry
                    .requests
                    .values()
                    .filter(|sl| !sl.is_peer() && sl.is_reported() && sl.status == LockStatus::Ok)
                    .map(|sl| GrantedLock {
                        token: sl.token(),
                        mode: sl.mode(),
                        stripe: sl.stripe,
                    }),
            );
        });
        out.sort_by_key(|g| (g.stripe.first, g.token.id));
        Ok(out)
    }

    /// Runs peer-loss recovery for one element.
    pub fn peer_lost(&self, handle: ElementHandle) -> MetadataResult<()> {
        let el = self.element(handle)?;
        self.peer_lost_element(&el);
        Ok(())
    }

    /// Grants the data locks held back after peer loss, once the write log
    /// has been flushed.
    pub fn release_peer_data_stripe_locks(&self, handle: ElementHandle) -> MetadataResult<()> {
        let el = self.element(handle)?;
        el.attributes.clear_sl_peer_lost();
        el.table.reset_slices(SliceState::ExclusiveLocal);
        let mut ready = Ready::default();
        let mut released = 0;
        {
            let mut guard = el.table.lock_all();
            for entry in guard.entries_mut() {
                let roots = entry.queue.clone();
                for id in collect_tree(entry, &roots) {
                    let held = entry
                        .requests
                        .get(&id)
                        .is_some_and(|sl| sl.is_peer() && sl.flags.contains(RequestFlags::PEER_LOST));
                    if held {
                        self.take_off(&el, entry, id, &mut ready);
                        released += 1;
                    }
                }
                for id in parked_locals(entry) {
                    let Some(sl) = entry.requests.get_mut(&id) else {
                        continue;
                    };
                    if !sl.flags.contains(RequestFlags::PEER_LOST) {
                        continue;
                    }
                    sl.flags
                        .remove(RequestFlags::PEER_LOST | RequestFlags::PEER_COLLISION);
                    if sl.is_local_grant() {
                        complete(&el, sl, LockStatus::Ok, &mut ready);
                    }
                    released += 1;
                }
                self.handle_exhausted(&el, entry, &mut ready);
            }
        }
        info!(object_id = el.object_id(), released, "peer data stripe locks released");
        self.flush(&el, ready);
        Ok(())
    }

    // ---- engine internals ----

    /// Runs `f` on the entry holding `token`'s request.
    ///
    /// Requests normally live in the entry their first stripe maps to. A
    /// waiter can follow its holder into another shard when the hash is
    /// re-enabled, so a miss falls back to a whole-table search.
    pub(crate) fn with_entry<R>(
        &self,
        el: &MetadataElement,
        token: RequestToken,
        f: impl FnOnce(&mut SliceEntry) -> R,
    ) -> Option<R> {
        {
            let mut entry = el.table.entry(token.first, &el.attributes);
            if entry.requests.contains_key(&token.id) {
                return Some(f(&mut entry));
            }
        }
        let mut guard = el.table.lock_all();
        let entry = guard
            .entries_mut()
            .into_iter()
            .find(|e| e.requests.contains_key(&token.id))?;
        Some(f(entry))
    }

    /// Element policy verdict for a new or re-dispatched request.
    fn gate(&self, el: &MetadataElement, sl: &LockRequest) -> Option<LockStatus> {
        let attrs = el.attributes.load();
        if sl.is_cancelled() {
            return Some(LockStatus::Cancelled);
        }
        if attrs.contains(ElementAttr::DESTROY_ABORT_STRIPE_LOCKS) {
            return Some(LockStatus::Aborted);
        }
        if attrs.contains(ElementAttr::ABORT_STRIPE_LOCKS) && !sl.is_np() {
            return Some(LockStatus::Aborted);
        }
        if sl.monitor_op && !sl.is_np() && !sl.is_paged() {
            if attrs.contains(ElementAttr::ABORT_MONITOR_OPS) || attrs.contains(ElementAttr::SL_PEER_LOST) {
                return Some(LockStatus::Aborted);
            }
        }
        None
    }

    /// Verdict for a waiter popped off a released holder.
    fn short_circuit(&self, el: &MetadataElement, sl: &LockRequest) -> Option<LockStatus> {
        if sl.is_peer() || sl.need_release() || sl.waiting_for_peer() {
            return None;
        }
        if sl.is_cancelled() {
            return Some(LockStatus::Cancelled);
        }
        let attrs = el.attributes.load();
        if attrs.contains(ElementAttr::DESTROY_ABORT_STRIPE_LOCKS)
            || (attrs.contains(ElementAttr::ABORT_STRIPE_LOCKS) && !sl.is_np())
            || (attrs.contains(ElementAttr::ABORT_MONITOR_OPS) && sl.monitor_op)
        {
            return Some(LockStatus::Aborted);
        }
        None
    }

    /// Merges the shards for a request spanning slices.
    pub(crate) fn make_large(&self, el: &MetadataElement, sl: &mut LockRequest) {
        let mut guard = el.table.lock_all();
        if !el.attributes.is_hash_disabled() {
            el.table.disable_hash(&mut guard);
            el.attributes.set_hash_disabled();
        }
        sl.priv_flags.insert(PrivateFlags::LARGE);
        el.inc_large();
    }

    pub(crate) fn release_large(&self, el: &MetadataElement, sl: &mut LockRequest, ready: &mut Ready) {
        if !sl.priv_flags.contains(PrivateFlags::LARGE) {
            return;
        }
        sl.priv_flags.remove(PrivateFlags::LARGE);
        if el.dec_large() == 0 {
            el.blob.request_hash_enable();
            ready.reschedule = true;
        }
    }

    /// Follows up a request that just became top-level.
    pub(crate) fn on_granted(
        &self,
        el: &MetadataElement,
        entry: &mut SliceEntry,
        id: RequestId,
        ready: &mut Ready,
    ) {
        let Some(sl) = entry.requests.get_mut(&id) else {
            return;
        };
        if sl.is_peer() {
            self.mark_grant_to_peer(el, sl);
            ready.reschedule = true;
            return;
        }
        if self.check_peer(el, sl) {
            complete(el, sl, LockStatus::Ok, ready);
        } else {
            el.stats.inc_collision();
            self.send_request_sl(el, sl, ready);
        }
    }

    /// True when slice ownership lets `sl` complete without the peer.
    pub(crate) fn check_peer(&self, el: &MetadataElement, sl: &mut LockRequest) -> bool {
        if sl.waiting_for_peer() {
            return false;
        }
        if sl.grant_token.is_some() && sl.need_release() {
            sl.flags.remove(RequestFlags::PEER_COLLISION);
            return true;
        }
        let states = el.table.slice_states(&sl.stripe);
        let blocked = if sl.is_read() {
            states.contains(&SliceState::ExclusivePeer)
        } else {
            states.iter().any(|s| *s != SliceState::ExclusiveLocal)
        };
        sl.flags.set(RequestFlags::PEER_COLLISION, blocked);
        !blocked
    }

    /// Hands the slices under a granted peer request to the peer.
    pub(crate) fn mark_grant_to_peer(&self, el: &MetadataElement, sl: &mut LockRequest) {
        if self.peer_alive(el) && !sl.need_release() {
            let region = sl.own_region();
            if sl.is_read() {
                el.table.update_slices(&region, |s| match s {
                    SliceState::ExclusiveLocal => SliceState::Shared,
                    other => other,
                });
            } else {
                el.table
                    .update_slices(&region, |_| SliceState::ExclusivePeer);
            }
        }
        sl.flags.insert(RequestFlags::GRANT);
    }

    /// Takes ownership of the slices the peer just granted.
    pub(crate) fn mark_grant_from_peer(&self, el: &MetadataElement, sl: &LockRequest) {
        if sl.is_read() {
            el.table.update_slices(&sl.stripe, |s| match s {
                SliceState::ExclusivePeer => SliceState::Shared,
                other => other,
            });
        } else {
            el.table
                .update_slices(&sl.stripe, |_| SliceState::ExclusiveLocal);
        }
    }

    /// Asks the peer for `sl`'s range, or settles it locally when there is
    /// no peer to ask.
    pub(crate) fn send_request_sl(&self, el: &MetadataElement, sl: &mut LockRequest, ready: &mut Ready) {
        if sl.waiting_for_peer() {
            return;
        }
        if !self.peer_alive(el) {
            if el.attributes.is_sl_peer_lost() && sl.class == LockClass::Data {
                sl.flags.insert(RequestFlags::PEER_LOST);
                debug!(object_id = el.object_id(), request = sl.id, "data lock held until peer data released");
                return;
            }
            self.grant_without_peer(el, sl, ready);
            return;
        }
        let Some(permit) = self.pool.acquire() else {
            ready.exhausted.push(sl.id);
            return;
        };
        sl.flags.insert(RequestFlags::WAITING_FOR_PEER);
        let mut flags = sl.class.wire_flags();
        if sl.monitor_op {
            flags.insert(CmiLockFlags::MONITOR_OP);
        }
        el.blob.push(PeerWork::Outgoing(OutgoingRequest {
            request: sl.token(),
            mode: sl.mode(),
            region: sl.stripe,
            flags,
            permit,
        }));
        ready.reschedule = true;
    }

    /// Settles `sl` as if the peer had granted its slices.
    pub(crate) fn grant_without_peer(&self, el: &MetadataElement, sl: &mut LockRequest, ready: &mut Ready) {
        el.table
            .update_slices(&sl.stripe, |_| SliceState::ExclusiveLocal);
        sl.flags
            .remove(RequestFlags::PEER_COLLISION | RequestFlags::PEER_LOST);
        if sl.is_local_grant() {
            complete(el, sl, LockStatus::Ok, ready);
        }
    }

    /// Re-evaluates requests left without a holder.
    pub(crate) fn dispatch(
        &self,
        el: &MetadataElement,
        entry: &mut SliceEntry,
        waiters: VecDeque<RequestId>,
        ready: &mut Ready,
    ) {
        let mut work = waiters;
        while let Some(id) = work.pop_front() {
            let Some(sl) = entry.requests.get(&id) else {
                continue;
            };
            if let Some(status) = self.short_circuit(el, sl) {
                if let Some(mut sl) = entry.requests.remove(&id) {
                    work.extend(sl.wait_queue.drain(..));
                    self.release_large(el, &mut sl, ready);
                    complete(el, &mut sl, status, ready);
                }
                continue;
            }
            let result = entry.insert(id, el.is_active());
            el.stats.add_deadlocks(result.deadlocks_broken);
            if result.granted {
                self.on_granted(el, entry, id, ready);
            }
        }
    }

    /// Removes `id` from the entry and re-dispatches whatever waited on it.
    pub(crate) fn take_off(
        &self,
        el: &MetadataElement,
        entry: &mut SliceEntry,
        id: RequestId,
        ready: &mut Ready,
    ) -> Option<LockRequest> {
        let Detached {
            mut request,
            orphans,
        } = entry.detach(id)?;
        self.release_large(el, &mut request, ready);
        if !orphans.is_empty() {
            self.dispatch(el, entry, orphans, ready);
        }
        Some(request)
    }

    /// Takes a local request off the entry and completes it with `status`.
    pub(crate) fn finish_detached(
        &self,
        el: &MetadataElement,
        entry: &mut SliceEntry,
        id: RequestId,
        status: LockStatus,
        ready: &mut Ready,
    ) {
        if let Some(mut sl) = self.take_off(el, entry, id, ready) {
            sl.flags
                .remove(RequestFlags::WAITING_FOR_PEER | RequestFlags::PEER_COLLISION);
            complete(el, &mut sl, status, ready);
            el.awaiting.lock().remove(&id);
        }
    }

    /// Aborts requests that needed a shadow while the pool was empty.
    pub(crate) fn handle_exhausted(&self, el: &MetadataElement, entry: &mut SliceEntry, ready: &mut Ready) {
        while let Some(id) = ready.exhausted.pop() {
            debug!(object_id = el.object_id(), request = id, "no shadow for peer request");
            self.finish_detached(el, entry, id, LockStatus::Aborted, ready);
        }
    }

    /// Releases the batch gathered under table locks.
    pub(crate) fn flush(&self, el: &MetadataElement, ready: Ready) {
        let Ready {
            completions,
            outbound,
            exhausted,
            reschedule,
        } = ready;
        if !exhausted.is_empty() {
            warn!(object_id = el.object_id(), count = exhausted.len(), "unhandled exhausted requests");
        }
        for (body, in_flight) in outbound {
            self.transmit(self.header(el), body, in_flight);
        }
        if reschedule {
            self.reschedule(el);
        }
        for (completer, status) in completions {
            completer.complete(status);
        }
    }

    /// Aborts waiting requests; with `destroy` peer requests too.
    pub(crate) fn abort_waiters(&self, el: &MetadataElement, destroy: bool) {
        let mut ready = Ready::default();
        let mut aborted = 0usize;
        {
            let mut guard = el.table.lock_all();
            for entry in guard.entries_mut() {
                let mut ids = entry.waiting_ids();
                ids.extend(parked_locals(entry));
                for id in ids {
                    let Some(sl) = entry.requests.get(&id) else {
                        continue;
                    };
                    if sl.waiting_for_peer() {
                        continue;
                    }
                    if sl.is_peer() {
                        if !destroy || entry.queue.contains(&id) {
                            continue;
                        }
                        if let Some(request) = sl.request_token {
                            ready.send(
                                StripeLockMessage::Aborted {
                                    request,
                                    flags: CmiLockFlags::ABORT_DESTROY,
                                },
                                InFlight::Control,
                            );
                        }
                        el.stats.inc_abort();
                        self.take_off(el, entry, id, &mut ready);
                        aborted += 1;
                    } else if !sl.is_reported() && (destroy || !sl.is_np()) {
                        self.finish_detached(el, entry, id, LockStatus::Aborted, &mut ready);
                        aborted += 1;
                    }
                }
                self.handle_exhausted(el, entry, &mut ready);
            }
        }
        if aborted > 0 {
            el.attributes.set_aborted_requests_present();
            info!(object_id = el.object_id(), aborted, destroy, "stripe locks aborted");
        }
        self.flush(el, ready);
    }

    /// Removes every request; callers still waiting are told `Aborted`.
    pub(crate) fn drop_all_requests(&self, el: &MetadataElement) -> usize {
        let mut ready = Ready::default();
        let mut dropped = 0;
        {
            let mut guard = el.table.lock_all();
            for entry in guard.entries_mut() {
                entry.queue.clear();
                for (_, mut sl) in entry.requests.drain() {
                    dropped += 1;
                    self.release_large(el, &mut sl, &mut ready);
                    complete(el, &mut sl, LockStatus::Aborted, &mut ready);
                }
            }
        }
        self.flush(el, ready);
        dropped
    }

    /// Lock-side recovery after the peer went away. Running it again on the
    /// same element changes nothing.
    ///
    /// Metadata locks parked on the peer are granted. Data locks are held
    /// `PEER_LOST` until the peer's data is released, unless they are
    /// monitor operations or the element is aborting, which fail them.
    pub(crate) fn peer_lost_element(&self, el: &MetadataElement) {
        el.attributes.set(
            ElementAttr::PEER_DEAD | ElementAttr::SL_PEER_LOST | ElementAttr::ABORT_MONITOR_OPS,
        );
        el.attributes.clear_peer_persist_pending();
        el.set_peer_handle(ElementHandle::NULL);
        el.clear_peer_memory();
        let stale = el.blob.drain();
        el.awaiting.lock().clear();

        let aborting = el
            .attributes
            .intersects(ElementAttr::DESTROY_ABORT_STRIPE_LOCKS | ElementAttr::ABORT_STRIPE_LOCKS);
        let mut ready = Ready::default();
        let mut dropped = 0usize;
        {
            let mut guard = el.table.lock_all();
            for entry in guard.entries_mut() {
                dropped += self.drop_peer_shadows(el, entry, &mut ready);
                for sl in entry.requests.values_mut() {
                    if !sl.is_peer() {
                        sl.flags
                            .remove(RequestFlags::DEAD_LOCK | RequestFlags::WAITING_FOR_PEER);
                    }
                }
                for id in parked_locals(entry) {
                    let Some(sl) = entry.requests.get_mut(&id) else {
                        continue;
                    };
                    if !sl.is_local_grant() {
                        continue;
                    }
                    if sl.class != LockClass::Data {
                        self.grant_without_peer(el, sl, &mut ready);
                    } else if sl.monitor_op || aborting {
                        self.finish_detached(el, entry, id, LockStatus::Aborted, &mut ready);
                    } else {
                        sl.flags.insert(RequestFlags::PEER_LOST);
                    }
                }
                self.handle_exhausted(el, entry, &mut ready);
            }
        }
        drop(stale);
        warn!(object_id = el.object_id(), dropped, "peer lost");
        self.flush(el, ready);
    }

    /// Drops peer shadows the dead peer can no longer use. Need-release
    /// grants of data locks stay, marked `PEER_LOST`; metadata and monitor
    /// grants go with the peer.
    fn drop_peer_shadows(&self, el: &MetadataElement, entry: &mut SliceEntry, ready: &mut Ready) -> usize {
        let roots = entry.queue.clone();
        let mut dropped = 0;
        for id in collect_tree(entry, &roots) {
            let top = entry.queue.contains(&id);
            let Some(sl) = entry.requests.get_mut(&id) else {
                continue;
            };
            if !sl.is_peer() {
                continue;
            }
            let held = top && sl.flags.contains(RequestFlags::GRANTED) && sl.need_release();
            if held && !sl.monitor_op && sl.class == LockClass::Data {
                sl.flags.insert(RequestFlags::PEER_LOST);
                continue;
            }
            self.take_off(el, entry, id, ready);
            dropped += 1;
        }
        dropped
    }
}
