//! Ordered lock queue: sorted insertion, overlap detection and deadlock
//! breaking.
//!
//! A top-level request is granted locally; everything else waits on the
//! wait queue of the top-level request it collides with. Each top-level
//! request's reflected regions are widened to cover its waiters, so a newcomer
//! only needs to compare against the top level.
//!
//! The scan restarts from the front whenever a peer request's reflected
//! region shrinks, because entries already passed may now sort differently.

use std::collections::VecDeque;
use tracing::debug;
use twinlock_cmi::{CmiLockFlags, StripeRegion};

use crate::flags::{PrivateFlags, RequestFlags};
use crate::request::{LockRequest, RequestId};
use crate::slice::SliceEntry;

/// Restartable position in a top-level queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueCursor {
    pos: usize,
}

impl QueueCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back to the front.
    pub fn restart(&mut self) {
        self.pos = 0;
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn current(&self, queue: &[RequestId]) -> Option<RequestId> {
        queue.get(self.pos).copied()
    }

    pub fn advance(&mut self) {
        self.pos += 1;
    }

    /// Removes the current element; the cursor then rests on its successor.
    pub fn remove_current(&mut self, queue: &mut Vec<RequestId>) -> Option<RequestId> {
        if self.pos < queue.len() {
            Some(queue.remove(self.pos))
        } else {
            None
        }
    }
}

/// State carried across one insertion scan.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ScanState {
    /// Entry the newcomer must be placed in front of.
    pub overlap_at: Option<RequestId>,
    pub read_overlap: bool,
    /// A reflected region shrank; restart the scan.
    pub reinsert: bool,
}

/// Result of [`SliceEntry::insert`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InsertResult {
    /// The request is now top-level.
    pub granted: bool,
    /// Local requests pulled out of the queue to yield to a peer request.
    pub deadlocks_broken: usize,
}

/// Widens `to`'s reflected region for `read` to cover `stripe`.
fn widen(to: &mut LockRequest, read: bool, stripe: &StripeRegion) {
    if read {
        to.read_region.widen_to(stripe);
    } else {
        to.write_region.widen_to(stripe);
    }
}

/// Widens `to`'s reflected region to cover `from`'s stripe range.
pub(crate) fn update_region(from: &LockRequest, to: &mut LockRequest) {
    widen(to, from.is_read(), &from.stripe);
}

/// True when `sl1` sorts after `sl2` and everything `sl2` reflects.
pub(crate) fn check_sorted(sl1: &LockRequest, sl2: &LockRequest) -> bool {
    let key = if sl1.is_peer() && !sl1.need_release() {
        sl1.own_region().first
    } else {
        sl1.stripe.first
    };
    key > sl2.stripe.last
        && (!sl2.read_region.is_valid() || key > sl2.read_region.last)
        && (!sl2.write_region.is_valid() || key > sl2.write_region.last)
}

/// Flags a read that extends past everything `sl2` reflects.
pub(crate) fn set_read_overlap(sl1: &LockRequest, sl2: &LockRequest, scan: &mut ScanState) {
    let last = sl1.stripe.last;
    if (!sl2.read_region.is_valid() || last > sl2.read_region.last)
        && (!sl2.write_region.is_valid() || last > sl2.write_region.last)
    {
        scan.read_overlap = true;
    }
}

/// Shrinks a peer request's reflected region to its exact range.
fn shrink_to_exact(sl1: &mut LockRequest, scan: &mut ScanState) {
    if sl1.is_read() {
        sl1.read_region = sl1.stripe;
    } else {
        sl1.write_region = sl1.stripe;
    }
    sl1.cmi_flags.insert(CmiLockFlags::NEED_RELEASE);
    scan.reinsert = true;
}

/// Returns true when `sl1` must wait for `sl2`.
///
/// Argument order matters: only `sl1`'s regions are ever shrunk.
pub(crate) fn check_overlap(sl1: &mut LockRequest, sl2: &LockRequest, scan: &mut ScanState) -> bool {
    if sl1.is_read() {
        if sl1.is_peer() {
            if sl1.read_region.overlaps(&sl2.write_region) {
                if sl2.is_peer() {
                    set_read_overlap(sl1, sl2, scan);
                    return false;
                }
                if sl1.need_release() {
                    return true;
                }
                shrink_to_exact(sl1, scan);
                if sl1.read_region.overlaps(&sl2.write_region) {
                    return true;
                }
            }
            if sl1.read_region.overlaps(&sl2.read_region)
                && sl1.read_region.last > sl2.read_region.last
            {
                scan.read_overlap = true;
            }
            if sl1.need_release() {
                set_read_overlap(sl1, sl2, scan);
            }
            return false;
        }
        if sl1.stripe.overlaps(&sl2.write_region) {
            return true;
        }
        if sl1.read_region.overlaps(&sl2.read_region) && sl1.read_region.last > sl2.read_region.last {
            scan.read_overlap = true;
        }
        return false;
    }

    if sl1.is_peer() {
        let hits = |r: &StripeRegion| r.overlaps(&sl2.write_region) || r.overlaps(&sl2.read_region);
        if hits(&sl1.write_region) {
            if sl2.is_peer() {
                set_read_overlap(sl1, sl2, scan);
                return false;
            }
            if sl1.need_release() {
                return true;
            }
            shrink_to_exact(sl1, scan);
            if hits(&sl1.write_region) {
                return true;
            }
        }
        if sl1.need_release() {
            set_read_overlap(sl1, sl2, scan);
        }
        return false;
    }

    sl1.stripe.overlaps(&sl2.write_region) || sl1.stripe.overlaps(&sl2.read_region)
}

/// A request taken off an entry.
#[derive(Debug)]
pub(crate) struct Detached {
    pub request: LockRequest,
    /// Waiters left without a holder; the caller dispatches them.
    pub orphans: VecDeque<RequestId>,
}

impl SliceEntry {
    fn position_of(&self, id: Option<RequestId>) -> Option<usize> {
        let id = id?;
        self.queue.iter().position(|q| *q == id)
    }

    /// Moves top-level `id` in front of `before`.
    fn move_before(&mut self, id: RequestId, before: Option<RequestId>) {
        let Some(before) = before else {
            return;
        };
        if id == before {
            return;
        }
        let Some(from) = self.queue.iter().position(|q| *q == id) else {
            return;
        };
        self.queue.remove(from);
        let to = self.position_of(Some(before)).unwrap_or(self.queue.len());
        self.queue.insert(to, id);
    }

    fn region_info(&self, ids: &[RequestId]) -> Vec<(bool, StripeRegion)> {
        ids.iter()
            .filter_map(|id| self.requests.get(id))
            .map(|r| (r.is_read(), r.stripe))
            .collect()
    }

    /// Places request `id` (already in the request map) on the queue.
    ///
    /// Returns `granted` when the request became top-level; otherwise it
    /// was parked on the wait queue of the entry it collided with.
    pub fn insert(&mut self, id: RequestId, node_active: bool) -> InsertResult {
        let mut result = InsertResult::default();
        let Some(mut sl) = self.requests.remove(&id) else {
            return result;
        };
        if !sl.is_peer() && sl.wait_queue.is_empty() {
            sl.set_region();
        }

        let mut scan = ScanState::default();
        let mut deadlocked: Vec<RequestId> = Vec::new();
        let mut cursor = QueueCursor::new();

        while let Some(cur_id) = cursor.current(&self.queue) {
            let Some(cur) = self.requests.get_mut(&cur_id) else {
                cursor.remove_current(&mut self.queue);
                continue;
            };

            if check_sorted(&sl, cur) {
                let pos = self
                    .position_of(scan.overlap_at)
                    .unwrap_or(cursor.position());
                self.queue.insert(pos, id);
                for tmp_id in deadlocked.drain(..) {
                    if let Some(tmp) = self.requests.get_mut(&tmp_id) {
                        update_region(&sl, tmp);
                    }
                    sl.wait_queue.push_back(tmp_id);
                }
                sl.priv_flags.insert(PrivateFlags::LOCAL_GRANT);
                self.requests.insert(id, sl);
                result.granted = true;
                return result;
            }

            let overlap = check_overlap(&mut sl, cur, &mut scan);

            if scan.reinsert {
                scan = ScanState::default();
                if !sl.is_peer() {
                    sl.set_region();
                }
                cursor.restart();
                continue;
            }

            if overlap {
                if sl.is_peer() && cur.waiting_for_peer() && !cur.is_peer() && !node_active {
                    cur.flags.insert(RequestFlags::DEAD_LOCK);
                    cur.flags.remove(RequestFlags::PEER_COLLISION);
                    cur.priv_flags.remove(PrivateFlags::LOCAL_GRANT);
                    cur.set_region();
                    let waiters: Vec<RequestId> = cur.wait_queue.drain(..).collect();
                    cursor.remove_current(&mut self.queue);
                    debug!(victim = cur_id, peer = id, "deadlock broken in favour of peer request");
                    deadlocked.push(cur_id);
                    deadlocked.extend(waiters);
                    result.deadlocks_broken += 1;
                    continue;
                }

                if sl.is_peer() && !node_active {
                    cur.flags.insert(RequestFlags::HOLDING_PEER);
                    update_region(&sl, cur);
                    if deadlocked.is_empty() {
                        cur.wait_queue.push_front(id);
                    } else {
                        cur.wait_queue.push_back(id);
                        let infos = self.region_info(&deadlocked);
                        if let Some(cur) = self.requests.get_mut(&cur_id) {
                            for (read, stripe) in infos {
                                widen(cur, read, &stripe);
                            }
                            cur.wait_queue.extend(deadlocked.drain(..));
                        }
                    }
                } else {
                    update_region(&sl, cur);
                    cur.wait_queue.push_back(id);
                }
                self.move_before(cur_id, scan.overlap_at);
                self.requests.insert(id, sl);
                return result;
            }

            if scan.read_overlap && scan.overlap_at.is_none() {
                scan.overlap_at = Some(cur_id);
                scan.read_overlap = false;
            }
            cursor.advance();
        }

        for (read, stripe) in self.region_info(&deadlocked) {
            widen(&mut sl, read, &stripe);
        }
        sl.wait_queue.extend(deadlocked.drain(..));
        let pos = self
            .position_of(scan.overlap_at)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, id);
        sl.priv_flags.insert(PrivateFlags::LOCAL_GRANT);
        self.requests.insert(id, sl);
        result.granted = true;
        result
    }

    /// Request whose wait queue holds `id`.
    pub fn find_parent(&self, id: RequestId) -> Option<RequestId> {
        self.requests
            .iter()
            .find(|(_, r)| r.wait_queue.contains(&id))
            .map(|(pid, _)| *pid)
    }

    /// Takes `id` off the entry wherever it sits.
    ///
    /// A top-level request leaves its waiters as orphans; a waiting request
    /// hands its own waiters to its holder.
    pub fn detach(&mut self, id: RequestId) -> Option<Detached> {
        if let Some(pos) = self.queue.iter().position(|q| *q == id) {
            self.queue.remove(pos);
            let mut request = self.requests.remove(&id)?;
            request.priv_flags.remove(PrivateFlags::LOCAL_GRANT);
            let orphans = std::mem::take(&mut request.wait_queue);
            return Some(Detached { request, orphans });
        }
        let parent = self.find_parent(id);
        let mut request = self.requests.remove(&id)?;
        let waiters = std::mem::take(&mut request.wait_queue);
        if let Some(parent) = parent.and_then(|p| self.requests.get_mut(&p)) {
            parent.wait_queue.retain(|w| *w != id);
            parent.wait_queue.extend(waiters);
        }
        Some(Detached {
            request,
            orphans: VecDeque::new(),
        })
    }

    /// Every request parked on some wait queue, in queue order.
    pub fn waiting_ids(&self) -> Vec<RequestId> {
        let roots = self.queue.clone();
        crate::slice::collect_tree(self, &roots)
            .into_iter()
            .filter(|id| !roots.contains(id))
            .collect()
    }

    /// Checks that every request is reachable exactly once from the queue.
    #[cfg(test)]
    pub fn check_structure(&self) -> bool {
        let roots = self.queue.clone();
        let all = crate::slice::collect_tree(self, &roots);
        let mut seen = std::collections::HashSet::new();
        all.iter().all(|id| seen.insert(*id)) && all.len() == self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Completion;
    use crate::pool::ShadowPool;
    use crate::request::LockOptions;
    use twinlock_cmi::{LockMode, RequestToken};

    fn local(id: RequestId, mode: LockMode, first: u64, last: u64) -> LockRequest {
        let (tx, _rx) = Completion::channel();
        LockRequest::local(
            id,
            mode,
            StripeRegion::new(first, last),
            &LockOptions::default(),
            tx,
        )
    }

    fn peer(pool: &ShadowPool, id: RequestId, mode: LockMode, stripe: (u64, u64), region: (u64, u64)) -> LockRequest {
        LockRequest::peer(
            id,
            mode,
            StripeRegion::new(stripe.0, stripe.1),
            StripeRegion::new(region.0, region.1),
            RequestToken::new(id + 1000, stripe.0),
            pool.acquire().unwrap(),
        )
    }

    fn add(entry: &mut SliceEntry, req: LockRequest, active: bool) -> InsertResult {
        let id = req.id;
        entry.requests.insert(id, req);
        entry.insert(id, active)
    }

    #[test]
    fn test_cursor_restart_and_remove() {
        let mut queue = vec![1, 2, 3];
        let mut cursor = QueueCursor::new();
        cursor.advance();
        assert_eq!(cursor.current(&queue), Some(2));
        assert_eq!(cursor.remove_current(&mut queue), Some(2));
        assert_eq!(cursor.current(&queue), Some(3));
        cursor.advance();
        assert_eq!(cursor.current(&queue), None);
        assert_eq!(cursor.remove_current(&mut queue), None);
        cursor.restart();
        assert_eq!(cursor.current(&queue), Some(1));
    }

    #[test]
    fn test_disjoint_writes_granted_highest_first() {
        let mut e = SliceEntry::default();
        assert!(add(&mut e, local(1, LockMode::Write, 10, 20), true).granted);
        assert!(add(&mut e, local(2, LockMode::Write, 0, 5), true).granted);
        assert!(add(&mut e, local(3, LockMode::Write, 30, 40), true).granted);
        assert_eq!(e.queue, vec![3, 1, 2]);
        assert!(e.check_structure());
    }

    #[test]
    fn test_sorted_placement() {
        let mut e = SliceEntry::default();
        add(&mut e, local(1, LockMode::Write, 0, 5), true);
        add(&mut e, local(2, LockMode::Write, 10, 20), true);
        assert!(add(&mut e, local(3, LockMode::Write, 6, 8), true).granted);
        assert_eq!(e.queue, vec![2, 3, 1]);
    }

    #[test]
    fn test_overlapping_write_waits() {
        let mut e = SliceEntry::default();
        add(&mut e, local(1, LockMode::Write, 100, 110), true);
        let r = add(&mut e, local(2, LockMode::Write, 105, 115), true);
        assert!(!r.granted);
        let holder = &e.requests[&1];
        assert_eq!(holder.wait_queue, VecDeque::from(vec![2]));
        assert_eq!(holder.write_region, StripeRegion::new(100, 115));
        assert!(!e.requests[&2].is_local_grant());
        assert!(e.check_structure());
    }

    #[test]
    fn test_reads_share() {
        let mut e = SliceEntry::default();
        assert!(add(&mut e, local(1, LockMode::Read, 0, 10), true).granted);
        // Extends past the first read, so it is placed in front of it.
        assert!(add(&mut e, local(2, LockMode::Read, 5, 15), true).granted);
        assert_eq!(e.queue, vec![2, 1]);
        assert!(!add(&mut e, local(3, LockMode::Write, 12, 12), true).granted);
        assert!(add(&mut e, local(4, LockMode::Read, 3, 3), true).granted);
        assert_eq!(e.queue, vec![2, 1, 4]);
    }

    #[test]
    fn test_read_waits_behind_write() {
        let mut e = SliceEntry::default();
        add(&mut e, local(1, LockMode::Write, 0, 10), true);
        assert!(!add(&mut e, local(2, LockMode::Read, 10, 12), true).granted);
        assert_eq!(e.requests[&1].read_region, StripeRegion::new(10, 12));
    }

    #[test]
    fn test_waiter_widening_blocks_later_requests() {
        let mut e = SliceEntry::default();
        add(&mut e, local(1, LockMode::Write, 0, 10), true);
        add(&mut e, local(2, LockMode::Write, 5, 20), true);
        // Overlaps only the waiter, still queued behind the holder.
        assert!(!add(&mut e, local(3, LockMode::Write, 15, 16), true).granted);
        assert_eq!(e.requests[&1].wait_queue, VecDeque::from(vec![2, 3]));
    }

    #[test]
    fn test_peer_request_shrinks_to_exact() {
        let pool = ShadowPool::new(4);
        let mut e = SliceEntry::default();
        add(&mut e, local(1, LockMode::Write, 10, 12), true);
        let r = add(&mut e, peer(&pool, 2, LockMode::Write, (20, 21), (0, 0x7ff)), true);
        assert!(r.granted);
        let sl = &e.requests[&2];
        assert!(sl.need_release());
        assert_eq!(sl.write_region, StripeRegion::new(20, 21));
        assert_eq!(e.queue, vec![2, 1]);
    }

    #[test]
    fn test_peer_request_needs_release_and_waits() {
        let pool = ShadowPool::new(4);
        let mut e = SliceEntry::default();
        add(&mut e, local(1, LockMode::Write, 10, 12), true);
        let r = add(&mut e, peer(&pool, 2, LockMode::Write, (11, 11), (0, 0x7ff)), true);
        assert!(!r.granted);
        assert!(e.requests[&2].need_release());
        assert_eq!(e.requests[&1].wait_queue, VecDeque::from(vec![2]));
    }

    #[test]
    fn test_peer_requests_do_not_block_each_other() {
        let pool = ShadowPool::new(4);
        let mut e = SliceEntry::default();
        assert!(add(&mut e, peer(&pool, 1, LockMode::Write, (1, 1), (0, 0x7ff)), true).granted);
        assert!(add(&mut e, peer(&pool, 2, LockMode::Write, (2, 2), (0, 0x7ff)), true).granted);
    }

    #[test]
    fn test_passive_side_peer_jumps_queue() {
        let pool = ShadowPool::new(4);
        let mut e = SliceEntry::default();
        add(&mut e, local(1, LockMode::Write, 10, 12), false);
        add(&mut e, local(2, LockMode::Write, 11, 11), false);
        let r = add(&mut e, peer(&pool, 3, LockMode::Write, (12, 12), (0, 0x7ff)), false);
        assert!(!r.granted);
        let holder = &e.requests[&1];
        assert_eq!(holder.wait_queue, VecDeque::from(vec![3, 2]));
        assert!(holder.flags.contains(RequestFlags::HOLDING_PEER));
    }

    #[test]
    fn test_deadlock_broken_on_passive_side() {
        let pool = ShadowPool::new(4);
        let mut e = SliceEntry::default();
        add(&mut e, local(1, LockMode::Write, 105, 115), false);
        add(&mut e, local(2, LockMode::Write, 110, 111), false);
        e.requests.get_mut(&1).unwrap().flags.insert(RequestFlags::WAITING_FOR_PEER);

        let r = add(&mut e, peer(&pool, 3, LockMode::Write, (100, 110), (100, 110)), false);
        assert!(r.granted);
        assert_eq!(r.deadlocks_broken, 1);
        assert_eq!(e.queue, vec![3]);
        let victim = &e.requests[&1];
        assert!(victim.flags.contains(RequestFlags::DEAD_LOCK));
        assert!(!victim.is_local_grant());
        assert_eq!(e.requests[&3].wait_queue, VecDeque::from(vec![1, 2]));
        assert_eq!(e.requests[&3].write_region, StripeRegion::new(100, 115));
        assert!(e.check_structure());
    }

    #[test]
    fn test_active_side_never_breaks_deadlock() {
        let pool = ShadowPool::new(4);
        let mut e = SliceEntry::default();
        add(&mut e, local(1, LockMode::Write, 100, 110), true);
        e.requests.get_mut(&1).unwrap().flags.insert(RequestFlags::WAITING_FOR_PEER);
        let r = add(&mut e, peer(&pool, 2, LockMode::Write, (105, 115), (105, 115)), true);
        assert!(!r.granted);
        assert_eq!(r.deadlocks_broken, 0);
        assert_eq!(e.queue, vec![1]);
    }

    #[test]
    fn test_detach_top_level_orphans_waiters() {
        let mut e = SliceEntry::default();
        add(&mut e, local(1, LockMode::Write, 0, 10), true);
        add(&mut e, local(2, LockMode::Write, 5, 6), true);
        let d = e.detach(1).unwrap();
        assert_eq!(d.orphans, VecDeque::from(vec![2]));
        assert!(e.queue.is_empty());
        assert!(e.requests.contains_key(&2));
    }

    #[test]
    fn test_detach_waiter() {
        let mut e = SliceEntry::default();
        add(&mut e, local(1, LockMode::Write, 0, 10), true);
        add(&mut e, local(2, LockMode::Write, 5, 6), true);
        let d = e.detach(2).unwrap();
        assert!(d.orphans.is_empty());
        assert!(e.requests[&1].wait_queue.is_empty());
        assert_eq!(e.waiting_ids(), Vec::<RequestId>::new());
    }

    #[test]
    fn test_check_sorted_uses_reflected_regions() {
        let mut holder = local(1, LockMode::Write, 0, 4);
        holder.set_region();
        holder.read_region = StripeRegion::new(3, 9);
        assert!(!check_sorted(&local(2, LockMode::Write, 8, 8), &holder));
        assert!(check_sorted(&local(2, LockMode::Write, 10, 10), &holder));
    }

    #[test]
    fn test_read_overlap_flag() {
        let mut a = local(1, LockMode::Read, 0, 20);
        a.set_region();
        let mut b = local(2, LockMode::Read, 5, 10);
        b.set_region();
        let mut scan = ScanState::default();
        assert!(!check_overlap(&mut a, &b, &mut scan));
        assert!(scan.read_overlap);
    }
}
