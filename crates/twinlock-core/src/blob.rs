//! Per-element container of peer-facing lock work.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use twinlock_cmi::{CmiLockFlags, LockMode, RequestToken, StripeRegion};

use crate::pool::ShadowPermit;
use crate::request::LockRequest;

/// Lock request waiting to go out to the peer.
#[derive(Debug)]
pub(crate) struct OutgoingRequest {
    pub request: RequestToken,
    pub mode: LockMode,
    pub region: StripeRegion,
    pub flags: CmiLockFlags,
    pub permit: ShadowPermit,
}

/// Unit of work queued on a blob for the worker.
#[derive(Debug)]
pub(crate) enum PeerWork {
    /// Local request that must be sent to the peer.
    Outgoing(OutgoingRequest),
    /// Peer request waiting to be inserted locally.
    Incoming(LockRequest),
}

#[derive(Debug, Default)]
pub(crate) struct PeerBlob {
    started: AtomicBool,
    queued: AtomicBool,
    enable_hash: AtomicBool,
    peer_sl_queue: Mutex<VecDeque<PeerWork>>,
}

impl PeerBlob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::Release);
    }

    /// Claims the queued mark; false if the blob is already on the worker queue.
    pub fn mark_queued(&self) -> bool {
        !self.queued.swap(true, Ordering::AcqRel)
    }

    pub fn clear_queued(&self) {
        self.queued.store(false, Ordering::Release);
    }

    pub fn request_hash_enable(&self) {
        self.enable_hash.store(true, Ordering::Release);
    }

    pub fn take_hash_enable(&self) -> bool {
        self.enable_hash.swap(false, Ordering::AcqRel)
    }

    pub fn push(&self, work: PeerWork) {
        self.peer_sl_queue.lock().push_back(work);
    }

    pub fn drain(&self) -> Vec<PeerWork> {
        self.peer_sl_queue.lock().drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.peer_sl_queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ShadowPool;

    #[test]
    fn test_mark_queued_idempotent() {
        let blob = PeerBlob::new();
        assert!(blob.mark_queued());
        assert!(!blob.mark_queued());
        blob.clear_queued();
        assert!(blob.mark_queued());
    }

    #[test]
    fn test_hash_enable_taken_once() {
        let blob = PeerBlob::new();
        assert!(!blob.take_hash_enable());
        blob.request_hash_enable();
        assert!(blob.take_hash_enable());
        assert!(!blob.take_hash_enable());
    }

    #[test]
    fn test_drain_releases_queued_shadows() {
        let pool = ShadowPool::new(2);
        let blob = PeerBlob::new();
        blob.push(PeerWork::Outgoing(OutgoingRequest {
            request: RequestToken::new(1, 0),
            mode: LockMode::Read,
            region: StripeRegion::new(0, 0),
            flags: CmiLockFlags::empty(),
            permit: pool.acquire().unwrap(),
        }));
        blob.push(PeerWork::Incoming(LockRequest::peer(
            2,
            LockMode::Write,
            StripeRegion::new(0, 0),
            StripeRegion::new(0, 15),
            RequestToken::new(9, 0),
            pool.acquire().unwrap(),
        )));
        assert_eq!(blob.pending(), 2);
        assert_eq!(pool.allocated(), 2);
        let work = blob.drain();
        assert_eq!(blob.pending(), 0);
        assert_eq!(pool.allocated(), 2);
        drop(work);
        assert_eq!(pool.allocated(), 0);
    }
}
