//! Blob dispatch queue and the background thread that drains it.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;
use twinlock_cmi::ElementHandle;

use crate::domain::LockDomain;

/// Elements with pending peer work, in arrival order.
#[derive(Default)]
pub(crate) struct BlobQueue {
    queue: Mutex<VecDeque<ElementHandle>>,
    event: Condvar,
    stopped: AtomicBool,
}

impl BlobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `handle`; wakes the worker only on the empty to non-empty edge.
    pub fn push(&self, handle: ElementHandle) {
        let mut queue = self.queue.lock();
        let was_empty = queue.is_empty();
        queue.push_back(handle);
        if was_empty {
            self.event.notify_one();
        }
    }

    pub fn pop_all(&self) -> Vec<ElementHandle> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Blocks until work arrives, the queue stops, or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) {
        let mut queue = self.queue.lock();
        if queue.is_empty() && !self.is_stopped() {
            self.event.wait_for(&mut queue, timeout);
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _queue = self.queue.lock();
        self.event.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Starts the dispatch thread. It holds only a weak reference so dropping
/// the domain ends it.
pub(crate) fn spawn(
    domain: Weak<LockDomain>,
    queue: Arc<BlobQueue>,
    idle: Duration,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("twinlock-blob".into())
        .spawn(move || {
            debug!("blob worker started");
            loop {
                queue.wait(idle);
                if queue.is_stopped() {
                    break;
                }
                let Some(domain) = domain.upgrade() else {
                    break;
                };
                domain.run_worker();
            }
            debug!("blob worker stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_push_pop_order() {
        let q = BlobQueue::new();
        q.push(ElementHandle::new(1, 1));
        q.push(ElementHandle::new(2, 1));
        assert_eq!(q.len(), 2);
        assert_eq!(
            q.pop_all(),
            vec![ElementHandle::new(1, 1), ElementHandle::new(2, 1)]
        );
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_wait_returns_when_work_present() {
        let q = BlobQueue::new();
        q.push(ElementHandle::new(1, 1));
        let start = Instant::now();
        q.wait(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wake_from_other_thread() {
        let q = Arc::new(BlobQueue::new());
        let q2 = Arc::clone(&q);
        let t = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while q2.len() == 0 && Instant::now() < deadline {
                q2.wait(Duration::from_secs(5));
            }
            q2.len()
        });
        std::thread::sleep(Duration::from_millis(20));
        q.push(ElementHandle::new(4, 1));
        assert_eq!(t.join().unwrap(), 1);
    }

    #[test]
    fn test_stop_wakes_waiter() {
        let q = Arc::new(BlobQueue::new());
        let q2 = Arc::clone(&q);
        let t = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !q2.is_stopped() && Instant::now() < deadline {
                q2.wait(Duration::from_secs(5));
            }
            q2.is_stopped()
        });
        std::thread::sleep(Duration::from_millis(20));
        q.stop();
        assert!(t.join().unwrap());
    }
}
