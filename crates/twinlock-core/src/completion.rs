//! One-shot completions handed back to callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Sending half of a completion, held by the engine.
#[derive(Debug)]
pub struct Completer<T>(oneshot::Sender<T>);

impl<T> Completer<T> {
    /// Delivers the outcome. A caller that dropped its [`Completion`] is ignored.
    pub fn complete(self, value: T) {
        let _ = self.0.send(value);
    }
}

/// Receiving half of a completion, held by the caller.
#[derive(Debug)]
pub struct Completion<T> {
    rx: Option<oneshot::Receiver<T>>,
    value: Option<T>,
}

impl<T: Copy> Completion<T> {
    /// Creates a connected completer/completion pair.
    pub fn channel() -> (Completer<T>, Completion<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Completer(tx),
            Completion {
                rx: Some(rx),
                value: None,
            },
        )
    }

    /// A completion that has already resolved.
    pub fn ready(value: T) -> Self {
        Self {
            rx: None,
            value: Some(value),
        }
    }

    /// Returns the outcome if it has arrived, without blocking.
    pub fn poll(&mut self) -> Option<T> {
        if self.value.is_none() {
            if let Some(rx) = self.rx.as_mut() {
                match rx.try_recv() {
                    Ok(value) => {
                        self.value = Some(value);
                        self.rx = None;
                    }
                    Err(oneshot::error::TryRecvError::Empty) => {}
                    Err(oneshot::error::TryRecvError::Closed) => self.rx = None,
                }
            }
        }
        self.value
    }

    /// Returns true once the outcome has arrived.
    pub fn is_complete(&mut self) -> bool {
        self.poll().is_some()
    }

    /// Waits for the outcome. `None` means the engine dropped the request
    /// without completing it.
    pub async fn wait(&mut self) -> Option<T> {
        if self.value.is_none() {
            if let Some(rx) = self.rx.as_mut() {
                self.value = rx.await.ok();
                self.rx = None;
            }
        }
        self.value
    }
}

/// Caller-side cancellation flag, observed lazily by the engine.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the request cancelled.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_before_and_after() {
        let (tx, mut rx) = Completion::<u32>::channel();
        assert_eq!(rx.poll(), None);
        tx.complete(7);
        assert_eq!(rx.poll(), Some(7));
        assert_eq!(rx.poll(), Some(7));
    }

    #[test]
    fn test_dropped_completer() {
        let (tx, mut rx) = Completion::<u32>::channel();
        drop(tx);
        assert_eq!(rx.poll(), None);
        assert!(!rx.is_complete());
    }

    #[test]
    fn test_ready() {
        let mut rx = Completion::ready(3u8);
        assert!(rx.is_complete());
    }

    #[tokio::test]
    async fn test_wait() {
        let (tx, mut rx) = Completion::<u32>::channel();
        tokio::spawn(async move { tx.complete(9) });
        assert_eq!(rx.wait().await, Some(9));
        assert_eq!(rx.poll(), Some(9));
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
