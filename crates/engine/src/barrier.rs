//! One-shot start barrier

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_channel::{bounded, Receiver, Sender};
use tracing::debug;

/// Barrier every execution context waits on until the engine has started
/// all modules.
///
/// Waking happens exactly once; later waits return immediately. Waking with
/// no waiter is fine.
#[derive(Debug)]
pub struct OptionalWaitCondition {
    // nothing is ever sent; closing the channel wakes every receiver
    tx: Sender<()>,
    rx: Receiver<()>,
    woken: AtomicBool,
    waiting: AtomicUsize,
}

impl Default for OptionalWaitCondition {
    fn default() -> Self {
        Self::new()
    }
}

impl OptionalWaitCondition {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self {
            tx,
            rx,
            woken: AtomicBool::new(false),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Block the calling thread until [`wake_all`](Self::wake_all)
    pub fn wait(&self) {
        if self.is_woken() {
            return;
        }
        self.waiting.fetch_add(1, Ordering::AcqRel);
        let _ = self.rx.recv_blocking();
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }

    /// Async variant for event loops
    pub async fn wait_async(&self) {
        if self.is_woken() {
            return;
        }
        self.waiting.fetch_add(1, Ordering::AcqRel);
        let _ = self.rx.recv().await;
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }

    /// Release every current and future waiter. Idempotent.
    pub fn wake_all(&self) {
        if self.woken.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(waiting = self.waiting(), "start barrier released");
        self.tx.close();
    }

    pub fn is_woken(&self) -> bool {
        self.woken.load(Ordering::Acquire)
    }

    /// Number of threads currently blocked
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wake_without_waiters() {
        let barrier = OptionalWaitCondition::new();
        barrier.wake_all();
        barrier.wake_all();
        barrier.wait();
        assert!(barrier.is_woken());
    }

    #[test]
    fn test_releases_all_waiters() {
        let barrier = Arc::new(OptionalWaitCondition::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || barrier.wait())
            })
            .collect();

        while barrier.waiting() < 4 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(handles.iter().all(|h| !h.is_finished()));

        barrier.wake_all();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(barrier.waiting(), 0);
    }

    #[tokio::test]
    async fn test_async_wait() {
        let barrier = Arc::new(OptionalWaitCondition::new());
        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.wait_async().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        barrier.wake_all();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
