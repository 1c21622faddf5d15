//! Stop signalling and per-run bookkeeping

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use sync_engine::MasterClock;
use tokio::sync::Notify;
use tracing::info;

use crate::storage::StorageGroup;

#[derive(Debug, Default)]
struct StopInner {
    requested: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

/// Ends the active run from any thread (signal handler, timer, UI)
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the engine to stop the current run. Idempotent.
    pub fn request_stop(&self) {
        if !self.inner.requested.swap(true, Ordering::AcqRel) {
            info!("run stop requested");
        }
        self.inner.notify.notify_one();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    /// Stop and mark the run as failed
    pub(crate) fn abort(&self, reason: impl Into<String>) {
        self.inner.reason.lock().get_or_insert_with(|| reason.into());
        self.request_stop();
    }

    pub(crate) fn abort_reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// Resolves once a stop was requested
    pub(crate) async fn stopped(&self) {
        while !self.is_stop_requested() {
            self.inner.notify.notified().await;
        }
    }

    pub(crate) fn reset(&self) {
        self.inner.requested.store(false, Ordering::Release);
        self.inner.reason.lock().take();
    }
}

/// State of the run in progress
#[derive(Debug)]
pub(crate) struct RunState {
    pub clock: Arc<MasterClock>,
    pub storage: Option<StorageGroup>,
    pub execution_order: Vec<String>,
    pub stop_order: Vec<String>,
    pub started_at: Instant,
    failure: Option<String>,
}

impl RunState {
    pub fn new(storage: Option<StorageGroup>, execution_order: Vec<String>, stop_order: Vec<String>) -> Self {
        Self {
            clock: Arc::new(MasterClock::new()),
            storage,
            execution_order,
            stop_order,
            started_at: Instant::now(),
            failure: None,
        }
    }

    /// Record why the run failed; the first reason wins
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some(reason.into());
        }
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Seconds since the master clock started (0 if it never did)
    pub fn elapsed_s(&self) -> f64 {
        self.clock.time_since_start().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_before_wait_is_not_lost() {
        let stop = StopHandle::new();
        stop.request_stop();
        tokio::time::timeout(Duration::from_secs(1), stop.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_from_other_thread() {
        let stop = StopHandle::new();
        let remote = stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.request_stop();
        });
        tokio::time::timeout(Duration::from_secs(2), stop.stopped())
            .await
            .unwrap();
        assert!(stop.is_stop_requested());
    }

    #[test]
    fn test_abort_keeps_first_reason() {
        let stop = StopHandle::new();
        stop.abort("memory exhausted");
        stop.abort("second");
        assert_eq!(stop.abort_reason().as_deref(), Some("memory exhausted"));

        stop.reset();
        assert!(!stop.is_stop_requested());
        assert_eq!(stop.abort_reason(), None);
    }

    #[test]
    fn test_first_failure_wins() {
        let mut run = RunState::new(None, vec![], vec![]);
        assert!(!run.is_failed());
        run.fail("module 'a' failed");
        run.fail("module 'b' failed");
        assert_eq!(run.failure(), Some("module 'a' failed"));
        assert_eq!(run.elapsed_s(), 0.0);
    }
}
