//! Subscription - per-consumer bounded queue

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use contracts::MetadataMap;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::stream::StreamShared;
use crate::StreamItem;

/// Queue capacity of every subscription
pub const SUBSCRIPTION_CAPACITY: usize = 256;

/// Result of a non-blocking read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryNext<T> {
    /// An item was available
    Item(T),
    /// The producer ended the stream (or the subscription was terminated)
    EndOfStream,
    /// Nothing queued right now
    Empty,
}

struct Channel<T> {
    tx: Sender<Option<T>>,
    rx: Receiver<Option<T>>,
}

impl<T> Channel<T> {
    fn new() -> Self {
        let (tx, rx) = bounded(SUBSCRIPTION_CAPACITY);
        Self { tx, rx }
    }
}

/// Back-reference from a subscription to its stream registry entry
pub(crate) struct StreamLink<T> {
    pub(crate) stream: Weak<StreamShared<T>>,
    pub(crate) key: usize,
    pub(crate) generation: u64,
}

/// State shared between the stream registry and the consumer handle
pub(crate) struct SubscriptionShared<T> {
    stream_id: String,
    channel: RwLock<Channel<T>>,
    active: AtomicBool,
    suspended: AtomicBool,
    /// Minimum inter-item interval in µs, 0 = unthrottled
    throttle_us: AtomicU64,
    last_accepted: Mutex<Option<Instant>>,
    skipped: AtomicU64,
    sent: AtomicU64,
    received: AtomicU64,
    metadata: RwLock<MetadataMap>,
    link: Mutex<Option<StreamLink<T>>>,
}

impl<T> SubscriptionShared<T> {
    pub(crate) fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            channel: RwLock::new(Channel::new()),
            active: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            throttle_us: AtomicU64::new(0),
            last_accepted: Mutex::new(None),
            skipped: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            metadata: RwLock::new(MetadataMap::new()),
            link: Mutex::new(None),
        }
    }

    pub(crate) fn set_link(&self, link: StreamLink<T>) {
        *self.link.lock() = Some(link);
    }

    pub(crate) fn clear_link(&self) {
        self.link.lock().take();
    }

    fn sender(&self) -> Sender<Option<T>> {
        self.channel.read().tx.clone()
    }

    fn receiver(&self) -> Receiver<Option<T>> {
        self.channel.read().rx.clone()
    }

    /// Prepare for a new run: fresh queue if the old one was closed, stale
    /// items discarded, stream metadata copied in.
    pub(crate) fn reset(&self, metadata: MetadataMap) {
        {
            let mut channel = self.channel.write();
            if channel.tx.is_closed() {
                *channel = Channel::new();
            } else {
                while channel.rx.try_recv().is_ok() {}
            }
        }
        self.sent.store(0, Ordering::Relaxed);
        self.received.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        *self.last_accepted.lock() = None;
        *self.metadata.write() = metadata;
        self.active.store(true, Ordering::Release);
    }

    /// Deliver one item, enforcing suspension, throttling and backpressure.
    ///
    /// Blocks while the queue is full.
    pub(crate) fn push(&self, item: T) {
        if self.suspended.load(Ordering::Acquire) {
            return;
        }

        let throttle_us = self.throttle_us.load(Ordering::Relaxed);
        if throttle_us > 0 {
            let now = Instant::now();
            let mut last = self.last_accepted.lock();
            if let Some(prev) = *last {
                if now.duration_since(prev) < Duration::from_micros(throttle_us) {
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    counter!("daqflow_stream_items_skipped_total").increment(1);
                    return;
                }
            }
            *last = Some(now);
        }

        // closed channel = terminated subscription, item is discarded
        if self.sender().send_blocking(Some(item)).is_ok() {
            self.sent.fetch_add(1, Ordering::Relaxed);
        } else {
            trace!(stream = %self.stream_id, "push to terminated subscription ignored");
        }
    }

    /// Queue the end-of-stream sentinel without ever blocking the caller.
    pub(crate) fn end_of_stream(&self) {
        self.active.store(false, Ordering::Release);
        let tx = self.sender();
        match tx.try_send(None) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                // closing keeps queued items readable and reads as end-of-stream afterwards
                debug!(stream = %self.stream_id, "queue full at stop, closing instead");
                tx.close();
            }
        }
    }

    pub(crate) fn approx_pending(&self) -> usize {
        let sent = self.sent.load(Ordering::Relaxed);
        let received = self.received.load(Ordering::Relaxed);
        sent.saturating_sub(received) as usize
    }

    pub(crate) fn force_terminate(&self) {
        self.active.store(false, Ordering::Release);
        self.sender().close();
    }

    pub(crate) fn unsubscribe(&self) {
        self.active.store(false, Ordering::Release);
        let link = self.link.lock().take();
        if let Some(link) = link {
            if let Some(stream) = link.stream.upgrade() {
                stream.remove_subscriber(link.key, link.generation);
            }
        }
    }
}

/// Consumer handle of a stream
///
/// Dropping the handle unsubscribes it.
pub struct Subscription<T: StreamItem> {
    shared: Arc<SubscriptionShared<T>>,
}

impl<T: StreamItem> Subscription<T> {
    pub(crate) fn from_shared(shared: Arc<SubscriptionShared<T>>) -> Self {
        Self { shared }
    }

    /// Id of the stream this subscription was created from
    pub fn stream_id(&self) -> &str {
        &self.shared.stream_id
    }

    /// Block until the next item arrives. `None` means end-of-stream.
    pub fn next(&self) -> Option<T> {
        let item = self.shared.receiver().recv_blocking().ok().flatten();
        if item.is_some() {
            self.shared.received.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Async variant of [`next`](Self::next) for event-driven modules
    pub async fn next_async(&self) -> Option<T> {
        let rx = self.shared.receiver();
        let item = rx.recv().await.ok().flatten();
        if item.is_some() {
            self.shared.received.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Non-blocking read
    pub fn peek_next(&self) -> TryNext<T> {
        match self.shared.receiver().try_recv() {
            Ok(Some(item)) => {
                self.shared.received.fetch_add(1, Ordering::Relaxed);
                TryNext::Item(item)
            }
            Ok(None) | Err(TryRecvError::Closed) => TryNext::EndOfStream,
            Err(TryRecvError::Empty) => TryNext::Empty,
        }
    }

    /// Whether the stream is delivering to this subscription
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Whether the subscription is still registered with a live stream
    pub fn is_connected(&self) -> bool {
        self.shared
            .link
            .lock()
            .as_ref()
            .is_some_and(|link| link.stream.strong_count() > 0)
    }

    /// Best-effort number of queued items, readable without locking
    pub fn approx_pending(&self) -> usize {
        self.shared.approx_pending()
    }

    /// Accept at most `items_per_sec` items per second; 0 disables throttling
    pub fn set_throttle_items_per_sec(&self, items_per_sec: u32) {
        let interval_us = if items_per_sec == 0 {
            0
        } else {
            1_000_000 / u64::from(items_per_sec)
        };
        self.shared.throttle_us.store(interval_us, Ordering::Relaxed);
    }

    /// Items dropped by the throttle in the current run
    pub fn skipped_count(&self) -> u64 {
        self.shared.skipped.load(Ordering::Relaxed)
    }

    /// Stop accepting items until [`resume`](Self::resume) is called
    pub fn suspend(&self) {
        self.shared.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.suspended.store(false, Ordering::Release);
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::Acquire)
    }

    /// Stream metadata as of the last stream start
    pub fn metadata(&self) -> MetadataMap {
        self.shared.metadata.read().clone()
    }

    /// Close the queue: pending items still drain, then end-of-stream is
    /// reported and a producer blocked on this queue is released.
    pub fn force_terminate(&self) {
        self.shared.force_terminate();
    }

    /// Detach from the stream. Idempotent.
    pub fn unsubscribe(&self) {
        self.shared.unsubscribe();
    }
}

impl<T: StreamItem> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.shared.unsubscribe();
    }
}

impl<T: StreamItem> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("stream", &self.shared.stream_id)
            .field("active", &self.is_active())
            .field("pending", &self.approx_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standalone() -> Subscription<u32> {
        let shared = Arc::new(SubscriptionShared::new("test"));
        shared.reset(MetadataMap::new());
        Subscription::from_shared(shared)
    }

    #[test]
    fn test_fifo_and_end_of_stream() {
        let sub = standalone();
        for i in 0..5 {
            sub.shared.push(i);
        }
        sub.shared.end_of_stream();

        let received: Vec<_> = std::iter::from_fn(|| sub.next()).collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
        assert!(!sub.is_active());
    }

    #[test]
    fn test_peek_next_states() {
        let sub = standalone();
        assert_eq!(sub.peek_next(), TryNext::Empty);
        sub.shared.push(7);
        assert_eq!(sub.peek_next(), TryNext::Item(7));
        sub.shared.end_of_stream();
        assert_eq!(sub.peek_next(), TryNext::EndOfStream);
    }

    #[test]
    fn test_suspended_drops_items() {
        let sub = standalone();
        sub.suspend();
        sub.shared.push(1);
        sub.resume();
        sub.shared.push(2);
        assert_eq!(sub.peek_next(), TryNext::Item(2));
        assert_eq!(sub.peek_next(), TryNext::Empty);
    }

    #[test]
    fn test_throttle_counts_skips() {
        let sub = standalone();
        sub.set_throttle_items_per_sec(1);
        for i in 0..10 {
            sub.shared.push(i);
        }
        assert_eq!(sub.peek_next(), TryNext::Item(0));
        assert_eq!(sub.skipped_count(), 9);
        assert_eq!(sub.approx_pending(), 0);
    }

    #[test]
    fn test_end_of_stream_on_full_queue_closes() {
        let sub = standalone();
        for i in 0..SUBSCRIPTION_CAPACITY as u32 {
            sub.shared.push(i);
        }
        assert_eq!(sub.approx_pending(), SUBSCRIPTION_CAPACITY);

        // must not block although the queue is full
        sub.shared.end_of_stream();

        let mut count = 0;
        while sub.next().is_some() {
            count += 1;
        }
        assert_eq!(count, SUBSCRIPTION_CAPACITY);
    }

    #[test]
    fn test_reset_reopens_closed_queue() {
        let sub = standalone();
        sub.force_terminate();
        assert_eq!(sub.next(), None);

        sub.shared.reset(MetadataMap::new());
        sub.shared.push(3);
        assert_eq!(sub.next(), Some(3));
    }
}
