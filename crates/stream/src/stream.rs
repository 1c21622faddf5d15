//! Stream - producer side broadcast

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use contracts::{ContractError, MetadataMap};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use tracing::{debug, warn};

use crate::subscription::{StreamLink, Subscription, SubscriptionShared};
use crate::StreamItem;

struct Slot<T> {
    generation: u64,
    subscription: Arc<SubscriptionShared<T>>,
}

/// Registry shared by every handle of one stream
pub(crate) struct StreamShared<T> {
    id: String,
    title: String,
    active: AtomicBool,
    subscribers: Mutex<Slab<Slot<T>>>,
    next_generation: AtomicU64,
    metadata: RwLock<MetadataMap>,
}

impl<T> StreamShared<T> {
    /// Remove a registry entry if it still belongs to the given generation
    pub(crate) fn remove_subscriber(&self, key: usize, generation: u64) {
        let mut subscribers = self.subscribers.lock();
        if subscribers
            .get(key)
            .is_some_and(|slot| slot.generation == generation)
        {
            subscribers.remove(key);
        }
    }
}

impl<T> Drop for StreamShared<T> {
    fn drop(&mut self) {
        // consumers drain what is queued, then see end-of-stream
        for slot in self.subscribers.get_mut().drain() {
            slot.subscription.force_terminate();
        }
    }
}

/// Typed output stream of a module
///
/// Cloning yields another handle to the same stream.
pub struct Stream<T: StreamItem> {
    shared: Arc<StreamShared<T>>,
}

impl<T: StreamItem> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: StreamItem> Stream<T> {
    /// Create an inactive stream
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                id: id.into(),
                title: title.into(),
                active: AtomicBool::new(false),
                subscribers: Mutex::new(Slab::new()),
                next_generation: AtomicU64::new(0),
                metadata: RwLock::new(MetadataMap::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn title(&self) -> &str {
        &self.shared.title
    }

    /// Create a new subscription. Only allowed while the stream is inactive.
    pub fn subscribe(&self) -> Result<Subscription<T>, ContractError> {
        let mut subscribers = self.shared.subscribers.lock();
        if self.shared.active.load(Ordering::Acquire) {
            warn!(stream = %self.shared.id, "subscribe on active stream rejected");
            return Err(ContractError::StreamActive {
                stream: self.shared.id.clone(),
            });
        }

        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let subscription = Arc::new(SubscriptionShared::new(self.shared.id.clone()));
        let key = subscribers.insert(Slot {
            generation,
            subscription: Arc::clone(&subscription),
        });
        subscription.set_link(StreamLink {
            stream: Arc::downgrade(&self.shared),
            key,
            generation,
        });

        debug!(stream = %self.shared.id, key, generation, "subscription created");
        Ok(Subscription::from_shared(subscription))
    }

    /// Number of registered subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Set a metadata entry, handed to subscriptions on the next start
    pub fn set_metadata_value(&self, key: impl Into<String>, value: serde_json::Value) {
        self.shared.metadata.write().insert(key.into(), value);
    }

    pub fn metadata(&self) -> MetadataMap {
        self.shared.metadata.read().clone()
    }

    /// Activate the stream and reset every subscription for a new run.
    pub fn start(&self) {
        let subscribers = self.shared.subscribers.lock();
        if self.shared.active.load(Ordering::Acquire) {
            return;
        }
        let metadata = self.shared.metadata.read().clone();
        for (_, slot) in subscribers.iter() {
            slot.subscription.reset(metadata.clone());
        }
        self.shared.active.store(true, Ordering::Release);
        debug!(stream = %self.shared.id, subscribers = subscribers.len(), "stream started");
    }

    /// Deactivate the stream and deliver end-of-stream. Idempotent.
    pub fn stop(&self) {
        if !self.shared.active.swap(false, Ordering::AcqRel) {
            return;
        }
        for subscription in self.snapshot() {
            subscription.end_of_stream();
        }
        debug!(stream = %self.shared.id, "stream stopped");
    }

    /// Stop the stream and sever every subscription from it.
    ///
    /// Subscriptions keep their queued items and report end-of-stream
    /// afterwards; they cannot be restarted by this stream again.
    pub fn terminate(&self) {
        self.stop();
        let drained: Vec<_> = {
            let mut subscribers = self.shared.subscribers.lock();
            subscribers.drain().collect()
        };
        for slot in drained {
            slot.subscription.clear_link();
            slot.subscription.force_terminate();
        }
    }

    /// Broadcast an item to every subscription.
    ///
    /// No-op while inactive. Blocks while any subscriber queue is full.
    pub fn push(&self, item: T) {
        if !self.shared.active.load(Ordering::Acquire) {
            return;
        }
        counter!("daqflow_stream_items_pushed_total").increment(1);

        let mut targets = self.snapshot();
        let Some(last) = targets.pop() else {
            return;
        };
        for subscription in targets {
            subscription.push(item.clone());
        }
        last.push(item);
    }

    /// Largest approximate backlog across subscriptions
    pub fn max_pending(&self) -> usize {
        self.snapshot()
            .iter()
            .map(|s| s.approx_pending())
            .max()
            .unwrap_or(0)
    }

    /// Clone the subscription list so pushing happens outside the lock
    fn snapshot(&self) -> Vec<Arc<SubscriptionShared<T>>> {
        self.shared
            .subscribers
            .lock()
            .iter()
            .map(|(_, slot)| Arc::clone(&slot.subscription))
            .collect()
    }
}

impl<T: StreamItem> std::fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("active", &self.is_active())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
