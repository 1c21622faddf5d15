//! Type-erased views used by the engine to wire and monitor ports

use std::any::{type_name, Any};
use std::sync::Arc;

use contracts::ContractError;

use crate::{Stream, StreamItem, Subscription};

/// A stream of any item type
pub trait AnyStream: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn id(&self) -> &str;
    fn title(&self) -> &str;
    /// Rust type name of the items
    fn data_type(&self) -> &'static str;
    fn start(&self);
    fn stop(&self);
    fn terminate(&self);
    fn is_active(&self) -> bool;
    fn subscriber_count(&self) -> usize;
}

impl<T: StreamItem> AnyStream for Stream<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn id(&self) -> &str {
        Stream::id(self)
    }

    fn title(&self) -> &str {
        Stream::title(self)
    }

    fn data_type(&self) -> &'static str {
        type_name::<T>()
    }

    fn start(&self) {
        Stream::start(self)
    }

    fn stop(&self) {
        Stream::stop(self)
    }

    fn terminate(&self) {
        Stream::terminate(self)
    }

    fn is_active(&self) -> bool {
        Stream::is_active(self)
    }

    fn subscriber_count(&self) -> usize {
        Stream::subscriber_count(self)
    }
}

/// A subscription of any item type
pub trait AnySubscription: Send + Sync {
    fn stream_id(&self) -> &str;
    fn data_type(&self) -> &'static str;
    fn approx_pending(&self) -> usize;
    fn skipped_count(&self) -> u64;
    fn is_active(&self) -> bool;
    fn is_connected(&self) -> bool;
    fn set_throttle_items_per_sec(&self, items_per_sec: u32);
    fn force_terminate(&self);
    fn unsubscribe(&self);
}

impl<T: StreamItem> AnySubscription for Subscription<T> {
    fn stream_id(&self) -> &str {
        Subscription::stream_id(self)
    }

    fn data_type(&self) -> &'static str {
        type_name::<T>()
    }

    fn approx_pending(&self) -> usize {
        Subscription::approx_pending(self)
    }

    fn skipped_count(&self) -> u64 {
        Subscription::skipped_count(self)
    }

    fn is_active(&self) -> bool {
        Subscription::is_active(self)
    }

    fn is_connected(&self) -> bool {
        Subscription::is_connected(self)
    }

    fn set_throttle_items_per_sec(&self, items_per_sec: u32) {
        Subscription::set_throttle_items_per_sec(self, items_per_sec)
    }

    fn force_terminate(&self) {
        Subscription::force_terminate(self)
    }

    fn unsubscribe(&self) {
        Subscription::unsubscribe(self)
    }
}

/// An input port of any item type
pub trait AnyInputPort: Send + Sync {
    fn id(&self) -> &str;
    fn title(&self) -> &str;
    fn data_type(&self) -> &'static str;

    /// Subscribe to `stream`, replacing any previous subscription.
    ///
    /// # Errors
    /// - `PortTypeMismatch` if the stream carries another item type
    /// - `StreamActive` if the stream is running
    fn connect(&self, stream: &dyn AnyStream) -> Result<(), ContractError>;

    /// Drop the current subscription, if any
    fn disconnect(&self);

    fn subscription(&self) -> Option<Arc<dyn AnySubscription>>;

    /// Whether the port holds a subscription to a live stream
    fn is_connected(&self) -> bool {
        self.subscription().is_some_and(|s| s.is_connected())
    }
}

/// Downcast an erased stream to its concrete type
pub(crate) fn downcast_stream<'a, T: StreamItem>(
    stream: &'a dyn AnyStream,
    port: &str,
) -> Result<&'a Stream<T>, ContractError> {
    stream
        .as_any()
        .downcast_ref::<Stream<T>>()
        .ok_or_else(|| ContractError::PortTypeMismatch {
            port: port.to_string(),
            stream_type: stream.data_type().to_string(),
            port_type: type_name::<T>().to_string(),
        })
}
