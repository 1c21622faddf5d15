//! # Stream
//!
//! Typed producer/consumer channels between modules.
//!
//! A [`Stream`] is owned by the producing module's output port and broadcasts
//! every pushed item to all of its [`Subscription`]s. Each subscription owns a
//! bounded queue, so a slow consumer applies backpressure to the producer
//! instead of letting memory grow.
//!
//! ```text
//! producer ── push ──► Stream ──┬─► Subscription (queue 256) ──► consumer A
//!                               └─► Subscription (queue 256) ──► consumer B
//! ```
//!
//! The engine wires ports without knowing item types through the
//! [`AnyStream`], [`AnySubscription`] and [`AnyInputPort`] traits.

mod erased;
mod heat;
mod ports;
mod stream;
mod subscription;

pub use erased::{AnyInputPort, AnyStream, AnySubscription};
pub use heat::HeatTracker;
pub use ports::{InputPort, ModulePorts};
pub use stream::Stream;
pub use subscription::{Subscription, TryNext, SUBSCRIPTION_CAPACITY};

/// Bound for items that can travel through a stream
pub trait StreamItem: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> StreamItem for T {}
