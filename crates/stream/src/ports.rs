//! Module ports

use std::sync::Arc;

use contracts::ContractError;
use parking_lot::RwLock;
use tracing::debug;

use crate::erased::downcast_stream;
use crate::{AnyInputPort, AnyStream, AnySubscription, Stream, StreamItem, Subscription};

/// Typed input port holding at most one subscription
pub struct InputPort<T: StreamItem> {
    id: String,
    title: String,
    subscription: RwLock<Option<Arc<Subscription<T>>>>,
}

impl<T: StreamItem> InputPort<T> {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            subscription: RwLock::new(None),
        }
    }

    /// Current subscription, if the port is connected
    pub fn subscription(&self) -> Option<Arc<Subscription<T>>> {
        self.subscription.read().clone()
    }

    /// Subscribe to a typed stream, replacing any previous subscription
    pub fn connect_to(&self, stream: &Stream<T>) -> Result<(), ContractError> {
        let subscription = Arc::new(stream.subscribe()?);
        self.replace(Some(subscription));
        debug!(port = %self.id, stream = %stream.id(), "input port connected");
        Ok(())
    }

    fn replace(&self, next: Option<Arc<Subscription<T>>>) {
        let previous = std::mem::replace(&mut *self.subscription.write(), next);
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
    }
}

impl<T: StreamItem> AnyInputPort for InputPort<T> {
    fn id(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn data_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn connect(&self, stream: &dyn AnyStream) -> Result<(), ContractError> {
        let typed = downcast_stream::<T>(stream, &self.id)?;
        self.connect_to(typed)
    }

    fn disconnect(&self) {
        self.replace(None);
    }

    fn subscription(&self) -> Option<Arc<dyn AnySubscription>> {
        self.subscription
            .read()
            .clone()
            .map(|s| s as Arc<dyn AnySubscription>)
    }
}

/// Input and output ports of one module
#[derive(Default)]
pub struct ModulePorts {
    inputs: Vec<Arc<dyn AnyInputPort>>,
    outputs: Vec<Arc<dyn AnyStream>>,
}

impl ModulePorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an output port and return its stream
    pub fn add_output<T: StreamItem>(
        &mut self,
        id: impl Into<String>,
        title: impl Into<String>,
    ) -> Stream<T> {
        let stream = Stream::new(id, title);
        self.outputs.push(Arc::new(stream.clone()));
        stream
    }

    /// Register an input port
    pub fn add_input<T: StreamItem>(
        &mut self,
        id: impl Into<String>,
        title: impl Into<String>,
    ) -> Arc<InputPort<T>> {
        let port = Arc::new(InputPort::new(id, title));
        self.inputs.push(Arc::clone(&port) as Arc<dyn AnyInputPort>);
        port
    }

    pub fn input(&self, id: &str) -> Option<&Arc<dyn AnyInputPort>> {
        self.inputs.iter().find(|p| p.id() == id)
    }

    pub fn output(&self, id: &str) -> Option<&Arc<dyn AnyStream>> {
        self.outputs.iter().find(|s| s.id() == id)
    }

    pub fn inputs(&self) -> &[Arc<dyn AnyInputPort>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Arc<dyn AnyStream>] {
        &self.outputs
    }

    /// Whether any input port is subscribed to a live stream
    pub fn has_connected_input(&self) -> bool {
        self.inputs.iter().any(|p| p.is_connected())
    }

    /// Subscriptions of all connected input ports, with their port ids
    pub fn input_subscriptions(&self) -> Vec<(String, Arc<dyn AnySubscription>)> {
        self.inputs
            .iter()
            .filter_map(|p| p.subscription().map(|s| (p.id().to_string(), s)))
            .collect()
    }
}

impl std::fmt::Debug for ModulePorts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModulePorts")
            .field("inputs", &self.inputs.iter().map(|p| p.id()).collect::<Vec<_>>())
            .field("outputs", &self.outputs.iter().map(|s| s.id()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_by_type() {
        let mut producer = ModulePorts::new();
        let stream = producer.add_output::<u64>("samples", "Samples");

        let mut consumer = ModulePorts::new();
        let input = consumer.add_input::<u64>("in", "Input");

        let out = producer.output("samples").unwrap();
        consumer.input("in").unwrap().connect(out.as_ref()).unwrap();
        assert!(consumer.has_connected_input());
        assert_eq!(stream.subscriber_count(), 1);

        stream.start();
        stream.push(42);
        assert_eq!(input.subscription().unwrap().next(), Some(42));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut producer = ModulePorts::new();
        let _stream = producer.add_output::<String>("text", "Text");
        let mut consumer = ModulePorts::new();
        let _input = consumer.add_input::<u64>("in", "Input");

        let err = consumer
            .input("in")
            .unwrap()
            .connect(producer.output("text").unwrap().as_ref())
            .unwrap_err();
        match err {
            ContractError::PortTypeMismatch {
                port,
                stream_type,
                port_type,
            } => {
                assert_eq!(port, "in");
                assert!(stream_type.contains("String"));
                assert_eq!(port_type, "u64");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!consumer.has_connected_input());
    }

    #[test]
    fn test_reconnect_replaces_subscription() {
        let first = Stream::<u32>::new("a", "A");
        let second = Stream::<u32>::new("b", "B");
        let port = InputPort::<u32>::new("in", "Input");

        port.connect_to(&first).unwrap();
        port.connect_to(&second).unwrap();
        assert_eq!(first.subscriber_count(), 0);
        assert_eq!(second.subscriber_count(), 1);

        AnyInputPort::disconnect(&port);
        assert_eq!(second.subscriber_count(), 0);
        assert!(!port.is_connected());
    }
}
