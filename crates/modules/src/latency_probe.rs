//! Latency probe - measures how long items travel from producer to consumer

use std::marker::PhantomData;
use std::sync::Arc;

use contracts::{ModuleBlueprint, ModuleDriver, TestSubject};
use engine::{Module, ModuleContext, ModuleError};
use metrics::histogram;
use observability::{RunningStats, StatsSummary};
use parking_lot::Mutex;
use stream::{InputPort, ModulePorts, StreamItem, TryNext, SUBSCRIPTION_CAPACITY};
use tracing::info;

use crate::error::Result;
use crate::items::Timestamped;
use crate::registry::resolve_driver;

pub const KIND: &str = "latency_probe";

/// Id of the input port
pub const INPUT_PORT: &str = "in";

/// Default event loop shared by probes
pub const DEFAULT_GROUP: &str = "probes";

/// Configuration for [`LatencyProbe`]
#[derive(Debug, Clone)]
pub struct LatencyProbeConfig {
    pub driver: ModuleDriver,
    pub events_group: Option<String>,
}

impl Default for LatencyProbeConfig {
    fn default() -> Self {
        Self {
            driver: ModuleDriver::EventsShared,
            events_group: Some(DEFAULT_GROUP.to_string()),
        }
    }
}

impl LatencyProbeConfig {
    /// Create config from a blueprint entry
    pub fn from_blueprint(bp: &ModuleBlueprint) -> Result<Self> {
        Ok(Self {
            driver: resolve_driver(
                bp,
                ModuleDriver::EventsShared,
                &[ModuleDriver::EventsShared, ModuleDriver::EventsDedicated],
            )?,
            events_group: bp
                .events_group
                .clone()
                .or_else(|| Some(DEFAULT_GROUP.to_string())),
        })
    }
}

/// Consumer recording the delay between an item's master timestamp and
/// the moment it is read
pub struct LatencyProbe<T: StreamItem + Timestamped> {
    name: String,
    config: LatencyProbeConfig,
    ports: ModulePorts,
    input: Arc<InputPort<T>>,
    stats: Mutex<RunningStats>,
    _item: PhantomData<fn(T)>,
}

impl<T: StreamItem + Timestamped> LatencyProbe<T> {
    pub fn new(name: impl Into<String>, config: LatencyProbeConfig) -> Self {
        let mut ports = ModulePorts::new();
        let input = ports.add_input(INPUT_PORT, "Probed items");
        Self {
            name: name.into(),
            config,
            ports,
            input,
            stats: Mutex::new(RunningStats::default()),
            _item: PhantomData,
        }
    }

    /// Create from a blueprint entry (for the registry)
    pub fn from_blueprint(bp: &ModuleBlueprint) -> Result<Self> {
        Ok(Self::new(&bp.name, LatencyProbeConfig::from_blueprint(bp)?))
    }

    /// Latency statistics (µs) of the last run
    pub fn summary(&self) -> StatsSummary {
        StatsSummary::from(&*self.stats.lock())
    }

    fn record(&self, now_us: i64, item: &T) {
        let latency_us = (now_us - item.master_us()) as f64;
        self.stats.lock().push(latency_us);
        histogram!("daqflow_probe_latency_us", "module" => self.name.clone()).record(latency_us);
    }
}

impl<T: StreamItem + Timestamped> Module for LatencyProbe<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> &str {
        KIND
    }

    fn driver(&self) -> ModuleDriver {
        self.config.driver
    }

    fn events_group(&self) -> Option<&str> {
        self.config.events_group.as_deref()
    }

    fn ports(&self) -> &ModulePorts {
        &self.ports
    }

    fn prepare(&self, _ctx: &ModuleContext, _test_subject: &TestSubject) -> std::result::Result<(), ModuleError> {
        *self.stats.lock() = RunningStats::default();
        Ok(())
    }

    fn process_events(&self, ctx: &ModuleContext) -> std::result::Result<(), ModuleError> {
        let Some(subscription) = self.input.subscription() else {
            return Ok(());
        };
        let clock = ctx.clock();

        for _ in 0..SUBSCRIPTION_CAPACITY {
            match subscription.peek_next() {
                TryNext::Item(item) => self.record(clock.now_us(), &item),
                TryNext::Empty | TryNext::EndOfStream => break,
            }
        }
        Ok(())
    }

    fn stop(&self, _ctx: &ModuleContext) -> std::result::Result<(), ModuleError> {
        info!(module = %self.name, latency_us = %self.summary(), "latency probe stopped");
        Ok(())
    }
}
