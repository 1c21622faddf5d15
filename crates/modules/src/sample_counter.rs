//! Simulated counter-driven acquisition device
//!
//! Produces [`SampleBlock`]s at a nominal sampling frequency on a dedicated
//! thread. The simulated device clock can drift against the host so the
//! frequency-counter synchronizer has something to correct.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use contracts::{ModuleBlueprint, ModuleDriver, ModuleFeatures, SynchronizerConfig, TestSubject};
use engine::{Module, ModuleContext, ModuleError, OptionalWaitCondition};
use parking_lot::Mutex;
use stream::{ModulePorts, Stream};
use sync_engine::{FreqCounterSynchronizer, SyncError};
use tracing::{debug, info, instrument, warn};

use crate::error::{RegistryError, Result};
use crate::items::SampleBlock;
use crate::registry::resolve_driver;

pub const KIND: &str = "sample_counter";

/// Id of the output port
pub const OUTPUT_PORT: &str = "samples";

/// Longest uninterrupted sleep, so stop requests are noticed quickly
const MAX_SLEEP: Duration = Duration::from_millis(20);

/// Configuration for [`SampleCounter`]
#[derive(Debug, Clone)]
pub struct SampleCounterConfig {
    /// Nominal sampling frequency of the device
    pub frequency_hz: f64,
    /// Samples per delivered block
    pub block_size: u64,
    /// Transfer latency subtracted from the receive time
    pub device_latency_us: i64,
    /// Simulated device clock error in parts per million
    pub drift_ppm: f64,
    /// Frequency of the generated sine signal
    pub signal_hz: f64,
    pub realtime: bool,
    pub driver: ModuleDriver,
    pub sync: SynchronizerConfig,
}

impl Default for SampleCounterConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 1000.0,
            block_size: 50,
            device_latency_us: 0,
            drift_ppm: 0.0,
            signal_hz: 10.0,
            realtime: false,
            driver: ModuleDriver::ThreadDedicated,
            sync: SynchronizerConfig::default(),
        }
    }
}

impl SampleCounterConfig {
    /// Create config from a blueprint entry
    pub fn from_blueprint(bp: &ModuleBlueprint) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            frequency_hz: bp.param_f64("frequency_hz", defaults.frequency_hz),
            block_size: bp.param_u64("block_size", defaults.block_size),
            device_latency_us: bp.param_f64("device_latency_us", 0.0).round() as i64,
            drift_ppm: bp.param_f64("drift_ppm", defaults.drift_ppm),
            signal_hz: bp.param_f64("signal_hz", defaults.signal_hz),
            realtime: bp
                .params
                .get("realtime")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
            driver: resolve_driver(bp, ModuleDriver::ThreadDedicated, &[ModuleDriver::ThreadDedicated])?,
            sync: bp.sync.clone(),
        };

        if config.frequency_hz.is_nan() || config.frequency_hz <= 0.0 {
            return Err(RegistryError::invalid_param(&bp.name, "frequency_hz", "must be > 0"));
        }
        if config.block_size == 0 {
            return Err(RegistryError::invalid_param(&bp.name, "block_size", "must be > 0"));
        }
        if config.drift_ppm <= -1e6 {
            return Err(RegistryError::invalid_param(&bp.name, "drift_ppm", "must be > -1e6"));
        }
        Ok(config)
    }

    /// Sampling rate of the simulated device measured on the host clock
    fn device_rate_hz(&self) -> f64 {
        self.frequency_hz * (1.0 + self.drift_ppm * 1e-6)
    }
}

/// Counter-driven sample source
pub struct SampleCounter {
    name: String,
    config: SampleCounterConfig,
    ports: ModulePorts,
    output: Stream<SampleBlock>,
    sync: Mutex<Option<FreqCounterSynchronizer>>,
    blocks_sent: AtomicU64,
}

impl SampleCounter {
    pub fn new(name: impl Into<String>, config: SampleCounterConfig) -> Self {
        let mut ports = ModulePorts::new();
        let output = ports.add_output(OUTPUT_PORT, "Sample blocks");
        output.set_metadata_value("frequency_hz", serde_json::json!(config.frequency_hz));
        output.set_metadata_value("block_size", serde_json::json!(config.block_size));

        Self {
            name: name.into(),
            config,
            ports,
            output,
            sync: Mutex::new(None),
            blocks_sent: AtomicU64::new(0),
        }
    }

    /// Create from a blueprint entry (for the registry)
    pub fn from_blueprint(bp: &ModuleBlueprint) -> Result<Self> {
        Ok(Self::new(&bp.name, SampleCounterConfig::from_blueprint(bp)?))
    }

    pub fn config(&self) -> &SampleCounterConfig {
        &self.config
    }

    /// Blocks pushed during the last run
    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent.load(Ordering::Relaxed)
    }

    fn block(&self, first: u64, phase: f64) -> (Vec<u64>, Vec<f64>) {
        let indices: Vec<u64> = (first..first + self.config.block_size).collect();
        let values = indices
            .iter()
            .map(|&i| (TAU * self.config.signal_hz * i as f64 / self.config.frequency_hz + phase).sin())
            .collect();
        (indices, values)
    }
}

impl Module for SampleCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> &str {
        KIND
    }

    fn driver(&self) -> ModuleDriver {
        self.config.driver
    }

    fn features(&self) -> ModuleFeatures {
        let mut features = ModuleFeatures::REQUEST_CPU_AFFINITY;
        if self.config.realtime {
            features |= ModuleFeatures::REALTIME;
        }
        features
    }

    fn ports(&self) -> &ModulePorts {
        &self.ports
    }

    #[instrument(name = "sample_counter_prepare", skip_all, fields(module = %self.name))]
    fn prepare(&self, ctx: &ModuleContext, _test_subject: &TestSubject) -> std::result::Result<(), ModuleError> {
        let sync = ctx.new_freq_synchronizer(self.config.frequency_hz, "samples", &self.config.sync)?;
        *self.sync.lock() = Some(sync);
        self.blocks_sent.store(0, Ordering::Relaxed);
        debug!(frequency_hz = self.config.frequency_hz, "device prepared");
        Ok(())
    }

    fn run_thread(
        &self,
        ctx: &ModuleContext,
        start_wait: &OptionalWaitCondition,
    ) -> std::result::Result<(), ModuleError> {
        let mut sync = self
            .sync
            .lock()
            .take()
            .ok_or_else(|| ModuleError::failed("synchronizer missing, module was not prepared"))?;

        start_wait.wait();
        if !ctx.is_running() {
            return Ok(());
        }
        match sync.start() {
            Ok(()) => {}
            Err(SyncError::TimeSync(e)) => {
                warn!(module = %self.name, error = %e, "TimeSyncFile unavailable, acquiring without it");
            }
            Err(e) => return Err(e.into()),
        }

        let clock = ctx.clock();
        let rate_hz = self.config.device_rate_hz();
        let phase = (ctx.rng_seed() % 3600) as f64 / 3600.0 * TAU;
        let latency_us = self.config.device_latency_us;
        let started = Instant::now();
        let mut counter: u64 = 0;

        while ctx.is_running() {
            let due = started
                + Duration::from_secs_f64((counter + self.config.block_size) as f64 / rate_hz);
            let now = Instant::now();
            if due > now {
                std::thread::sleep((due - now).min(MAX_SLEEP));
                continue;
            }

            let (mut indices, values) = self.block(counter, phase);
            sync.process_block(latency_us, 0, 1, &mut indices);
            self.output.push(SampleBlock {
                indices,
                master_us: clock.now_us(),
                values,
            });
            self.blocks_sent.fetch_add(1, Ordering::Relaxed);
            counter += self.config.block_size;
        }

        sync.stop();
        info!(
            blocks = self.blocks_sent(),
            samples = counter,
            calibrated = sync.is_calibrated(),
            correction_us = sync.time_correction_us(),
            "acquisition finished"
        );
        Ok(())
    }
}
