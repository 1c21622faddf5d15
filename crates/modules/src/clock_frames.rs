//! Simulated frame source with its own device clock
//!
//! Event-driven: every poll emits the frames that became due since the last
//! one. Device timestamps run at `1 + drift_ppm` against the host and start at
//! a fixed offset; the secondary-clock synchronizer maps them back.

use std::time::Duration;

use contracts::{ModuleBlueprint, ModuleDriver, SynchronizerConfig, TestSubject};
use engine::{Module, ModuleContext, ModuleError};
use parking_lot::Mutex;
use stream::{ModulePorts, Stream};
use sync_engine::{SecondaryClockSynchronizer, SyncError};
use tracing::{debug, info, instrument, warn};

use crate::error::{RegistryError, Result};
use crate::items::ClockFrame;
use crate::registry::resolve_driver;

pub const KIND: &str = "clock_frames";

/// Id of the output port
pub const OUTPUT_PORT: &str = "frames";

/// Configuration for [`ClockFrames`]
#[derive(Debug, Clone)]
pub struct ClockFramesConfig {
    pub frame_rate_hz: f64,
    /// Device clock reading at master time zero
    pub clock_offset_us: i64,
    /// Simulated device clock error in parts per million
    pub drift_ppm: f64,
    pub driver: ModuleDriver,
    pub events_group: Option<String>,
    pub sync: SynchronizerConfig,
}

impl Default for ClockFramesConfig {
    fn default() -> Self {
        Self {
            frame_rate_hz: 30.0,
            clock_offset_us: 2_500_000,
            drift_ppm: 0.0,
            driver: ModuleDriver::EventsDedicated,
            events_group: None,
            sync: SynchronizerConfig::default(),
        }
    }
}

impl ClockFramesConfig {
    /// Create config from a blueprint entry
    pub fn from_blueprint(bp: &ModuleBlueprint) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            frame_rate_hz: bp.param_f64("frame_rate_hz", defaults.frame_rate_hz),
            clock_offset_us: bp
                .param_f64("clock_offset_us", defaults.clock_offset_us as f64)
                .round() as i64,
            drift_ppm: bp.param_f64("drift_ppm", defaults.drift_ppm),
            driver: resolve_driver(
                bp,
                ModuleDriver::EventsDedicated,
                &[ModuleDriver::EventsDedicated, ModuleDriver::EventsShared],
            )?,
            events_group: bp.events_group.clone(),
            sync: bp.sync.clone(),
        };

        if config.frame_rate_hz.is_nan() || config.frame_rate_hz <= 0.0 {
            return Err(RegistryError::invalid_param(&bp.name, "frame_rate_hz", "must be > 0"));
        }
        Ok(config)
    }

    /// Master time at which frame `index` is captured
    fn due_us(&self, index: u64) -> i64 {
        (index as f64 * 1e6 / self.frame_rate_hz).round() as i64
    }

    /// Device clock reading at master time `master_us`
    fn device_us(&self, master_us: i64) -> i64 {
        self.clock_offset_us + (master_us as f64 * (1.0 + self.drift_ppm * 1e-6)).round() as i64
    }
}

#[derive(Default)]
struct FrameState {
    sync: Option<SecondaryClockSynchronizer>,
    next_index: u64,
}

/// Secondary-clock frame source
pub struct ClockFrames {
    name: String,
    config: ClockFramesConfig,
    ports: ModulePorts,
    output: Stream<ClockFrame>,
    state: Mutex<FrameState>,
}

impl ClockFrames {
    pub fn new(name: impl Into<String>, config: ClockFramesConfig) -> Self {
        let mut ports = ModulePorts::new();
        let output = ports.add_output(OUTPUT_PORT, "Device frames");
        output.set_metadata_value("frame_rate_hz", serde_json::json!(config.frame_rate_hz));

        Self {
            name: name.into(),
            config,
            ports,
            output,
            state: Mutex::new(FrameState::default()),
        }
    }

    /// Create from a blueprint entry (for the registry)
    pub fn from_blueprint(bp: &ModuleBlueprint) -> Result<Self> {
        Ok(Self::new(&bp.name, ClockFramesConfig::from_blueprint(bp)?))
    }

    pub fn config(&self) -> &ClockFramesConfig {
        &self.config
    }

    /// Frames emitted during the last run
    pub fn frames_sent(&self) -> u64 {
        self.state.lock().next_index
    }
}

impl Module for ClockFrames {
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

    #[instrument(name = "clock_frames_prepare", skip_all, fields(module = %self.name))]
    fn prepare(&self, ctx: &ModuleContext, _test_subject: &TestSubject) -> std::result::Result<(), ModuleError> {
        let sync = ctx.new_secondary_synchronizer("frames", &self.config.sync)?;
        let mut state = self.state.lock();
        state.sync = Some(sync);
        state.next_index = 0;
        debug!(frame_rate_hz = self.config.frame_rate_hz, "frame source prepared");
        Ok(())
    }

    fn start(&self, _ctx: &ModuleContext) -> std::result::Result<(), ModuleError> {
        let mut state = self.state.lock();
        let sync = state
            .sync
            .as_mut()
            .ok_or_else(|| ModuleError::failed("synchronizer missing, module was not prepared"))?;
        match sync.start() {
            Ok(()) => Ok(()),
            Err(SyncError::TimeSync(e)) => {
                warn!(module = %self.name, error = %e, "TimeSyncFile unavailable, acquiring without it");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn process_events(&self, ctx: &ModuleContext) -> std::result::Result<(), ModuleError> {
        let now_us = ctx.clock().now_us();
        let due = {
            let mut state = self.state.lock();
            let FrameState { sync, next_index } = &mut *state;
            let Some(sync) = sync.as_mut() else {
                return Ok(());
            };
            let mut due = Vec::new();
            while self.config.due_us(*next_index) <= now_us {
                let device_us = self.config.device_us(self.config.due_us(*next_index));
                due.push(ClockFrame {
                    index: *next_index,
                    device_us,
                    master_us: sync.process_timestamp(now_us, device_us),
                });
                *next_index += 1;
            }
            due
        };

        // pushes may block on a full consumer queue, so the state lock is released first
        for frame in due {
            self.output.push(frame);
        }
        Ok(())
    }

    fn event_interval(&self) -> Duration {
        Duration::from_secs_f64(0.5 / self.config.frame_rate_hz).min(engine::DEFAULT_EVENT_INTERVAL)
    }

    fn stop(&self, _ctx: &ModuleContext) -> std::result::Result<(), ModuleError> {
        let mut guard = self.state.lock();
        let FrameState { sync, next_index } = &mut *guard;
        if let Some(sync) = sync.as_mut() {
            sync.stop();
            info!(
                frames = *next_index,
                calibrated = sync.is_calibrated(),
                correction_us = sync.clock_correction_us(),
                "frame source stopped"
            );
        }
        Ok(())
    }
}
