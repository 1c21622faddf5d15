//! Synchronizer for devices that only deliver sample counters
//!
//! The device samples at a nominal frequency and hands over blocks of
//! consecutive sample indices. Receipt time, device latency and the number of
//! samples still queued in the current transfer give the master time at which
//! the last sample of a block was acquired; the difference to the index-derived
//! device time is the clock offset tracked here.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use contracts::{
    SyncDetailsCallback, SyncState, SynchronizerConfig, TimeSyncDataType, TimeSyncFileMode,
    TimeSyncStrategies, TimeSyncUnit, DEFAULT_TOLERANCE_US,
};
use metrics::counter;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::common::{Calibration, Lifecycle, PairLog, Reporter, TsyncTarget};
use crate::tsync::TimeSyncHeader;
use crate::{MasterClock, SyncError};

const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Aligns sample indices of a fixed-frequency device with the master clock
pub struct FreqCounterSynchronizer {
    clock: Arc<MasterClock>,
    module_name: String,
    frequency_hz: f64,
    time_per_sample_us: f64,
    tolerance_us: i64,
    strategies: TimeSyncStrategies,
    tsync_mode: TimeSyncFileMode,
    tsync_target: Option<TsyncTarget>,
    lifecycle: Lifecycle,
    calibration: Calibration,
    reporter: Reporter,
    pairs: PairLog,
    cooldown: usize,
    correction_us: f64,
    index_offset: i64,
}

impl FreqCounterSynchronizer {
    pub fn new(
        clock: Arc<MasterClock>,
        module_name: impl Into<String>,
        frequency_hz: f64,
        id: impl Into<String>,
    ) -> Self {
        let module_name = module_name.into();
        let frequency_hz = if frequency_hz.is_finite() && frequency_hz > 0.0 {
            frequency_hz
        } else {
            warn!(module = %module_name, frequency_hz, "invalid sampling frequency, assuming 1 Hz");
            1.0
        };
        Self {
            clock,
            module_name,
            frequency_hz,
            time_per_sample_us: 1e6 / frequency_hz,
            tolerance_us: DEFAULT_TOLERANCE_US,
            strategies: TimeSyncStrategies::default(),
            tsync_mode: TimeSyncFileMode::default(),
            tsync_target: None,
            lifecycle: Lifecycle::Fresh,
            calibration: Calibration::new(0),
            reporter: Reporter::new(id.into(), DEFAULT_REPORT_INTERVAL),
            pairs: PairLog::disabled(),
            cooldown: 0,
            correction_us: 0.0,
            index_offset: 0,
        }
    }

    pub fn id(&self) -> &str {
        self.reporter.id()
    }

    pub fn frequency_hz(&self) -> f64 {
        self.frequency_hz
    }

    fn configurable(&self, what: &str) -> bool {
        if self.lifecycle == Lifecycle::Fresh && !self.calibration.done {
            return true;
        }
        warn!(sync = %self.reporter.id(), what, "configuration change after start rejected");
        false
    }

    /// Number of blocks per calibration window; 0 selects the default
    pub fn set_calibration_blocks(&mut self, blocks: usize) -> bool {
        if !self.configurable("calibration_blocks") {
            return false;
        }
        self.calibration = Calibration::new(blocks);
        true
    }

    pub fn set_tolerance(&mut self, tolerance_us: i64) -> bool {
        if tolerance_us <= 0 {
            warn!(sync = %self.reporter.id(), tolerance_us, "tolerance must be positive");
            return false;
        }
        if !self.configurable("tolerance") {
            return false;
        }
        self.tolerance_us = tolerance_us;
        true
    }

    pub fn set_strategies(&mut self, strategies: TimeSyncStrategies) -> bool {
        if !self.configurable("strategies") {
            return false;
        }
        self.strategies = strategies;
        true
    }

    pub fn set_tsync_mode(&mut self, mode: TimeSyncFileMode) -> bool {
        if !self.configurable("tsync_mode") {
            return false;
        }
        self.tsync_mode = mode;
        true
    }

    /// Where to write the TimeSyncFile if `WRITE_TSYNCFILE` is enabled
    pub fn set_tsync_file(&mut self, path: impl Into<PathBuf>, collection_id: Uuid) -> bool {
        if !self.configurable("tsync_file") {
            return false;
        }
        self.tsync_target = Some(TsyncTarget {
            path: path.into(),
            collection_id,
        });
        true
    }

    pub fn set_details_callback(&mut self, callback: SyncDetailsCallback) {
        self.reporter.set_callback(callback);
    }

    /// Apply every setting of a blueprint synchronizer section
    pub fn apply_config(&mut self, config: &SynchronizerConfig) -> bool {
        if !self.configurable("config") {
            return false;
        }
        self.calibration = Calibration::new(config.calibration_window);
        self.tolerance_us = config.tolerance_us.max(1);
        self.strategies = config.strategies;
        self.tsync_mode = config.tsync_mode;
        self.reporter
            .set_interval(Duration::from_secs_f64(config.report_interval_s.max(0.0)));
        true
    }

    /// Begin the run, opening the TimeSyncFile when requested.
    ///
    /// # Errors
    /// - `AlreadyUsed` if this synchronizer already finished a run
    /// - `TimeSync` if the TimeSyncFile cannot be created; the synchronizer
    ///   is running anyway, just without a file
    #[instrument(skip(self), fields(sync = %self.reporter.id()))]
    pub fn start(&mut self) -> Result<(), SyncError> {
        match self.lifecycle {
            Lifecycle::Finished => return Err(SyncError::AlreadyUsed(self.reporter.id().to_string())),
            Lifecycle::Running => return Ok(()),
            Lifecycle::Fresh => {}
        }

        let mut tsync_error = None;
        if self.strategies.contains(TimeSyncStrategies::WRITE_TSYNCFILE) {
            match &self.tsync_target {
                Some(target) => {
                    let header = TimeSyncHeader::new(
                        &self.module_name,
                        target.collection_id,
                        self.tolerance_us,
                        self.tsync_mode,
                    )
                    .with_columns(
                        ["device-index", "master-time"],
                        [TimeSyncUnit::Index, TimeSyncUnit::Microseconds],
                        [TimeSyncDataType::UInt64, TimeSyncDataType::Int64],
                    );
                    match PairLog::open(target, header) {
                        Ok(pairs) => self.pairs = pairs,
                        Err(e) => tsync_error = Some(e),
                    }
                }
                None => warn!("WRITE_TSYNCFILE set without a tsync file path"),
            }
        }

        self.lifecycle = Lifecycle::Running;
        debug!(
            frequency_hz = self.frequency_hz,
            window = self.calibration.window(),
            tolerance_us = self.tolerance_us,
            "freq counter synchronizer started"
        );
        match tsync_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// End the run and write the last known pair. Idempotent.
    pub fn stop(&mut self) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        self.lifecycle = Lifecycle::Finished;
        if let Err(e) = self.pairs.finish() {
            warn!(sync = %self.reporter.id(), error = %e, "failed to finish TimeSyncFile");
        }
        self.report(true);
        debug!(sync = %self.reporter.id(), index_offset = self.index_offset, "freq counter synchronizer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == Lifecycle::Running
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration.done
    }

    pub fn expected_offset_us(&self) -> i64 {
        self.calibration.expected_offset_us
    }

    pub fn expected_sd_us(&self) -> f64 {
        self.calibration.expected_sd_us
    }

    /// Current correction in samples; positive means the device runs ahead
    pub fn index_offset(&self) -> i64 {
        self.index_offset
    }

    /// Current correction in µs
    pub fn time_correction_us(&self) -> i64 {
        self.correction_us.round() as i64
    }

    /// [`process_timestamps`](Self::process_timestamps) with the block received now
    pub fn process_block(
        &mut self,
        device_latency_us: i64,
        block_index: u64,
        block_count: u64,
        indices: &mut [u64],
    ) {
        let recv_ts_us = self.clock.now_us();
        self.process_timestamps(recv_ts_us, device_latency_us, block_index, block_count, indices);
    }

    /// Track the clock offset of one block and shift its indices in place.
    ///
    /// `block_index` / `block_count` locate the block inside a transfer that
    /// arrived at once; blocks later in the transfer are still pending at
    /// `recv_ts_us`. Index wrap-around is the caller's concern.
    pub fn process_timestamps(
        &mut self,
        recv_ts_us: i64,
        device_latency_us: i64,
        block_index: u64,
        block_count: u64,
        indices: &mut [u64],
    ) {
        if self.lifecycle != Lifecycle::Running {
            trace!(sync = %self.reporter.id(), "block outside of a run ignored");
            return;
        }
        let Some(&last_raw) = indices.last() else {
            return;
        };

        let pending = block_count.saturating_sub(block_index.saturating_add(1)) * indices.len() as u64;
        let master_assumed_us =
            recv_ts_us - device_latency_us - (self.time_per_sample_us * pending as f64).round() as i64;
        let secondary_last_us = (self.time_per_sample_us * (last_raw as f64 + 1.0)).round() as i64;
        let offset_us = secondary_last_us - master_assumed_us;
        let pair = (i64::try_from(last_raw).unwrap_or(i64::MAX), master_assumed_us);

        if !self.calibration.done {
            if self.calibration.push(offset_us) {
                info!(
                    sync = %self.reporter.id(),
                    expected_offset_us = self.calibration.expected_offset_us,
                    expected_sd_us = self.calibration.expected_sd_us,
                    "calibration complete"
                );
                self.pairs.write(pair.0, pair.1);
                self.report(true);
            } else {
                self.report(false);
            }
        } else {
            self.cooldown = self.cooldown.saturating_sub(1);
            if self.calibration.admit(offset_us, self.tolerance_us) {
                if self.track_drift() && !self.pairs.is_continuous() {
                    self.pairs.write(pair.0, pair.1);
                }
            } else {
                trace!(sync = %self.reporter.id(), offset_us, "offset fluke ignored");
                counter!("daqflow_sync_flukes_total", "sync" => self.reporter.id().to_string()).increment(1);
                self.report(false);
            }
        }

        if self.pairs.is_continuous() {
            self.pairs.write(pair.0, pair.1);
        } else {
            self.pairs.observe(pair.0, pair.1);
        }

        if self.index_offset != 0 && self.strategies.permits_correction(self.index_offset) {
            for index in indices.iter_mut() {
                *index = index.saturating_add_signed(-self.index_offset);
            }
        }
    }

    /// Update the correction after an offset was admitted to the window;
    /// true when the index offset changed.
    fn track_drift(&mut self) -> bool {
        let mean = self.calibration.offsets.mean();
        let deviation = mean - self.calibration.expected_offset_us as f64;
        let tolerance = self.tolerance_us as f64;

        if deviation.abs() < tolerance {
            let mut changed = false;
            if self.correction_us != 0.0 && deviation.abs() < tolerance / 2.0 && self.cooldown == 0 {
                self.correction_us /= 2.0;
                if self.correction_us.abs() < 1.0 {
                    self.correction_us = 0.0;
                }
                self.cooldown = self.calibration.cooldown();
                changed = self.update_index_offset();
            }
            self.report(changed);
            return changed;
        }

        if self.cooldown > 0 {
            self.report(false);
            return false;
        }

        let max_step = deviation.abs() / 4.0;
        let step = (deviation - self.correction_us).clamp(-max_step, max_step);
        if step == 0.0 {
            self.report(false);
            return false;
        }
        self.correction_us += step;
        self.cooldown = self.calibration.cooldown();
        let changed = self.update_index_offset();
        debug!(
            sync = %self.reporter.id(),
            deviation_us = deviation,
            correction_us = self.correction_us,
            index_offset = self.index_offset,
            "clock drift correction step"
        );
        self.report(changed);
        changed
    }

    fn update_index_offset(&mut self) -> bool {
        let index_offset = (self.correction_us / 1e6 * self.frequency_hz).round() as i64;
        if index_offset == self.index_offset {
            return false;
        }
        self.index_offset = index_offset;
        if !self.strategies.permits_correction(index_offset) {
            debug!(sync = %self.reporter.id(), index_offset, "correction direction not permitted, tracking only");
        }
        true
    }

    fn state(&self) -> SyncState {
        if !self.calibration.done {
            SyncState::Calibrating
        } else if self.correction_us == 0.0 {
            SyncState::InTolerance
        } else {
            SyncState::Correcting
        }
    }

    fn report(&mut self, force: bool) {
        let state = self.state();
        let current = self.calibration.offsets.mean().round() as i64;
        let expected = self.calibration.expected_offset_us;
        let correction = self.time_correction_us();
        self.reporter.report(state, expected, current, correction, force);
    }
}

impl Drop for FreqCounterSynchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for FreqCounterSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreqCounterSynchronizer")
            .field("id", &self.reporter.id())
            .field("frequency_hz", &self.frequency_hz)
            .field("calibrated", &self.calibration.done)
            .field("index_offset", &self.index_offset)
            .finish()
    }
}
