//! Synchronizer for devices that stamp samples with their own clock

use std::path::PathBuf;
use std::time::Duration;

use contracts::{
    SyncDetailsCallback, SyncState, SynchronizerConfig, TimeSyncFileMode, TimeSyncStrategies,
    DEFAULT_TOLERANCE_US,
};
use metrics::counter;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::common::{Calibration, Lifecycle, PairLog, Reporter, TsyncTarget};
use crate::tsync::TimeSyncHeader;
use crate::SyncError;

const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Samples of the IIR correction filter
const CORRECTION_SMOOTHING: f64 = 15.0;

/// Maps device timestamps onto the master clock
///
/// Returned master times never decrease.
pub struct SecondaryClockSynchronizer {
    module_name: String,
    tolerance_us: i64,
    strategies: TimeSyncStrategies,
    tsync_mode: TimeSyncFileMode,
    tsync_target: Option<TsyncTarget>,
    lifecycle: Lifecycle,
    calibration: Calibration,
    reporter: Reporter,
    pairs: PairLog,
    correction_us: f64,
    last_returned_us: Option<i64>,
    last_state: SyncState,
    last_logged_correction_us: f64,
}

impl SecondaryClockSynchronizer {
    pub fn new(module_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            tolerance_us: DEFAULT_TOLERANCE_US,
            strategies: TimeSyncStrategies::default(),
            tsync_mode: TimeSyncFileMode::default(),
            tsync_target: None,
            lifecycle: Lifecycle::Fresh,
            calibration: Calibration::new(0),
            reporter: Reporter::new(id.into(), DEFAULT_REPORT_INTERVAL),
            pairs: PairLog::disabled(),
            correction_us: 0.0,
            last_returned_us: None,
            last_state: SyncState::Calibrating,
            last_logged_correction_us: 0.0,
        }
    }

    pub fn id(&self) -> &str {
        self.reporter.id()
    }

    fn configurable(&self, what: &str) -> bool {
        if self.lifecycle == Lifecycle::Fresh && !self.calibration.done {
            return true;
        }
        warn!(sync = %self.reporter.id(), what, "configuration change after start rejected");
        false
    }

    /// Number of samples per calibration window; 0 selects the default
    pub fn set_calibration_window(&mut self, samples: usize) -> bool {
        if !self.configurable("calibration_window") {
            return false;
        }
        self.calibration = Calibration::new(samples);
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
            window = self.calibration.window(),
            tolerance_us = self.tolerance_us,
            "secondary clock synchronizer started"
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
        debug!(sync = %self.reporter.id(), "secondary clock synchronizer stopped");
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

    /// Damped drift estimate in µs; positive means the device runs ahead
    pub fn clock_correction_us(&self) -> i64 {
        self.correction_us.round() as i64
    }

    /// Master time (µs) for a sample stamped `secondary_us` by the device and
    /// received at `master_us`.
    pub fn process_timestamp(&mut self, master_us: i64, secondary_us: i64) -> i64 {
        if self.lifecycle != Lifecycle::Running {
            return self.monotonic(master_us);
        }

        let offset_us = secondary_us - master_us;
        if !self.calibration.done {
            let result = self.monotonic(master_us);
            if self.calibration.push(offset_us) {
                info!(
                    sync = %self.reporter.id(),
                    expected_offset_us = self.calibration.expected_offset_us,
                    expected_sd_us = self.calibration.expected_sd_us,
                    "calibration complete"
                );
                self.pairs.write(secondary_us, result);
                self.last_state = SyncState::InTolerance;
                self.report(true);
            } else {
                self.pairs.observe(secondary_us, result);
                self.report(false);
            }
            return result;
        }

        let expected = self.calibration.expected_offset_us;
        let admitted = self.calibration.admit(offset_us, self.tolerance_us);
        if admitted {
            self.update_correction(expected);
        }

        let mean = self.calibration.offsets.mean();
        let sd = self.calibration.offsets.std_dev();
        if !admitted || (sd > 0.0 && (offset_us as f64 - mean).abs() > sd) {
            trace!(sync = %self.reporter.id(), offset_us, mean, admitted, "timestamp fluke");
            counter!("daqflow_sync_flukes_total", "sync" => self.reporter.id().to_string()).increment(1);
            let result = self.monotonic(secondary_us - expected - self.applied_correction());
            self.log_pair(secondary_us, result);
            self.report(false);
            return result;
        }

        let expected_master = secondary_us - expected - self.applied_correction();
        let result = self.monotonic((expected_master + master_us) / 2);
        self.log_pair(secondary_us, result);
        self.report(false);
        result
    }

    /// One IIR step of the correction towards the window's deviation
    fn update_correction(&mut self, expected_offset_us: i64) {
        let deviation = self.calibration.offsets.mean() - expected_offset_us as f64;
        let tolerance = self.tolerance_us as f64;
        let target = if deviation.abs() >= tolerance {
            deviation
        } else if deviation.abs() < tolerance / 2.0 {
            0.0
        } else {
            self.correction_us
        };
        self.correction_us =
            (self.correction_us * (CORRECTION_SMOOTHING - 1.0) + target) / CORRECTION_SMOOTHING;
        if self.correction_us.abs() < 0.5 {
            self.correction_us = 0.0;
        }
    }

    /// Correction actually subtracted from device time
    fn applied_correction(&self) -> i64 {
        let correction = self.clock_correction_us();
        if self.strategies.permits_correction(correction) {
            correction
        } else {
            0
        }
    }

    fn monotonic(&mut self, time_us: i64) -> i64 {
        let time_us = match self.last_returned_us {
            Some(last) if time_us < last => last,
            _ => time_us,
        };
        self.last_returned_us = Some(time_us);
        time_us
    }

    /// Continuous: every pair. Syncpoints: on state change or when the
    /// correction moved by a quarter of the tolerance.
    fn log_pair(&mut self, secondary_us: i64, master_us: i64) {
        if self.pairs.is_continuous() {
            self.pairs.write(secondary_us, master_us);
            return;
        }
        let state = self.state();
        let moved = (self.correction_us - self.last_logged_correction_us).abs()
            >= self.tolerance_us as f64 / 4.0;
        if state != self.last_state || moved {
            self.last_state = state;
            self.last_logged_correction_us = self.correction_us;
            self.pairs.write(secondary_us, master_us);
        } else {
            self.pairs.observe(secondary_us, master_us);
        }
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
        let correction = self.clock_correction_us();
        self.reporter.report(state, expected, current, correction, force);
    }
}

impl Drop for SecondaryClockSynchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SecondaryClockSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryClockSynchronizer")
            .field("id", &self.reporter.id())
            .field("calibrated", &self.calibration.done)
            .field("correction_us", &self.correction_us)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsync::TimeSyncFileReader;

    fn synchronizer(window: usize) -> SecondaryClockSynchronizer {
        let mut sync = SecondaryClockSynchronizer::new("frames", "frames/video");
        assert!(sync.set_calibration_window(window));
        assert!(sync.set_tolerance(1000));
        sync
    }

    /// Feed `count` samples 10 ms apart starting at `t`, device ahead by `offset`
    fn feed(sync: &mut SecondaryClockSynchronizer, t: &mut i64, offset: i64, count: usize) -> Vec<i64> {
        (0..count)
            .map(|_| {
                *t += 10_000;
                sync.process_timestamp(*t, *t + offset)
            })
            .collect()
    }

    #[test]
    fn test_calibration_returns_raw_master_time() {
        let mut sync = synchronizer(10);
        sync.start().unwrap();
        let mut t = 0;
        let out = feed(&mut sync, &mut t, 3000, 19);
        assert!(!sync.is_calibrated());
        assert_eq!(out, (1..=19).map(|i| i * 10_000).collect::<Vec<_>>());

        feed(&mut sync, &mut t, 3000, 1);
        assert!(sync.is_calibrated());
        assert_eq!(sync.expected_offset_us(), 3000);
    }

    #[test]
    fn test_output_never_decreases() {
        let mut sync = synchronizer(10);
        sync.start().unwrap();
        let mut last = i64::MIN;
        for i in 0..200i64 {
            let master = i * 1000;
            // device glitches backward every seventh sample
            let secondary = if i % 7 == 0 { master - 50_000 } else { master + 200 };
            let out = sync.process_timestamp(master, secondary);
            assert!(out >= last, "sample {i}: {out} < {last}");
            last = out;
        }
    }

    #[test]
    fn test_late_receipt_is_a_fluke() {
        let mut sync = synchronizer(20);
        sync.start().unwrap();
        let mut t = 0;
        feed(&mut sync, &mut t, 2000, 40);

        // sample received 8 ms late: device time is trusted instead
        t += 10_000;
        let out = sync.process_timestamp(t + 8000, t + 2000);
        assert_eq!(out, t);
        assert_eq!(sync.clock_correction_us(), 0);
    }

    #[test]
    fn test_large_outlier_leaves_correction_untouched() {
        let mut sync = synchronizer(20);
        sync.start().unwrap();
        let mut t = 0;
        feed(&mut sync, &mut t, 2000, 40);

        // device stamp 100 ms ahead of every other sample
        t += 10_000;
        sync.process_timestamp(t, t + 2000 + 100_000);
        let mut max_correction = sync.clock_correction_us();
        for _ in 0..10 {
            feed(&mut sync, &mut t, 2000, 1);
            max_correction = max_correction.max(sync.clock_correction_us());
        }
        assert_eq!(max_correction, 0);
        assert_eq!(sync.expected_offset_us(), 2000);
    }

    #[test]
    fn test_sustained_large_offset_is_corrected() {
        let mut sync = synchronizer(20);
        sync.start().unwrap();
        let mut t = 0;
        feed(&mut sync, &mut t, 2000, 40);

        feed(&mut sync, &mut t, 102_000, 10);
        assert!(sync.clock_correction_us() > 0);
    }

    #[test]
    fn test_in_tolerance_averages_both_clocks() {
        let mut sync = synchronizer(10);
        sync.start().unwrap();
        let mut t = 0;
        feed(&mut sync, &mut t, 0, 20);

        let out = feed(&mut sync, &mut t, 0, 5);
        assert_eq!(out.last().copied(), Some(t));
        assert_eq!(sync.clock_correction_us(), 0);
    }

    #[test]
    fn test_sustained_drift_is_tracked_without_overshoot() {
        let mut sync = synchronizer(20);
        sync.start().unwrap();
        let mut t = 0;
        feed(&mut sync, &mut t, 0, 40);

        for _ in 0..300 {
            feed(&mut sync, &mut t, 5000, 1);
            assert!(sync.clock_correction_us() <= 5000);
        }
        assert!(sync.clock_correction_us() >= 4900);

        // corrected device time and master time agree again
        let out = feed(&mut sync, &mut t, 5000, 1);
        assert!((out[0] - t).abs() <= 100);
    }

    #[test]
    fn test_correction_decays_after_drift() {
        let mut sync = synchronizer(20);
        sync.start().unwrap();
        let mut t = 0;
        feed(&mut sync, &mut t, 0, 40);
        feed(&mut sync, &mut t, 5000, 300);
        assert!(sync.clock_correction_us() > 4000);

        feed(&mut sync, &mut t, 0, 300);
        assert_eq!(sync.clock_correction_us(), 0);
    }

    #[test]
    fn test_misuse_is_rejected() {
        let mut sync = synchronizer(10);
        sync.start().unwrap();
        assert!(!sync.set_calibration_window(3));
        assert!(!sync.set_tolerance(10));
        sync.stop();
        assert!(matches!(sync.start(), Err(SyncError::AlreadyUsed(_))));
    }

    #[test]
    fn test_unwritable_tsync_file_keeps_synchronizing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.tsync");
        std::fs::create_dir(&path).unwrap();

        let mut sync = synchronizer(5);
        assert!(sync.set_strategies(TimeSyncStrategies::default() | TimeSyncStrategies::WRITE_TSYNCFILE));
        assert!(sync.set_tsync_file(&path, Uuid::new_v4()));
        assert!(matches!(sync.start(), Err(SyncError::TimeSync(_))));
        assert!(sync.is_running());

        let mut t = 0;
        feed(&mut sync, &mut t, 1500, 10);
        assert!(sync.is_calibrated());
        assert_eq!(sync.expected_offset_us(), 1500);
    }

    #[test]
    fn test_tsync_survives_abrupt_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.tsync");

        let mut sync = synchronizer(5);
        assert!(sync.set_strategies(TimeSyncStrategies::default() | TimeSyncStrategies::WRITE_TSYNCFILE));
        assert!(sync.set_tsync_file(&path, Uuid::new_v4()));
        sync.start().unwrap();
        let mut t = 0;
        feed(&mut sync, &mut t, 1500, 30);
        drop(sync);

        let file = TimeSyncFileReader::open(&path).unwrap();
        assert_eq!(file.header.module_name, "frames");
        assert_eq!(file.pairs.first(), Some(&(100_000 + 1500, 100_000)));
        assert_eq!(file.pairs.last(), Some(&(t + 1500, t)));
    }
}
