//! Building blocks shared by both synchronizers

use std::path::PathBuf;
use std::time::{Duration, Instant};

use contracts::{SyncDetails, SyncDetailsCallback, SyncState, TimeSyncFileMode, DEFAULT_CALIBRATION_WINDOW};
use metrics::gauge;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::tsync::{TimeSyncFileWriter, TimeSyncHeader};
use crate::{OffsetBuffer, SyncError, TimeSyncError};

/// Usage stage of a synchronizer; one run per instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Fresh,
    Running,
    Finished,
}

/// Consecutive outliers on the same side after which they count as drift
const DRIFT_STREAK: u32 = 3;

/// Offset window plus the expectation derived from it
#[derive(Debug)]
pub(crate) struct Calibration {
    pub(crate) offsets: OffsetBuffer,
    window: usize,
    count: usize,
    pub(crate) expected_offset_us: i64,
    pub(crate) expected_sd_us: f64,
    pub(crate) done: bool,
    outlier_streak: u32,
    outlier_above: bool,
}

impl Calibration {
    pub(crate) fn new(window: usize) -> Self {
        let window = if window == 0 {
            DEFAULT_CALIBRATION_WINDOW
        } else {
            window
        };
        Self {
            offsets: OffsetBuffer::new(window),
            window,
            count: 0,
            expected_offset_us: 0,
            expected_sd_us: 0.0,
            done: false,
            outlier_streak: 0,
            outlier_above: false,
        }
    }

    pub(crate) fn window(&self) -> usize {
        self.window
    }

    /// Record a calibration offset; returns true when this sample completed
    /// calibration. Afterwards offsets go through [`admit`](Self::admit).
    ///
    /// Calibration completes once the window has been filled twice.
    pub(crate) fn push(&mut self, offset_us: i64) -> bool {
        if self.done {
            return false;
        }
        self.offsets.push(offset_us);
        self.count += 1;
        if self.count < 2 * self.window {
            return false;
        }
        self.expected_offset_us = self.offsets.median();
        self.expected_sd_us = self.offsets.std_dev();
        self.done = true;
        true
    }

    /// Add a post-calibration offset to the window unless it is a fluke.
    ///
    /// A fluke lies further from the window mean than both its standard
    /// deviation and `tolerance_us`; it is judged against the window as it
    /// stands and never enters it. A run of [`DRIFT_STREAK`] outliers on the
    /// same side is drift: from then on they are admitted until an offset
    /// falls back inside the band.
    pub(crate) fn admit(&mut self, offset_us: i64, tolerance_us: i64) -> bool {
        let deviation = offset_us as f64 - self.offsets.mean();
        let band = self
            .offsets
            .std_dev()
            .max(self.expected_sd_us)
            .max(tolerance_us as f64);
        if deviation.abs() <= band {
            self.outlier_streak = 0;
            self.offsets.push(offset_us);
            return true;
        }

        let above = deviation > 0.0;
        if self.outlier_streak > 0 && above == self.outlier_above {
            self.outlier_streak = self.outlier_streak.saturating_add(1);
        } else {
            self.outlier_streak = 1;
            self.outlier_above = above;
        }
        if self.outlier_streak < DRIFT_STREAK {
            return false;
        }
        self.offsets.push(offset_us);
        true
    }

    /// Blocks/samples to wait after an adjustment
    pub(crate) fn cooldown(&self) -> usize {
        (self.window as f64 * 1.5).ceil() as usize
    }
}

/// Publishes sync details through the callback and as metrics
pub(crate) struct Reporter {
    id: String,
    callback: Option<SyncDetailsCallback>,
    interval: Duration,
    last_report: Option<Instant>,
    last_state: SyncState,
}

impl Reporter {
    pub(crate) fn new(id: String, interval: Duration) -> Self {
        Self {
            id,
            callback: None,
            interval,
            last_report: None,
            last_state: SyncState::Calibrating,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn set_callback(&mut self, callback: SyncDetailsCallback) {
        self.callback = Some(callback);
    }

    pub(crate) fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Report now if the state changed, `force` is set, or the interval elapsed
    pub(crate) fn report(
        &mut self,
        state: SyncState,
        expected_offset_us: i64,
        current_offset_us: i64,
        correction_us: i64,
        force: bool,
    ) {
        let now = Instant::now();
        let due = self
            .last_report
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if !(force || due || state != self.last_state) {
            return;
        }
        self.last_report = Some(now);
        self.last_state = state;

        gauge!("daqflow_sync_offset_us", "sync" => self.id.clone()).set(current_offset_us as f64);
        gauge!("daqflow_sync_correction_us", "sync" => self.id.clone()).set(correction_us as f64);
        debug!(
            sync = %self.id,
            ?state,
            expected_offset_us,
            current_offset_us,
            correction_us,
            "sync details"
        );

        if let Some(callback) = &self.callback {
            callback(SyncDetails {
                id: self.id.clone(),
                state,
                expected_offset_us,
                current_offset_us,
                correction_us,
            });
        }
    }
}

/// Where and how a synchronizer writes its TimeSyncFile
#[derive(Debug, Clone)]
pub(crate) struct TsyncTarget {
    pub(crate) path: PathBuf,
    pub(crate) collection_id: Uuid,
}

/// TimeSyncFile writer wrapper keeping the pair sequence monotone
pub(crate) struct PairLog {
    writer: Option<TimeSyncFileWriter>,
    mode: TimeSyncFileMode,
    last_seen: Option<(i64, i64)>,
    last_written: Option<(i64, i64)>,
}

impl PairLog {
    pub(crate) fn disabled() -> Self {
        Self {
            writer: None,
            mode: TimeSyncFileMode::Syncpoints,
            last_seen: None,
            last_written: None,
        }
    }

    pub(crate) fn open(target: &TsyncTarget, header: TimeSyncHeader) -> Result<Self, SyncError> {
        let mode = header.mode;
        let writer = TimeSyncFileWriter::create(&target.path, header)?;
        Ok(Self {
            writer: Some(writer),
            mode,
            last_seen: None,
            last_written: None,
        })
    }

    pub(crate) fn is_continuous(&self) -> bool {
        self.mode == TimeSyncFileMode::Continuous
    }

    /// Remember the latest pair without writing it
    pub(crate) fn observe(&mut self, time1: i64, time2: i64) {
        self.last_seen = Some((time1, time2));
    }

    /// Observe and write a pair; pairs going backward are skipped.
    pub(crate) fn write(&mut self, time1: i64, time2: i64) {
        self.observe(time1, time2);
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Some((prev1, prev2)) = self.last_written {
            if time1 < prev1 || time2 < prev2 || (time1, time2) == (prev1, prev2) {
                return;
            }
        }
        match writer.write_pair(time1, time2) {
            Ok(()) => self.last_written = Some((time1, time2)),
            Err(e) => warn!(path = %writer.path().display(), error = %e, "dropping tsync pair"),
        }
    }

    /// Write the last observed pair and close the file
    pub(crate) fn finish(&mut self) -> Result<(), TimeSyncError> {
        if let Some((time1, time2)) = self.last_seen {
            self.write(time1, time2);
        }
        match self.writer.take() {
            Some(mut writer) => writer.close(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibrated(window: usize, offset_us: i64) -> Calibration {
        let mut calibration = Calibration::new(window);
        for _ in 0..2 * window {
            calibration.push(offset_us);
        }
        assert!(calibration.done);
        calibration
    }

    #[test]
    fn test_outlier_stays_out_of_window() {
        let mut calibration = calibrated(20, 500);
        assert!(!calibration.admit(100_500, 1000));
        assert_eq!(calibration.offsets.mean(), 500.0);
        assert_eq!(calibration.offsets.std_dev(), 0.0);

        // small jitter inside the tolerance band is admitted
        assert!(calibration.admit(900, 1000));
        assert_eq!(calibration.offsets.len(), 20);
    }

    #[test]
    fn test_outlier_run_is_admitted_as_drift() {
        let mut calibration = calibrated(10, 0);
        assert!(!calibration.admit(5000, 1000));
        assert!(!calibration.admit(5000, 1000));
        assert!(calibration.admit(5000, 1000));
        assert!(calibration.admit(5000, 1000));
        assert!(calibration.offsets.mean() > 0.0);
    }

    #[test]
    fn test_outlier_run_resets_on_side_change() {
        let mut calibration = calibrated(10, 0);
        assert!(!calibration.admit(5000, 1000));
        assert!(!calibration.admit(5000, 1000));
        assert!(!calibration.admit(-5000, 1000));
        assert!(!calibration.admit(-5000, 1000));
        assert_eq!(calibration.offsets.mean(), 0.0);
    }
}
