//! Synchronizer configuration contracts that can be shared across crates.

use serde::{Deserialize, Serialize};

use crate::{TimeSyncFileMode, TimeSyncStrategies};

/// Default number of offset samples in the calibration window
pub const DEFAULT_CALIBRATION_WINDOW: usize = 500;

/// Default drift tolerance before a correction is applied (µs)
pub const DEFAULT_TOLERANCE_US: i64 = 1000;

/// Synchronizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchronizerConfig {
    /// Number of offset samples per calibration window
    #[serde(default = "default_calibration_window")]
    pub calibration_window: usize,

    /// Allowed deviation from the calibrated offset (µs)
    #[serde(default = "default_tolerance_us")]
    pub tolerance_us: i64,

    /// Enabled correction strategies
    #[serde(default)]
    pub strategies: TimeSyncStrategies,

    /// TimeSyncFile write mode
    #[serde(default)]
    pub tsync_mode: TimeSyncFileMode,

    /// Minimum interval between in-tolerance status reports (seconds)
    #[serde(default = "default_report_interval_s")]
    pub report_interval_s: f64,
}

fn default_calibration_window() -> usize {
    DEFAULT_CALIBRATION_WINDOW
}

fn default_tolerance_us() -> i64 {
    DEFAULT_TOLERANCE_US
}

fn default_report_interval_s() -> f64 {
    30.0
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            calibration_window: DEFAULT_CALIBRATION_WINDOW,
            tolerance_us: DEFAULT_TOLERANCE_US,
            strategies: TimeSyncStrategies::default(),
            tsync_mode: TimeSyncFileMode::default(),
            report_interval_s: default_report_interval_s(),
        }
    }
}
