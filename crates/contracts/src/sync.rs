//! Time synchronization contracts
//!
//! Strategy flags, status reports and TimeSyncFile declarations shared by the
//! synchronizers and their consumers.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

bitflags! {
    /// What a synchronizer is allowed to do about a detected clock drift
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct TimeSyncStrategies: u32 {
        /// Move emitted timestamps forward in time
        const SHIFT_TIMESTAMPS_FWD = 1 << 0;
        /// Move emitted timestamps backward in time
        const SHIFT_TIMESTAMPS_BWD = 1 << 1;
        /// Module adjusts the device clock itself
        const ADJUST_CLOCK = 1 << 2;
        /// Write a TimeSyncFile for offline correction
        const WRITE_TSYNCFILE = 1 << 3;
    }
}

impl Default for TimeSyncStrategies {
    fn default() -> Self {
        Self::SHIFT_TIMESTAMPS_FWD | Self::SHIFT_TIMESTAMPS_BWD
    }
}

impl TimeSyncStrategies {
    /// Whether a correction in the given direction may be applied.
    ///
    /// A positive correction means the device runs ahead of the master
    /// clock and timestamps have to move backward.
    pub fn permits_correction(self, correction: i64) -> bool {
        match correction.signum() {
            1 => self.contains(Self::SHIFT_TIMESTAMPS_BWD),
            -1 => self.contains(Self::SHIFT_TIMESTAMPS_FWD),
            _ => true,
        }
    }
}

/// Coarse synchronizer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Collecting calibration samples
    #[default]
    Calibrating,
    /// Offset within tolerance
    InTolerance,
    /// Drift beyond tolerance, correction active
    Correcting,
}

/// Status report emitted by a synchronizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDetails {
    /// Synchronizer identifier (usually `<module>/<purpose>`)
    pub id: String,
    /// Current status
    pub state: SyncState,
    /// Offset measured during calibration (µs)
    pub expected_offset_us: i64,
    /// Current moving-average offset (µs)
    pub current_offset_us: i64,
    /// Correction currently tracked (µs)
    pub correction_us: i64,
}

/// Callback receiving synchronizer status reports
pub type SyncDetailsCallback = Arc<dyn Fn(SyncDetails) + Send + Sync>;

/// When pairs are written to a TimeSyncFile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSyncFileMode {
    /// One pair per processed sample/block
    Continuous,
    /// Only at calibration and whenever the correction changes
    #[default]
    Syncpoints,
}

/// Unit of a TimeSyncFile time column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSyncUnit {
    /// Dimensionless sample index
    Index,
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

/// On-disk integer type of a TimeSyncFile time column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSyncDataType {
    Int16,
    Int32,
    Int64,
    UInt16,
    UInt32,
    UInt64,
}

impl TimeSyncDataType {
    /// Encoded width in bytes
    pub fn width(self) -> usize {
        match self {
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 => 4,
            Self::Int64 | Self::UInt64 => 8,
        }
    }

    /// Whether `value` can be represented by this type
    pub fn accepts(self, value: i64) -> bool {
        match self {
            Self::Int16 => i16::try_from(value).is_ok(),
            Self::Int32 => i32::try_from(value).is_ok(),
            Self::Int64 => true,
            Self::UInt16 => u16::try_from(value).is_ok(),
            Self::UInt32 => u32::try_from(value).is_ok(),
            Self::UInt64 => value >= 0,
        }
    }
}
