//! Synchronizer and TimeSyncFile errors

use contracts::TimeSyncDataType;
use thiserror::Error;

/// TimeSyncFile read/write failure
#[derive(Debug, Error)]
pub enum TimeSyncError {
    #[error("tsync io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a TimeSyncFile (bad magic)")]
    BadMagic,

    #[error("unsupported TimeSyncFile version {0}")]
    UnsupportedVersion(u16),

    #[error("tsync header encoding error: {0}")]
    Header(#[from] bincode::Error),

    #[error("checksum mismatch in block {block}")]
    ChecksumMismatch { block: u64 },

    #[error("TimeSyncFile is truncated")]
    Truncated,

    #[error("unknown block tag 0x{0:02x}")]
    UnknownBlockTag(u8),

    #[error("end block declares {declared} pairs, file holds {found}")]
    CountMismatch { declared: u64, found: u64 },

    #[error("trailing data after end block")]
    TrailingData,

    #[error("value {value} does not fit column {column} ({dtype:?})")]
    ValueOutOfRange {
        column: usize,
        value: i64,
        dtype: TimeSyncDataType,
    },

    #[error("TimeSyncFile writer already closed")]
    Closed,
}

/// Clock and synchronizer errors
#[derive(Debug, Error)]
pub enum SyncError {
    /// The master clock of a run can only be started once
    #[error("master clock already started")]
    ClockAlreadyStarted,

    /// Synchronizers serve exactly one run
    #[error("synchronizer '{0}' was already used for a run")]
    AlreadyUsed(String),

    #[error(transparent)]
    TimeSync(#[from] TimeSyncError),
}
