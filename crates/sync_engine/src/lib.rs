//! # Sync Engine
//!
//! Time alignment of device data with the run's master clock.
//!
//! - [`MasterClock`]: the single time reference of a run
//! - [`FreqCounterSynchronizer`]: devices delivering sample counters at a
//!   nominal frequency
//! - [`SecondaryClockSynchronizer`]: devices stamping samples with their own
//!   clock
//! - [`tsync`]: TimeSyncFile writer and reader for offline correction
//!
//! Both synchronizers calibrate the expected clock offset first (two full
//! windows, median + standard deviation), then track drift beyond the
//! configured tolerance with damped corrections.
//!
//! ## Example
//!
//! ```ignore
//! use sync_engine::{FreqCounterSynchronizer, MasterClock};
//!
//! let clock = Arc::new(MasterClock::new());
//! let mut sync = FreqCounterSynchronizer::new(clock, "daq", 1000.0, "daq/samples");
//! sync.apply_config(&blueprint.sync);
//! sync.start()?;
//!
//! // per received block
//! sync.process_block(latency_us, 0, 1, &mut indices);
//! ```

mod clock;
mod common;
mod error;
mod freq_counter;
mod offsets;
mod secondary_clock;
pub mod tsync;

pub use clock::MasterClock;
pub use error::{SyncError, TimeSyncError};
pub use freq_counter::FreqCounterSynchronizer;
pub use offsets::OffsetBuffer;
pub use secondary_clock::SecondaryClockSynchronizer;
pub use tsync::{TimeSyncFile, TimeSyncFileReader, TimeSyncFileWriter, TimeSyncHeader};
