//! MasterClock - the single time reference of a run

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::SyncError;

/// Monotonic run clock
///
/// Time zero is latched by [`start`](Self::start), which succeeds exactly once
/// per instance. A new run gets a new clock; there is no reset.
#[derive(Debug, Default)]
pub struct MasterClock {
    start: OnceLock<Instant>,
}

impl MasterClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch time zero.
    ///
    /// # Errors
    /// `ClockAlreadyStarted` on every call after the first.
    pub fn start(&self) -> Result<(), SyncError> {
        self.start
            .set(Instant::now())
            .map_err(|_| SyncError::ClockAlreadyStarted)?;
        debug!("master clock started");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.start.get().is_some()
    }

    /// Instant of time zero
    pub fn start_instant(&self) -> Option<Instant> {
        self.start.get().copied()
    }

    /// Elapsed time since start (zero before start)
    pub fn time_since_start(&self) -> Duration {
        self.start
            .get()
            .map(Instant::elapsed)
            .unwrap_or_default()
    }

    pub fn now_ns(&self) -> i64 {
        duration_to_i64(self.time_since_start().as_nanos())
    }

    pub fn now_us(&self) -> i64 {
        duration_to_i64(self.time_since_start().as_micros())
    }

    pub fn now_ms(&self) -> i64 {
        duration_to_i64(self.time_since_start().as_millis())
    }

    /// Master time (µs) of an instant observed by a device thread.
    ///
    /// Instants before time zero map to 0.
    pub fn us_at(&self, instant: Instant) -> i64 {
        self.start
            .get()
            .map(|start| duration_to_i64(instant.saturating_duration_since(*start).as_micros()))
            .unwrap_or(0)
    }
}

fn duration_to_i64(value: u128) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
