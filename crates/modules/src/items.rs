//! Stream item types produced by the built-in modules

use serde::Serialize;

/// Items carrying a master clock timestamp
pub trait Timestamped {
    /// Master time of the item in µs since run start
    fn master_us(&self) -> i64;
}

/// A block of consecutive samples from a counter-driven device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleBlock {
    /// Sample indices, already shifted by the synchronizer
    pub indices: Vec<u64>,
    /// Master time at which the block was received
    pub master_us: i64,
    pub values: Vec<f64>,
}

impl Timestamped for SampleBlock {
    fn master_us(&self) -> i64 {
        self.master_us
    }
}

/// One frame of a device with its own clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockFrame {
    pub index: u64,
    /// Device timestamp in µs
    pub device_us: i64,
    /// Device timestamp mapped onto the master clock
    pub master_us: i64,
}

impl Timestamped for ClockFrame {
    fn master_us(&self) -> i64 {
        self.master_us
    }
}

/// Item type selector for generic consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Samples,
    Frames,
}

impl ItemKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "samples" => Some(Self::Samples),
            "frames" => Some(Self::Frames),
            _ => None,
        }
    }
}
