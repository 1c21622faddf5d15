//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for recorded collections (None = ephemeral runs only)
    #[serde(default)]
    pub export_dir: Option<PathBuf>,

    /// Name of the collection created for each run
    #[serde(default = "default_collection_name")]
    pub collection_name: String,

    /// Shutdown timing
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Resource monitor thresholds and intervals
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Thread placement and priorities
    #[serde(default)]
    pub threading: ThreadingConfig,

    /// Explicit stop-order constraints
    #[serde(default)]
    pub stop_after: Vec<StopAfterRule>,
}

fn default_collection_name() -> String {
    "recording".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            export_dir: None,
            collection_name: default_collection_name(),
            shutdown: ShutdownConfig::default(),
            monitor: MonitorConfig::default(),
            threading: ThreadingConfig::default(),
            stop_after: Vec::new(),
        }
    }
}

/// Run-stop timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Maximum time to wait for a module's inputs to drain before stopping it
    pub drain_window_ms: u64,
    /// First join timeout
    pub join_timeout_ms: u64,
    /// Second join timeout, after end-of-stream was force-fed
    pub join_retry_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_window_ms: 1600,
            join_timeout_ms: 20_000,
            join_retry_timeout_ms: 15_000,
        }
    }
}

impl ShutdownConfig {
    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn join_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.join_retry_timeout_ms)
    }
}

/// Resource monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Disk check interval (seconds)
    pub disk_interval_s: u64,
    /// Warn when free space at the export location drops below this (bytes)
    pub disk_warn_bytes: u64,
    /// Memory check interval (seconds)
    pub memory_interval_s: u64,
    /// Warn when available memory drops below this share (percent)
    pub memory_warn_percent: f64,
    /// Emergency-stop floor for available memory (percent)
    pub memory_emergency_percent: f64,
    /// Connection heat check interval (seconds)
    pub heat_interval_s: u64,
    /// Pending-item thresholds for low / medium / high heat
    pub heat_thresholds: [usize; 3],
    /// Items a backlog must fall below a threshold before heat is lowered
    pub heat_hysteresis: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            disk_interval_s: 60,
            disk_warn_bytes: 8 * 1024 * 1024 * 1024,
            memory_interval_s: 10,
            memory_warn_percent: 10.0,
            memory_emergency_percent: 4.0,
            heat_interval_s: 10,
            heat_thresholds: [100, 200, 300],
            heat_hysteresis: 20,
        }
    }
}

/// Thread placement configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadingConfig {
    /// Maximum number of shared event-driven modules on one event loop
    pub max_events_modules_per_thread: usize,
    /// Niceness applied to module threads (None = leave unchanged)
    pub module_niceness: Option<i32>,
    /// Soft-realtime priority for modules requesting it
    pub realtime_priority: i32,
    /// Cores available for affinity requests (empty = all cores)
    pub affinity_cores: Vec<usize>,
    /// Niceness applied to the engine thread while a run is active
    pub engine_niceness: Option<i32>,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            max_events_modules_per_thread: 4,
            module_niceness: None,
            realtime_priority: 20,
            affinity_cores: Vec::new(),
            engine_niceness: None,
        }
    }
}

/// A module that must be stopped right after a given upstream module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopAfterRule {
    /// Module whose stop is deferred
    pub module: String,
    /// Module it must be stopped after
    pub after: String,
}
