//! Signals the engine exposes to observers (UI, launcher, tests).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ModuleState, SyncDetails};

/// Kind of resource a warning refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceWarningKind {
    DiskSpace,
    Memory,
    StreamBuffers,
}

/// Backlog severity of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionHeat {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl fmt::Display for ConnectionHeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionHeat::None => "none",
            ConnectionHeat::Low => "low",
            ConnectionHeat::Medium => "medium",
            ConnectionHeat::High => "high",
        };
        f.write_str(name)
    }
}

/// Event broadcast by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A resource crossed (or recovered from) a warning threshold
    ResourceWarning {
        kind: ResourceWarningKind,
        resolved: bool,
        message: String,
    },
    /// Backlog severity of an input port changed
    ConnectionHeatChanged {
        module: String,
        port: String,
        heat: ConnectionHeat,
    },
    /// A module changed its lifecycle state
    ModuleStateChanged { module: String, state: ModuleState },
    /// A module reported a failure
    ModuleError { module: String, message: String },
    /// Status report of a module's synchronizer
    SyncReport { module: String, details: SyncDetails },
    /// All modules were started
    RunStarted { collection: String },
    /// Run finished, successfully or not
    RunFinished {
        success: bool,
        failure_reason: Option<String>,
    },
}
