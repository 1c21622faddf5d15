//! Module identity, lifecycle states and capability flags.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Free-form metadata attached to streams and datasets.
pub type MetadataMap = BTreeMap<String, serde_json::Value>;

/// Lifecycle state of a module
///
/// ```text
/// Initializing -> Idle -> Preparing -> Ready -> Running -> Idle
///                              \-> Idle (run aborted before start)
/// any state -> Error (terminal for the current run)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// Module object exists but has not finished initialization
    #[default]
    Initializing,
    /// Module is idle and can be prepared for a run
    Idle,
    /// Module is preparing for a run
    Preparing,
    /// Module's execution context waits for the start signal
    Ready,
    /// Module is acquiring/processing data
    Running,
    /// Module failed; terminal until the next run
    Error,
}

impl ModuleState {
    /// Whether a transition from `self` to `next` is part of the lifecycle.
    pub fn can_transition_to(self, next: ModuleState) -> bool {
        use ModuleState::*;
        if next == Error {
            return true;
        }
        matches!(
            (self, next),
            (Initializing, Idle)
                | (Idle, Preparing)
                | (Preparing, Ready)
                | (Preparing, Idle)
                | (Ready, Running)
                | (Ready, Idle)
                | (Running, Idle)
                | (Error, Idle)
                | (Idle, Idle)
        )
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Initializing => "initializing",
            ModuleState::Idle => "idle",
            ModuleState::Preparing => "preparing",
            ModuleState::Ready => "ready",
            ModuleState::Running => "running",
            ModuleState::Error => "error",
        };
        f.write_str(name)
    }
}

/// How a module's code is driven during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleDriver {
    /// Module has no execution context of its own
    #[default]
    None,
    /// Module runs on its own OS thread
    ThreadDedicated,
    /// Module gets its own single-threaded event loop
    EventsDedicated,
    /// Module shares an event loop with other modules
    EventsShared,
}

impl ModuleDriver {
    /// Whether the module is driven by an event loop
    pub fn is_event_driven(self) -> bool {
        matches!(self, Self::EventsDedicated | Self::EventsShared)
    }
}

bitflags! {
    /// Optional capabilities a module requests from the engine
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ModuleFeatures: u32 {
        /// Thread should run with soft-realtime scheduling
        const REALTIME = 1 << 0;
        /// Thread should be pinned to a dedicated CPU core
        const REQUEST_CPU_AFFINITY = 1 << 1;
        /// Module emits its own storage datasets
        const WRITES_DATA = 1 << 2;
    }
}

/// Test subject of a recording session, handed to every module on prepare
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSubject {
    /// Subject identifier
    pub id: String,
    /// Experimental group
    #[serde(default)]
    pub group: String,
    /// Free-form comment
    #[serde(default)]
    pub comment: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        assert!(ModuleState::Initializing.can_transition_to(ModuleState::Idle));
        assert!(ModuleState::Preparing.can_transition_to(ModuleState::Ready));
        assert!(ModuleState::Running.can_transition_to(ModuleState::Idle));
        assert!(ModuleState::Ready.can_transition_to(ModuleState::Error));
        assert!(!ModuleState::Idle.can_transition_to(ModuleState::Running));
        assert!(!ModuleState::Error.can_transition_to(ModuleState::Running));
    }

    #[test]
    fn test_driver_kind() {
        assert!(ModuleDriver::EventsShared.is_event_driven());
        assert!(!ModuleDriver::ThreadDedicated.is_event_driven());
    }
}
