//! Engine and module errors

use contracts::ContractError;
use sync_engine::SyncError;
use thiserror::Error;

/// Failure reported by a module implementation
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Generic failure with a human readable reason
    #[error("{0}")]
    Failed(String),

    /// The device behind the module misbehaved
    #[error("device error: {0}")]
    Device(String),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ModuleError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::Device(message.into())
    }
}

/// Engine level error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration, graph or storage problem
    #[error(transparent)]
    Contract(#[from] ContractError),

    /// The master clock refused to start
    #[error("master clock error: {0}")]
    Clock(#[from] SyncError),

    /// A module failed outside of a run (initialization)
    #[error("module '{module}' failed: {message}")]
    ModuleFailed { module: String, message: String },

    /// Module threads did not terminate within every join timeout
    #[error("modules {modules:?} did not stop in time, the process may deadlock")]
    Stall { modules: Vec<String> },

    /// An execution context could not be created
    #[error("failed to spawn thread '{thread}': {source}")]
    Spawn {
        thread: String,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub fn module_failed(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ModuleFailed {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Whether the error was detected before any module thread started
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::Contract(e) if e.is_configuration_error())
    }
}
