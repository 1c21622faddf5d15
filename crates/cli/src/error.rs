//! Error types for CLI operations.

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    /// Blueprint file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Blueprint could not be loaded or validated
    #[error("Configuration invalid: {message}")]
    ConfigInvalid { message: String },

    /// The run finished unsuccessfully
    #[error("Run failed: {reason}")]
    RunFailed { reason: String },
}

impl CliError {
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::ConfigNotFound { path: path.into() }
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    pub fn run_failed(reason: impl Into<String>) -> Self {
        Self::RunFailed {
            reason: reason.into(),
        }
    }
}
