//! Layered error definitions
//!
//! Categorized by source: config / module / stream / storage

use thiserror::Error;

/// Unified error type
#[derive(Debug, Error)]
pub enum ContractError {
    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    /// Run requested without any module
    #[error("no modules registered, nothing to run")]
    NoModules,

    /// Module name already in use
    #[error("duplicate module name '{name}'")]
    DuplicateModule { name: String },

    /// Export directory cannot be used
    #[error("invalid export directory '{path}': {message}")]
    InvalidExportDir { path: String, message: String },

    // ===== Module / Graph Errors =====
    /// Module lookup failed
    #[error("module not found: {name}")]
    ModuleNotFound { name: String },

    /// Port lookup failed
    #[error("module '{module}' has no port '{port}'")]
    PortNotFound { module: String, port: String },

    /// Attempted to connect ports carrying different data types
    #[error("cannot connect stream of type '{stream_type}' to input port '{port}' expecting '{port_type}'")]
    PortTypeMismatch {
        port: String,
        stream_type: String,
        port_type: String,
    },

    /// Subscriptions can only be created while a stream is inactive
    #[error("stream '{stream}' is active, new subscriptions are not accepted")]
    StreamActive { stream: String },

    /// The engine refused an operation while a run is in progress
    #[error("operation not allowed while a run is active")]
    RunActive,

    // ===== Storage Errors =====
    /// Storage collaborator failure
    #[error("storage error: {message}")]
    Storage { message: String },

    // ===== General Errors =====
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl ContractError {
    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create invalid export directory error
    pub fn invalid_export_dir(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidExportDir {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create port lookup error
    pub fn port_not_found(module: impl Into<String>, port: impl Into<String>) -> Self {
        Self::PortNotFound {
            module: module.into(),
            port: port.into(),
        }
    }

    /// Create storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Whether this error belongs to the configuration class, i.e. it is
    /// detected before any module thread exists.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigParse { .. }
                | Self::ConfigValidation { .. }
                | Self::NoModules
                | Self::DuplicateModule { .. }
                | Self::InvalidExportDir { .. }
        )
    }
}
