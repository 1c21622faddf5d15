//! Module registry errors

use contracts::ModuleDriver;
use engine::EngineError;
use thiserror::Error;

/// Failure while turning a blueprint into engine modules
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No builder registered for the kind
    #[error("module '{module}': unknown kind '{kind}'")]
    UnknownKind { module: String, kind: String },

    /// The kind cannot be driven the requested way
    #[error("module '{module}': driver {driver:?} is not supported by kind '{kind}'")]
    UnsupportedDriver {
        module: String,
        kind: String,
        driver: ModuleDriver,
    },

    /// A parameter has an invalid value
    #[error("module '{module}': invalid parameter '{param}': {message}")]
    InvalidParam {
        module: String,
        param: String,
        message: String,
    },

    /// The engine rejected a module or connection
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl RegistryError {
    pub fn invalid_param(
        module: impl Into<String>,
        param: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidParam {
            module: module.into(),
            param: param.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_module() {
        let err = RegistryError::UnknownKind {
            module: "cam".into(),
            kind: "webcam".into(),
        };
        assert_eq!(err.to_string(), "module 'cam': unknown kind 'webcam'");

        let err = RegistryError::invalid_param("daq", "frequency_hz", "must be > 0");
        assert!(err.to_string().contains("frequency_hz"));
    }
}
