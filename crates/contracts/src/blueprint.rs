//! RunBlueprint - Config Loader output
//!
//! Describes a complete acquisition setup: modules, the connections between
//! their ports, the test subject and engine tuning.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{EngineConfig, ModuleDriver, SynchronizerConfig, TestSubject};

/// Configuration version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigVersion {
    #[default]
    V1,
}

/// Module-specific parameters, interpreted by the module factory
pub type ModuleParams = BTreeMap<String, serde_json::Value>;

/// Complete run configuration blueprint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunBlueprint {
    /// Configuration version
    #[serde(default)]
    pub version: ConfigVersion,

    /// Subject recorded in this session
    #[serde(default)]
    pub test_subject: TestSubject,

    /// Engine tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Module instances
    pub modules: Vec<ModuleBlueprint>,

    /// Stream connections between module ports
    #[serde(default)]
    pub connections: Vec<ConnectionBlueprint>,
}

/// One module instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleBlueprint {
    /// Unique instance name
    pub name: String,

    /// Module kind, resolved by the module registry (e.g. "sample_counter")
    pub kind: String,

    /// Driver override; None keeps the module's own choice
    #[serde(default)]
    pub driver: Option<ModuleDriver>,

    /// Explicit event-loop sharing group
    #[serde(default)]
    pub events_group: Option<String>,

    /// Clock synchronizer tuning for modules that own one
    #[serde(default)]
    pub sync: SynchronizerConfig,

    /// Kind-specific parameters
    #[serde(default)]
    pub params: ModuleParams,
}

/// A stream connection `source.output -> target.input`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionBlueprint {
    /// Producing module name
    pub source: String,
    /// Output port id on the producer
    pub output: String,
    /// Consuming module name
    pub target: String,
    /// Input port id on the consumer
    pub input: String,
}

impl RunBlueprint {
    /// Find a module blueprint by name
    pub fn module(&self, name: &str) -> Option<&ModuleBlueprint> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Connections feeding the given module
    pub fn inputs_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ConnectionBlueprint> {
        self.connections.iter().filter(move |c| c.target == name)
    }
}

impl ModuleBlueprint {
    /// Read a numeric parameter, falling back to `default`
    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        self.params
            .get(key)
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(default)
    }

    /// Read an unsigned integer parameter, falling back to `default`
    pub fn param_u64(&self, key: &str, default: u64) -> u64 {
        self.params
            .get(key)
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(default)
    }

    /// Read a string parameter
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(serde_json::Value::as_str)
    }
}
