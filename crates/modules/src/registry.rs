//! Module registry
//!
//! Maps blueprint kinds to module builders and installs a whole
//! [`RunBlueprint`] into an [`Engine`].

use std::collections::BTreeMap;
use std::sync::Arc;

use contracts::{ModuleBlueprint, ModuleDriver, RunBlueprint};
use engine::{Engine, Module};
use tracing::{info, instrument, warn};

use crate::clock_frames::{self, ClockFrames};
use crate::error::{RegistryError, Result};
use crate::items::{ClockFrame, ItemKind, SampleBlock};
use crate::latency_probe::{self, LatencyProbe};
use crate::recorder::{self, Recorder};
use crate::sample_counter::{self, SampleCounter};

/// Builds one module instance from its blueprint entry
pub type ModuleBuilder = fn(&ModuleBlueprint) -> Result<Arc<dyn Module>>;

/// Driver of a module: the blueprint override when present, `default`
/// otherwise. Overrides outside `supported` are rejected.
pub fn resolve_driver(
    bp: &ModuleBlueprint,
    default: ModuleDriver,
    supported: &[ModuleDriver],
) -> Result<ModuleDriver> {
    let driver = bp.driver.unwrap_or(default);
    if supported.contains(&driver) {
        Ok(driver)
    } else {
        Err(RegistryError::UnsupportedDriver {
            module: bp.name.clone(),
            kind: bp.kind.clone(),
            driver,
        })
    }
}

/// Item type consumed by a generic sink, from its `item` parameter
fn item_kind(bp: &ModuleBlueprint) -> Result<ItemKind> {
    let value = bp.param_str("item").unwrap_or("samples");
    ItemKind::parse(value).ok_or_else(|| {
        RegistryError::invalid_param(&bp.name, "item", format!("expected 'samples' or 'frames', got '{value}'"))
    })
}

fn build_sample_counter(bp: &ModuleBlueprint) -> Result<Arc<dyn Module>> {
    Ok(Arc::new(SampleCounter::from_blueprint(bp)?))
}

fn build_clock_frames(bp: &ModuleBlueprint) -> Result<Arc<dyn Module>> {
    Ok(Arc::new(ClockFrames::from_blueprint(bp)?))
}

fn build_recorder(bp: &ModuleBlueprint) -> Result<Arc<dyn Module>> {
    Ok(match item_kind(bp)? {
        ItemKind::Samples => Arc::new(Recorder::<SampleBlock>::from_blueprint(bp)?),
        ItemKind::Frames => Arc::new(Recorder::<ClockFrame>::from_blueprint(bp)?),
    })
}

fn build_latency_probe(bp: &ModuleBlueprint) -> Result<Arc<dyn Module>> {
    Ok(match item_kind(bp)? {
        ItemKind::Samples => Arc::new(LatencyProbe::<SampleBlock>::from_blueprint(bp)?),
        ItemKind::Frames => Arc::new(LatencyProbe::<ClockFrame>::from_blueprint(bp)?),
    })
}

/// Kind name to builder table
pub struct ModuleRegistry {
    builders: BTreeMap<String, ModuleBuilder>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ModuleRegistry {
    /// Registry without any kinds
    pub fn empty() -> Self {
        Self {
            builders: BTreeMap::new(),
        }
    }

    /// Registry with every built-in module kind
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(sample_counter::KIND, build_sample_counter);
        registry.register(clock_frames::KIND, build_clock_frames);
        registry.register(recorder::KIND, build_recorder);
        registry.register(latency_probe::KIND, build_latency_probe);
        registry
    }

    /// Register a builder; returns false if it replaced an existing kind
    pub fn register(&mut self, kind: impl Into<String>, builder: ModuleBuilder) -> bool {
        self.builders.insert(kind.into(), builder).is_none()
    }

    /// Registered kinds in sorted order
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.builders.contains_key(kind)
    }

    /// Build a single module
    pub fn build(&self, bp: &ModuleBlueprint) -> Result<Arc<dyn Module>> {
        let builder = self
            .builders
            .get(&bp.kind)
            .ok_or_else(|| RegistryError::UnknownKind {
                module: bp.name.clone(),
                kind: bp.kind.clone(),
            })?;
        builder(bp)
    }

    /// Add every module of `blueprint` to `engine` and wire its connections.
    ///
    /// # Atomicity
    /// If any module or connection fails, every module added by this call is
    /// removed again and the engine is left as it was.
    #[instrument(
        name = "module_registry_install",
        skip(self, engine, blueprint),
        fields(modules = blueprint.modules.len(), connections = blueprint.connections.len())
    )]
    pub fn install(&self, engine: &mut Engine, blueprint: &RunBlueprint) -> Result<Vec<String>> {
        let mut added: Vec<String> = Vec::new();

        match self.install_inner(engine, blueprint, &mut added) {
            Ok(()) => {
                info!(modules = added.len(), "blueprint installed");
                Ok(added)
            }
            Err(e) => {
                warn!(error = %e, added = added.len(), "install failed, rolling back modules");
                self.rollback(engine, &added);
                Err(e)
            }
        }
    }

    fn install_inner(
        &self,
        engine: &mut Engine,
        blueprint: &RunBlueprint,
        added: &mut Vec<String>,
    ) -> Result<()> {
        for bp in &blueprint.modules {
            let module = self.build(bp)?;
            engine.add_module(module)?;
            added.push(bp.name.clone());
        }
        for conn in &blueprint.connections {
            engine.connect(&conn.source, &conn.output, &conn.target, &conn.input)?;
        }
        Ok(())
    }

    fn rollback(&self, engine: &mut Engine, added: &[String]) {
        for name in added.iter().rev() {
            if let Err(e) = engine.remove_module(name) {
                warn!(module = %name, error = %e, "rollback could not remove module");
            }
        }
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("kinds", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}
