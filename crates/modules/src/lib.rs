//! # Modules
//!
//! Built-in modules for the `daqflow` launcher and the integration tests.
//!
//! | kind             | driver            | ports                 |
//! |------------------|-------------------|-----------------------|
//! | `sample_counter` | thread            | out `samples`         |
//! | `clock_frames`   | events            | out `frames`          |
//! | `recorder`       | thread            | in `in`               |
//! | `latency_probe`  | events (shared)   | in `in`               |
//!
//! `recorder` and `latency_probe` consume sample blocks by default; set the
//! `item = "frames"` parameter to consume frames instead.
//!
//! ## Example
//!
//! ```ignore
//! let blueprint = config_loader::ConfigLoader::load_from_path(path)?;
//! let mut engine = Engine::new(EngineContext::default(), blueprint.engine.clone());
//! ModuleRegistry::with_builtins().install(&mut engine, &blueprint)?;
//! let report = engine.run().await?;
//! ```

pub mod clock_frames;
mod error;
mod items;
pub mod latency_probe;
pub mod recorder;
mod registry;
pub mod sample_counter;

pub use clock_frames::{ClockFrames, ClockFramesConfig};
pub use error::{RegistryError, Result};
pub use items::{ClockFrame, ItemKind, SampleBlock, Timestamped};
pub use latency_probe::{LatencyProbe, LatencyProbeConfig};
pub use recorder::{Recorder, RecorderConfig};
pub use registry::{resolve_driver, ModuleBuilder, ModuleRegistry};
pub use sample_counter::{SampleCounter, SampleCounterConfig};
