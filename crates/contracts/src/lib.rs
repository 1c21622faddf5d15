//! # Contracts
//!
//! Frozen interface contracts shared by every crate of the workspace.
//! Business crates depend on this crate, never the reverse.
//!
//! ## Time Model
//! - All run-time timestamps are relative to the run's master clock
//! - Synchronizers work in microseconds, the master clock counts nanoseconds

mod blueprint;
mod engine_config;
mod error;
mod events;
mod manifest;
mod module;
mod sync;
mod sync_engine_config;

pub use blueprint::*;
pub use engine_config::*;
pub use error::*;
pub use events::*;
pub use manifest::*;
pub use module::*;
pub use sync::*;
pub use sync_engine_config::*;
