//! # Engine
//!
//! Run orchestration for acquisition modules.
//!
//! The [`Engine`] owns a set of [`Module`]s wired through typed streams. A
//! run prepares every module, gives each one an execution context (its own
//! thread or a slot on an event loop), holds all contexts at a shared
//! [`OptionalWaitCondition`] until every module was started, and tears
//! everything down in a deterministic stop order with bounded joins.
//!
//! ## Collaborators
//! - [`StorageBackend`]: where collections and datasets live
//! - [`ThreadTuning`]: affinity, niceness and realtime scheduling
//! - [`StopHandle`]: ends a run from signal handlers or timers

mod barrier;
mod context;
mod engine;
mod error;
mod module;
mod monitor;
mod ordering;
mod platform;
mod run_state;
mod runner;
mod storage;

pub use barrier::OptionalWaitCondition;
pub use context::{ModuleContext, ModuleFailure};
pub use sync_engine::tsync::TSYNC_EXTENSION;
pub use engine::{Engine, EngineContext, RunReport};
pub use error::{EngineError, ModuleError};
pub use module::{Module, DEFAULT_EVENT_INTERVAL};
pub use ordering::{execution_order, stop_order};
pub use platform::{
    CoreAllocator, OsThreadTuning, RecordingTuning, ThreadTuning, TuningCall, TuningPlan,
};
pub use run_state::StopHandle;
pub use storage::{Collection, DirectoryStorage, StorageBackend, StorageGroup, MANIFEST_FILE};
