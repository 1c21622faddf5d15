//! Execution contexts of running modules
//!
//! `ThreadDedicated` modules get one OS thread each. Event-driven modules
//! run on OS threads that each host a single-threaded tokio runtime.

mod events;
mod thread;

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::error;

use crate::{Module, ModuleContext};

pub(crate) use events::{plan_event_runners, spawn_event_runner, EventSlot};
pub(crate) use thread::spawn_module_thread;

/// A module together with its context
#[derive(Clone)]
pub(crate) struct Member {
    pub module: Arc<dyn Module>,
    pub ctx: Arc<ModuleContext>,
}

/// A spawned execution context
pub(crate) struct RunnerHandle {
    pub label: String,
    pub modules: Vec<String>,
    handle: JoinHandle<()>,
}

impl RunnerHandle {
    pub fn new(label: String, modules: Vec<String>, handle: JoinHandle<()>) -> Self {
        Self {
            label,
            modules,
            handle,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Join a finished runner; panics are logged
    pub fn join(self) {
        if self.handle.join().is_err() {
            error!(runner = %self.label, modules = ?self.modules, "execution context panicked");
        }
    }
}

impl std::fmt::Debug for RunnerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerHandle")
            .field("label", &self.label)
            .field("modules", &self.modules)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Message of a caught panic payload
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
