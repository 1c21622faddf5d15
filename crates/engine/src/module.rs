//! Module contract

use std::time::Duration;

use contracts::{ModuleDriver, ModuleFeatures, TestSubject};
use stream::ModulePorts;

use crate::{ModuleContext, ModuleError, OptionalWaitCondition};

/// Default polling interval of event-driven modules
pub const DEFAULT_EVENT_INTERVAL: Duration = Duration::from_millis(10);

/// A unit of acquisition or processing work driven by the engine.
///
/// All hooks take `&self`; implementations keep their run state behind
/// interior mutability since the engine shares the module between its own
/// thread and the module's execution context.
///
/// Call order within one run:
///
/// ```text
/// prepare -> (context: Ready -> wait) -> start -> barrier release
///         -> run_thread / process_events ... -> stop
/// ```
pub trait Module: Send + Sync + 'static {
    /// Unique instance name
    fn name(&self) -> &str;

    /// Module kind identifier
    fn id(&self) -> &str;

    fn driver(&self) -> ModuleDriver;

    fn features(&self) -> ModuleFeatures {
        ModuleFeatures::empty()
    }

    fn ports(&self) -> &ModulePorts;

    /// Sharing group for `EventsShared` modules; defaults to the module id
    fn events_group(&self) -> Option<&str> {
        None
    }

    /// One-time setup when the module is added to the engine
    fn initialize(&self) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Acquire devices and create per-run resources. Called on the engine
    /// thread in execution order; storage is already assigned.
    fn prepare(&self, ctx: &ModuleContext, test_subject: &TestSubject) -> Result<(), ModuleError>;

    /// Called for every module once all contexts are Ready, before the
    /// barrier is released.
    fn start(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Body of a `ThreadDedicated` module.
    ///
    /// The module must call `start_wait.wait()` before touching data and
    /// should return once `ctx.is_running()` turns false or its inputs end.
    fn run_thread(
        &self,
        ctx: &ModuleContext,
        start_wait: &OptionalWaitCondition,
    ) -> Result<(), ModuleError> {
        start_wait.wait();
        let _ = ctx;
        Ok(())
    }

    /// One non-blocking processing step of an event-driven module
    fn process_events(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }

    fn event_interval(&self) -> Duration {
        DEFAULT_EVENT_INTERVAL
    }

    /// Release devices and flush data. Called in stop order.
    fn stop(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }
}
