//! Per-module view of the engine

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use contracts::{EngineEvent, ModuleState, SyncDetailsCallback, SynchronizerConfig, TimeSyncStrategies};
use parking_lot::RwLock;
use sync_engine::tsync::TSYNC_EXTENSION;
use sync_engine::{FreqCounterSynchronizer, MasterClock, SecondaryClockSynchronizer};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::storage::StorageGroup;
use crate::ModuleError;

/// A module error queued for the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFailure {
    pub module: String,
    pub message: String,
}

/// Resources a module may use during one run
#[derive(Clone)]
pub(crate) struct RunBinding {
    pub clock: Arc<MasterClock>,
    pub running: Arc<AtomicBool>,
    pub errors: mpsc::UnboundedSender<ModuleFailure>,
    pub storage: Option<StorageGroup>,
}

/// Broadcast an event and record its metrics
pub(crate) fn emit(events: &broadcast::Sender<EngineEvent>, event: EngineEvent) {
    observability::record_engine_event(&event);
    // no receiver is fine
    let _ = events.send(event);
}

/// Handle through which a module talks to the engine
///
/// Lives as long as the module is registered. Run resources (clock, running
/// flag, storage) are bound before `prepare()` and revoked after the
/// module's execution context was joined.
pub struct ModuleContext {
    name: String,
    rng_seed: u64,
    state: watch::Sender<ModuleState>,
    events: broadcast::Sender<EngineEvent>,
    run: RwLock<Option<RunBinding>>,
    idle_clock: Arc<MasterClock>,
}

impl ModuleContext {
    pub(crate) fn new(name: impl Into<String>, seed: u64, events: broadcast::Sender<EngineEvent>) -> Self {
        let name = name.into();
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        let (state, _) = watch::channel(ModuleState::Initializing);
        Self {
            rng_seed: seed ^ hasher.finish(),
            name,
            state,
            events,
            run: RwLock::new(None),
            idle_clock: Arc::new(MasterClock::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deterministic per-module seed derived from the engine seed
    pub fn rng_seed(&self) -> u64 {
        self.rng_seed
    }

    pub fn state(&self) -> ModuleState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ModuleState> {
        self.state.subscribe()
    }

    /// Move to `next` if the lifecycle allows it.
    ///
    /// Returns false (and logs) for an invalid transition. Setting the
    /// current state again is accepted silently.
    pub fn set_state(&self, next: ModuleState) -> bool {
        let mut from = next;
        let mut changed = false;
        let accepted = {
            let mut accepted = true;
            self.state.send_if_modified(|current| {
                from = *current;
                if *current == next {
                    return false;
                }
                if !current.can_transition_to(next) {
                    accepted = false;
                    return false;
                }
                *current = next;
                changed = true;
                true
            });
            accepted
        };

        if !accepted {
            warn!(module = %self.name, %from, to = %next, "invalid state transition ignored");
        } else if changed {
            debug!(module = %self.name, %from, to = %next, "module state changed");
            emit(
                &self.events,
                EngineEvent::ModuleStateChanged {
                    module: self.name.clone(),
                    state: next,
                },
            );
        }
        accepted
    }

    /// Report a failure: the module enters `Error` and the engine aborts
    /// the run. Never blocks.
    pub fn raise_error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(module = %self.name, %message, "module error");
        self.set_state(ModuleState::Error);
        emit(
            &self.events,
            EngineEvent::ModuleError {
                module: self.name.clone(),
                message: message.clone(),
            },
        );
        if let Some(run) = self.run.read().as_ref() {
            let _ = run.errors.send(ModuleFailure {
                module: self.name.clone(),
                message,
            });
        }
    }

    /// Master clock of the current run; an unstarted clock outside a run
    pub fn clock(&self) -> Arc<MasterClock> {
        self.run
            .read()
            .as_ref()
            .map(|run| Arc::clone(&run.clock))
            .unwrap_or_else(|| Arc::clone(&self.idle_clock))
    }

    /// Whether the module should keep acquiring
    pub fn is_running(&self) -> bool {
        self.run
            .read()
            .as_ref()
            .is_some_and(|run| run.running.load(Ordering::Acquire))
    }

    /// Identifier of the current collection; None for ephemeral runs
    pub fn collection_id(&self) -> Option<Uuid> {
        self.run
            .read()
            .as_ref()
            .and_then(|run| run.storage.as_ref())
            .map(|storage| storage.collection().id)
    }

    /// Directory for this module's dataset `purpose`.
    ///
    /// `Ok(None)` when the run stores nothing.
    pub fn dataset_dir(&self, purpose: &str) -> Result<Option<PathBuf>, ModuleError> {
        let storage = self.run.read().as_ref().and_then(|run| run.storage.clone());
        match storage {
            Some(storage) => Ok(Some(storage.dataset_dir(&self.name, purpose)?)),
            None => Ok(None),
        }
    }

    /// Synchronizer for a device sampling at `frequency_hz`, configured and
    /// wired to this run's collection and event bus.
    pub fn new_freq_synchronizer(
        &self,
        frequency_hz: f64,
        purpose: &str,
        config: &SynchronizerConfig,
    ) -> Result<FreqCounterSynchronizer, ModuleError> {
        let mut sync = FreqCounterSynchronizer::new(
            self.clock(),
            &self.name,
            frequency_hz,
            self.sync_id(purpose),
        );
        sync.apply_config(config);
        if let Some((path, collection_id)) = self.tsync_target(purpose, config)? {
            sync.set_tsync_file(path, collection_id);
        }
        sync.set_details_callback(self.sync_callback());
        Ok(sync)
    }

    /// Synchronizer for a device with its own clock
    pub fn new_secondary_synchronizer(
        &self,
        purpose: &str,
        config: &SynchronizerConfig,
    ) -> Result<SecondaryClockSynchronizer, ModuleError> {
        let mut sync = SecondaryClockSynchronizer::new(&self.name, self.sync_id(purpose));
        sync.apply_config(config);
        if let Some((path, collection_id)) = self.tsync_target(purpose, config)? {
            sync.set_tsync_file(path, collection_id);
        }
        sync.set_details_callback(self.sync_callback());
        Ok(sync)
    }

    fn sync_id(&self, purpose: &str) -> String {
        format!("{}/{}", self.name, purpose)
    }

    fn tsync_target(
        &self,
        purpose: &str,
        config: &SynchronizerConfig,
    ) -> Result<Option<(PathBuf, Uuid)>, ModuleError> {
        if !config.strategies.contains(TimeSyncStrategies::WRITE_TSYNCFILE) {
            return Ok(None);
        }
        let (Some(dir), Some(collection_id)) = (self.dataset_dir(purpose)?, self.collection_id())
        else {
            debug!(module = %self.name, purpose, "no storage in this run, tsync file skipped");
            return Ok(None);
        };
        Ok(Some((dir.join(format!("{purpose}.{TSYNC_EXTENSION}")), collection_id)))
    }

    fn sync_callback(&self) -> SyncDetailsCallback {
        let events = self.events.clone();
        let module = self.name.clone();
        Arc::new(move |details| {
            emit(
                &events,
                EngineEvent::SyncReport {
                    module: module.clone(),
                    details,
                },
            );
        })
    }

    pub(crate) fn bind_run(&self, binding: RunBinding) {
        *self.run.write() = Some(binding);
    }

    pub(crate) fn unbind_run(&self) {
        self.run.write().take();
    }

    /// Ask this module to wind down
    pub(crate) fn clear_running(&self) {
        if let Some(run) = self.run.read().as_ref() {
            run.running.store(false, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("bound", &self.run.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DirectoryStorage, StorageBackend};
    use contracts::SyncState;

    fn context() -> (ModuleContext, broadcast::Receiver<EngineEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (ModuleContext::new("amp", 7, tx), rx)
    }

    fn bind(ctx: &ModuleContext, storage: Option<StorageGroup>) -> mpsc::UnboundedReceiver<ModuleFailure> {
        let (errors, rx) = mpsc::unbounded_channel();
        ctx.bind_run(RunBinding {
            clock: Arc::new(MasterClock::new()),
            running: Arc::new(AtomicBool::new(true)),
            errors,
            storage,
        });
        rx
    }

    #[test]
    fn test_state_transitions_are_validated() {
        let (ctx, mut events) = context();
        assert!(ctx.set_state(ModuleState::Idle));
        assert!(!ctx.set_state(ModuleState::Running));
        assert_eq!(ctx.state(), ModuleState::Idle);
        assert!(ctx.set_state(ModuleState::Idle));

        match events.try_recv().unwrap() {
            EngineEvent::ModuleStateChanged { module, state } => {
                assert_eq!(module, "amp");
                assert_eq!(state, ModuleState::Idle);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_raise_error_queues_failure() {
        let (ctx, _events) = context();
        ctx.set_state(ModuleState::Idle);
        let mut failures = bind(&ctx, None);

        ctx.raise_error("device unplugged");
        assert_eq!(ctx.state(), ModuleState::Error);
        assert_eq!(
            failures.try_recv().unwrap(),
            ModuleFailure {
                module: "amp".into(),
                message: "device unplugged".into()
            }
        );
    }

    #[test]
    fn test_run_binding() {
        let (ctx, _events) = context();
        assert!(!ctx.is_running());
        assert!(!ctx.clock().is_started());

        let _failures = bind(&ctx, None);
        assert!(ctx.is_running());
        assert_eq!(ctx.dataset_dir("samples").unwrap(), None);
        assert_eq!(ctx.collection_id(), None);

        ctx.clear_running();
        assert!(!ctx.is_running());
        ctx.unbind_run();
        assert!(!ctx.is_running());
    }

    #[test]
    fn test_seed_differs_per_module() {
        let (tx, _rx) = broadcast::channel(4);
        let a = ModuleContext::new("a", 42, tx.clone());
        let b = ModuleContext::new("b", 42, tx.clone());
        let a2 = ModuleContext::new("a", 42, tx);
        assert_ne!(a.rng_seed(), b.rng_seed());
        assert_eq!(a.rng_seed(), a2.rng_seed());
    }

    #[test]
    fn test_synchronizer_factory_wires_tsync_file() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = Arc::new(DirectoryStorage::new(tmp.path()));
        let collection = backend.create_collection("run").unwrap();
        let group = StorageGroup::new(backend, collection.clone());

        let (ctx, mut events) = context();
        let _failures = bind(&ctx, Some(group.clone()));

        let config = SynchronizerConfig {
            strategies: TimeSyncStrategies::default() | TimeSyncStrategies::WRITE_TSYNCFILE,
            ..SynchronizerConfig::default()
        };
        let mut sync = ctx.new_freq_synchronizer(1000.0, "samples", &config).unwrap();
        assert_eq!(sync.id(), "amp/samples");
        sync.start().unwrap();
        sync.stop();

        let expected = collection.root.join("amp").join("samples").join("samples.tsync");
        assert!(expected.is_file());
        assert_eq!(group.datasets().len(), 1);

        let report = std::iter::from_fn(|| events.try_recv().ok()).find_map(|event| match event {
            EngineEvent::SyncReport { module, details } => Some((module, details)),
            _ => None,
        });
        let (module, details) = report.unwrap();
        assert_eq!(module, "amp");
        assert_eq!(details.state, SyncState::Calibrating);
    }
}
