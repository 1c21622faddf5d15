//! Engine - owns the modules and orchestrates runs
//!
//! ```text
//! validate → collection → order → prepare → streams → runners → Ready
//!   → start() all → barrier → main loop → monitors off → drain/stop
//!   → join (timeout, force EOS, retry) → manifest → reset tuning
//! ```

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use contracts::{
    CollectionManifest, ConnectionBlueprint, ContractError, EngineConfig, EngineEvent,
    ModuleDriver, ModuleRecord, ModuleState, TestSubject,
};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::context::{emit, ModuleFailure, RunBinding};
use crate::monitor::{ResourceMonitor, WatchedConnection};
use crate::ordering;
use crate::platform::{CoreAllocator, OsThreadTuning, ThreadTuning, TuningPlan};
use crate::run_state::{RunState, StopHandle};
use crate::runner::{
    plan_event_runners, spawn_event_runner, spawn_module_thread, EventSlot, Member, RunnerHandle,
};
use crate::storage::{Collection, DirectoryStorage, StorageBackend, StorageGroup};
use crate::{EngineError, Module, ModuleContext, OptionalWaitCondition};

const EVENT_CAPACITY: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Process-wide collaborators of an engine
#[derive(Clone)]
pub struct EngineContext {
    /// Where persistent runs record; None falls back to the configured
    /// export directory
    pub storage: Option<Arc<dyn StorageBackend>>,
    pub tuning: Arc<dyn ThreadTuning>,
    pub test_subject: TestSubject,
    /// Base seed handed to modules through their context
    pub rng_seed: u64,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self {
            storage: None,
            tuning: Arc::new(OsThreadTuning),
            test_subject: TestSubject::default(),
            rng_seed: Uuid::new_v4().as_u64_pair().0,
        }
    }
}

impl EngineContext {
    pub fn with_storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_tuning(mut self, tuning: Arc<dyn ThreadTuning>) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_test_subject(mut self, test_subject: TestSubject) -> Self {
        self.test_subject = test_subject;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = seed;
        self
    }
}

/// Outcome of a run that got past validation
#[derive(Debug, Clone)]
pub struct RunReport {
    pub success: bool,
    pub failure_reason: Option<String>,
    /// Collection written by a persistent run
    pub collection: Option<Collection>,
    pub elapsed_s: f64,
    pub execution_order: Vec<String>,
    /// Module errors raised during the run
    pub errors: Vec<ModuleFailure>,
}

struct ModuleEntry {
    module: Arc<dyn Module>,
    ctx: Arc<ModuleContext>,
}

impl ModuleEntry {
    fn member(&self) -> Member {
        Member {
            module: Arc::clone(&self.module),
            ctx: Arc::clone(&self.ctx),
        }
    }
}

/// Orchestrator of module runs
pub struct Engine {
    context: EngineContext,
    config: EngineConfig,
    modules: Vec<ModuleEntry>,
    connections: Vec<ConnectionBlueprint>,
    events: broadcast::Sender<EngineEvent>,
    stop: StopHandle,
    pending_errors: Vec<ModuleFailure>,
}

impl Engine {
    pub fn new(mut context: EngineContext, config: EngineConfig) -> Self {
        if context.storage.is_none() {
            if let Some(dir) = &config.export_dir {
                context.storage = Some(Arc::new(DirectoryStorage::new(dir)));
            }
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            context,
            config,
            modules: Vec::new(),
            connections: Vec::new(),
            events,
            stop: StopHandle::new(),
            pending_errors: Vec::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register and initialize a module
    pub fn add_module(&mut self, module: Arc<dyn Module>) -> Result<(), EngineError> {
        let name = module.name().to_string();
        if self.entry(&name).is_some() {
            return Err(ContractError::DuplicateModule { name }.into());
        }

        let ctx = Arc::new(ModuleContext::new(
            &name,
            self.context.rng_seed,
            self.events.clone(),
        ));
        if let Err(e) = module.initialize() {
            ctx.set_state(ModuleState::Error);
            return Err(EngineError::module_failed(name, e.to_string()));
        }
        ctx.set_state(ModuleState::Idle);

        info!(module = %name, id = module.id(), driver = ?module.driver(), "module added");
        self.modules.push(ModuleEntry { module, ctx });
        Ok(())
    }

    /// Unregister a module, cutting every connection it takes part in
    pub fn remove_module(&mut self, name: &str) -> Result<Arc<dyn Module>, EngineError> {
        let pos = self
            .modules
            .iter()
            .position(|e| e.module.name() == name)
            .ok_or_else(|| ContractError::ModuleNotFound {
                name: name.to_string(),
            })?;

        for conn in self.connections.iter().filter(|c| c.source == name) {
            if let Some(input) = self
                .entry(&conn.target)
                .and_then(|e| e.module.ports().input(&conn.input))
            {
                input.disconnect();
            }
        }
        self.connections
            .retain(|c| c.source != name && c.target != name);

        let entry = self.modules.remove(pos);
        for input in entry.module.ports().inputs() {
            input.disconnect();
        }
        for output in entry.module.ports().outputs() {
            output.terminate();
        }
        info!(module = %name, "module removed");
        Ok(entry.module)
    }

    /// Connect `source.output` to `target.input`
    pub fn connect(
        &mut self,
        source: &str,
        output: &str,
        target: &str,
        input: &str,
    ) -> Result<(), EngineError> {
        let stream = self
            .entry(source)
            .ok_or_else(|| ContractError::ModuleNotFound {
                name: source.to_string(),
            })?
            .module
            .ports()
            .output(output)
            .cloned()
            .ok_or_else(|| ContractError::port_not_found(source, output))?;
        let port = self
            .entry(target)
            .ok_or_else(|| ContractError::ModuleNotFound {
                name: target.to_string(),
            })?
            .module
            .ports()
            .input(input)
            .cloned()
            .ok_or_else(|| ContractError::port_not_found(target, input))?;

        port.connect(stream.as_ref())?;
        self.connections
            .retain(|c| !(c.target == target && c.input == input));
        self.connections.push(ConnectionBlueprint {
            source: source.to_string(),
            output: output.to_string(),
            target: target.to_string(),
            input: input.to_string(),
        });
        debug!(source, output, target, input, "ports connected");
        Ok(())
    }

    pub fn connections(&self) -> &[ConnectionBlueprint] {
        &self.connections
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules
            .iter()
            .map(|e| e.module.name().to_string())
            .collect()
    }

    pub fn module_state(&self, name: &str) -> Option<ModuleState> {
        self.entry(name).map(|e| e.ctx.state())
    }

    /// State updates of one module, observable while a run is active
    pub fn watch_module_state(&self, name: &str) -> Option<watch::Receiver<ModuleState>> {
        self.entry(name).map(|e| e.ctx.subscribe_state())
    }

    pub fn execution_order(&self) -> Vec<String> {
        ordering::execution_order(&self.module_names(), &self.connections)
    }

    pub fn stop_order(&self) -> Vec<String> {
        ordering::stop_order(&self.execution_order(), &self.config.stop_after)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Handle that ends the active (or next) run
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Module errors not yet collected
    pub fn take_errors(&mut self) -> Vec<ModuleFailure> {
        std::mem::take(&mut self.pending_errors)
    }

    /// Run and record into a new collection
    pub async fn run(&mut self) -> Result<RunReport, EngineError> {
        self.execute(true).await
    }

    /// Run without creating a collection; nothing is written
    pub async fn run_ephemeral(&mut self) -> Result<RunReport, EngineError> {
        self.execute(false).await
    }

    /// Tear down every stream and connection
    pub fn shutdown(mut self) {
        for entry in self.modules.drain(..) {
            for input in entry.module.ports().inputs() {
                input.disconnect();
            }
            for output in entry.module.ports().outputs() {
                output.terminate();
            }
        }
        self.connections.clear();
        info!("engine shut down");
    }

    fn entry(&self, name: &str) -> Option<&ModuleEntry> {
        self.modules.iter().find(|e| e.module.name() == name)
    }

    #[instrument(skip(self), fields(modules = self.modules.len()))]
    async fn execute(&mut self, persist: bool) -> Result<RunReport, EngineError> {
        if self.modules.is_empty() {
            return Err(ContractError::NoModules.into());
        }
        let storage = if persist {
            let backend = self.context.storage.clone().ok_or_else(|| {
                ContractError::invalid_export_dir("", "no export directory configured")
            })?;
            let collection = backend.create_collection(&self.config.collection_name)?;
            Some(StorageGroup::new(backend, collection))
        } else {
            None
        };

        self.stop.reset();
        let mut run = RunState::new(storage, self.execution_order(), self.stop_order());
        let mut manifest = run.storage.as_ref().map(|storage| {
            let mut manifest = CollectionManifest::new(
                &storage.collection().name,
                self.context.test_subject.clone(),
            );
            manifest.collection_id = storage.collection().id;
            manifest
        });
        info!(order = ?run.execution_order, persist, "run starting");

        let tuning = Arc::clone(&self.context.tuning);
        let engine_tuning = TuningPlan {
            niceness: self.config.threading.engine_niceness,
            ..TuningPlan::default()
        };
        engine_tuning.apply(tuning.as_ref(), "engine");

        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
        for entry in &self.modules {
            if entry.ctx.state() == ModuleState::Error {
                entry.ctx.set_state(ModuleState::Idle);
            }
            entry.ctx.bind_run(RunBinding {
                clock: Arc::clone(&run.clock),
                running: Arc::new(AtomicBool::new(true)),
                errors: errors_tx.clone(),
                storage: run.storage.clone(),
            });
        }
        drop(errors_tx);

        let prepared = self.prepare_modules(&mut run);
        let barrier = Arc::new(OptionalWaitCondition::new());
        let mut runners = Vec::new();
        let (monitor_tx, monitor_rx) = watch::channel(false);
        let mut monitor = None;
        let mut failures = Vec::new();

        if !run.is_failed() {
            for name in &run.execution_order {
                if let Some(entry) = self.entry(name) {
                    for output in entry.module.ports().outputs() {
                        output.start();
                    }
                }
            }

            let (launched, launch_error) = self.launch_runners(&run, &prepared, &barrier);
            runners = launched;
            if let Some(e) = launch_error {
                run.fail(e.to_string());
            }
        }

        if !run.is_failed() {
            let runner_modules: Vec<String> =
                runners.iter().flat_map(|r| r.modules.clone()).collect();
            if let Err(reason) = self.wait_ready(&runner_modules).await {
                run.fail(reason);
            }
        }

        if !run.is_failed() {
            if let Err(e) = run.clock.start() {
                run.fail(e.to_string());
            }
        }

        if !run.is_failed() {
            self.start_modules(&mut run);
        }

        if run.is_failed() {
            // contexts blocked on the barrier must see the cleared flag
            for entry in &self.modules {
                entry.ctx.clear_running();
            }
            barrier.wake_all();
        } else {
            for name in &run.execution_order {
                if let Some(entry) = self.entry(name) {
                    entry.ctx.set_state(ModuleState::Running);
                }
            }
            let collection = run
                .storage
                .as_ref()
                .map(|s| s.collection().id.to_string())
                .unwrap_or_else(|| "ephemeral".to_string());
            emit(&self.events, EngineEvent::RunStarted { collection });

            let monitor_task = ResourceMonitor::new(
                self.config.monitor.clone(),
                run.storage.as_ref().map(|s| s.collection().root.clone()),
                self.watched_connections(),
                self.events.clone(),
                self.stop.clone(),
            );
            monitor = Some(tokio::spawn(monitor_task.run(monitor_rx)));

            barrier.wake_all();
            info!("run started");

            let stop = self.stop.clone();
            tokio::select! {
                _ = stop.stopped() => {
                    if let Some(reason) = stop.abort_reason() {
                        run.fail(reason);
                    }
                }
                failure = errors_rx.recv() => {
                    if let Some(failure) = failure {
                        run.fail(format!("module '{}' failed: {}", failure.module, failure.message));
                        failures.push(failure);
                    }
                }
            }
        }

        let _ = monitor_tx.send(true);
        if let Some(task) = monitor {
            if let Err(e) = task.await {
                warn!(error = %e, "resource monitor task failed");
            }
        }

        self.stop_modules(&run, &prepared).await;
        let stalled = self.join_runners(runners).await;

        let stall_error = if stalled.is_empty() {
            None
        } else {
            let reason = format!("modules {stalled:?} did not stop in time");
            error!(modules = ?stalled, "shutdown stalled, the process may deadlock");
            run.fail(reason.clone());
            if let Some(manifest) = manifest.as_mut() {
                self.finalize_manifest(&run, manifest);
            }
            Some(EngineError::Stall {
                modules: stalled.clone(),
            })
        };

        while let Ok(failure) = errors_rx.try_recv() {
            run.fail(format!("module '{}' failed: {}", failure.module, failure.message));
            failures.push(failure);
        }

        for entry in &self.modules {
            if stalled.iter().any(|s| s == entry.module.name()) {
                continue;
            }
            if entry.ctx.state() != ModuleState::Error {
                entry.ctx.set_state(ModuleState::Idle);
            }
            entry.ctx.unbind_run();
        }

        if let Some(manifest) = manifest.as_mut() {
            self.finalize_manifest(&run, manifest);
        }

        let report = RunReport {
            success: !run.is_failed(),
            failure_reason: run.failure().map(str::to_string),
            collection: run.storage.as_ref().map(|s| s.collection().clone()),
            elapsed_s: run.elapsed_s(),
            execution_order: run.execution_order.clone(),
            errors: failures.clone(),
        };
        self.pending_errors.extend(failures);

        emit(
            &self.events,
            EngineEvent::RunFinished {
                success: report.success,
                failure_reason: report.failure_reason.clone(),
            },
        );
        engine_tuning.reset(tuning.as_ref(), "engine");
        info!(
            success = report.success,
            reason = report.failure_reason.as_deref().unwrap_or(""),
            elapsed_s = report.elapsed_s,
            "run finished"
        );

        match stall_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Prepare in execution order; the first failure aborts
    fn prepare_modules(&self, run: &mut RunState) -> HashSet<String> {
        let mut prepared = HashSet::new();
        for name in &run.execution_order {
            let Some(entry) = self.entry(name) else {
                continue;
            };
            entry.ctx.set_state(ModuleState::Preparing);
            match run_hook(|| entry.module.prepare(&entry.ctx, &self.context.test_subject)) {
                Ok(()) => {
                    debug!(module = %name, "module prepared");
                    if entry.module.driver() == ModuleDriver::None {
                        entry.ctx.set_state(ModuleState::Ready);
                    }
                    prepared.insert(name.clone());
                }
                Err(e) => {
                    entry.ctx.raise_error(format!("prepare failed: {e}"));
                    run.fail(format!("module '{name}' failed to prepare: {e}"));
                    break;
                }
            }
        }
        prepared
    }

    /// Spawn the execution contexts of prepared modules.
    ///
    /// Returns what was spawned even when a later spawn failed.
    fn launch_runners(
        &self,
        run: &RunState,
        prepared: &HashSet<String>,
        barrier: &Arc<OptionalWaitCondition>,
    ) -> (Vec<RunnerHandle>, Option<EngineError>) {
        let threading = &self.config.threading;
        let tuning = &self.context.tuning;
        let mut cores = CoreAllocator::new(threading, tuning.available_cores());
        let mut runners = Vec::new();
        let mut slots = Vec::new();

        for name in run.execution_order.iter().filter(|n| prepared.contains(*n)) {
            let Some(entry) = self.entry(name) else {
                continue;
            };
            let module = &entry.module;
            match module.driver() {
                ModuleDriver::None => {}
                ModuleDriver::ThreadDedicated => {
                    let features = module.features();
                    let plan = TuningPlan::for_module(features, threading, cores.assign(features));
                    match spawn_module_thread(
                        entry.member(),
                        Arc::clone(barrier),
                        Arc::clone(tuning),
                        plan,
                    ) {
                        Ok(handle) => runners.push(handle),
                        Err(source) => {
                            return (
                                runners,
                                Some(EngineError::Spawn {
                                    thread: name.clone(),
                                    source,
                                }),
                            )
                        }
                    }
                }
                ModuleDriver::EventsDedicated => slots.push((
                    EventSlot {
                        name: name.clone(),
                        shared_key: None,
                    },
                    entry.member(),
                )),
                ModuleDriver::EventsShared => slots.push((
                    EventSlot {
                        name: name.clone(),
                        shared_key: Some(
                            module.events_group().unwrap_or(module.id()).to_string(),
                        ),
                    },
                    entry.member(),
                )),
            }
        }

        for (label, members) in plan_event_runners(slots, threading.max_events_modules_per_thread) {
            match spawn_event_runner(
                label.clone(),
                members,
                Arc::clone(barrier),
                Arc::clone(tuning),
                threading.module_niceness,
            ) {
                Ok(handle) => runners.push(handle),
                Err(source) => {
                    return (
                        runners,
                        Some(EngineError::Spawn {
                            thread: label,
                            source,
                        }),
                    )
                }
            }
        }
        debug!(runners = runners.len(), "execution contexts launched");
        (runners, None)
    }

    /// Wait until every context reported Ready
    async fn wait_ready(&self, modules: &[String]) -> Result<(), String> {
        let deadline = tokio::time::Instant::now() + self.config.shutdown.join_timeout();
        for name in modules {
            let Some(entry) = self.entry(name) else {
                continue;
            };
            let mut state = entry.ctx.subscribe_state();
            let outcome = tokio::time::timeout_at(deadline, async {
                state
                    .wait_for(|s| matches!(s, ModuleState::Ready | ModuleState::Error))
                    .await
                    .map(|s| *s)
            })
            .await;
            match outcome {
                Ok(Ok(ModuleState::Ready)) => {}
                Ok(Ok(_)) | Ok(Err(_)) => return Err(format!("module '{name}' failed before start")),
                Err(_) => return Err(format!("module '{name}' did not become ready")),
            }
        }
        Ok(())
    }

    /// Call `start()` on every prepared module in execution order
    fn start_modules(&self, run: &mut RunState) {
        for name in &run.execution_order {
            let Some(entry) = self.entry(name) else {
                continue;
            };
            if let Err(e) = run_hook(|| entry.module.start(&entry.ctx)) {
                entry.ctx.raise_error(format!("start failed: {e}"));
                run.fail(format!("module '{name}' failed to start: {e}"));
                return;
            }
        }
    }

    /// Stop modules in stop order, giving each a bounded window to drain
    async fn stop_modules(&self, run: &RunState, prepared: &HashSet<String>) {
        let drain_window = self.config.shutdown.drain_window();
        for name in &run.stop_order {
            let Some(entry) = self.entry(name) else {
                continue;
            };

            if prepared.contains(name) && entry.ctx.state() != ModuleState::Error {
                let deadline = Instant::now() + drain_window;
                while pending_input(entry) > 0 && Instant::now() < deadline {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                let left = pending_input(entry);
                if left > 0 {
                    warn!(module = %name, pending = left, "inputs not drained within window");
                }
            }

            entry.ctx.clear_running();
            if prepared.contains(name) {
                if let Err(e) = run_hook(|| entry.module.stop(&entry.ctx)) {
                    entry.ctx.raise_error(format!("stop failed: {e}"));
                }
            }
            for output in entry.module.ports().outputs() {
                output.stop();
            }
            debug!(module = %name, "module stopped");
        }
    }

    /// Join every runner with the two timeout tiers; returns stalled modules
    async fn join_runners(&self, runners: Vec<RunnerHandle>) -> Vec<String> {
        let started = Instant::now();
        let shutdown = &self.config.shutdown;
        let mut remaining = join_until(runners, shutdown.join_timeout(), started).await;
        if remaining.is_empty() {
            return Vec::new();
        }

        let stuck: Vec<String> = remaining.iter().flat_map(|r| r.modules.clone()).collect();
        warn!(modules = ?stuck, "execution contexts still running, forcing end-of-stream");
        for name in &stuck {
            self.force_end_of_stream(name);
        }

        remaining = join_until(remaining, shutdown.join_retry_timeout(), started).await;
        // stalled threads are detached
        remaining.into_iter().flat_map(|r| r.modules).collect()
    }

    /// Close the inputs of `name` and the inputs it feeds
    fn force_end_of_stream(&self, name: &str) {
        if let Some(entry) = self.entry(name) {
            for (_, subscription) in entry.module.ports().input_subscriptions() {
                subscription.force_terminate();
            }
        }
        for conn in self.connections.iter().filter(|c| c.source == name) {
            if let Some(subscription) = self
                .entry(&conn.target)
                .and_then(|e| e.module.ports().input(&conn.input))
                .and_then(|p| p.subscription())
            {
                subscription.force_terminate();
            }
        }
    }

    fn watched_connections(&self) -> Vec<WatchedConnection> {
        self.modules
            .iter()
            .flat_map(|entry| {
                let module = entry.module.name().to_string();
                let config = &self.config.monitor;
                entry
                    .module
                    .ports()
                    .input_subscriptions()
                    .into_iter()
                    .map(move |(port, subscription)| {
                        WatchedConnection::new(module.clone(), port, subscription, config)
                    })
            })
            .collect()
    }

    fn finalize_manifest(&self, run: &RunState, manifest: &mut CollectionManifest) {
        let Some(storage) = run.storage.as_ref() else {
            return;
        };
        manifest.modules = run
            .execution_order
            .iter()
            .filter_map(|name| self.entry(name))
            .map(|entry| ModuleRecord {
                name: entry.module.name().to_string(),
                id: entry.module.id().to_string(),
                driver: entry.module.driver(),
            })
            .collect();
        manifest.datasets = storage.datasets();
        manifest.finish(
            !run.is_failed(),
            run.failure().map(str::to_string),
            run.elapsed_s(),
        );
        if let Err(e) = storage.save_manifest(manifest) {
            error!(error = %e, "failed to save collection manifest");
        }
    }
}

/// Run a synchronous module hook. On a multi-thread runtime the worker
/// hands its other tasks off while the hook blocks; a current-thread
/// runtime runs it inline.
fn run_hook<R>(hook: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(hook)
        }
        _ => hook(),
    }
}

fn pending_input(entry: &ModuleEntry) -> usize {
    entry
        .module
        .ports()
        .input_subscriptions()
        .iter()
        .map(|(_, s)| s.approx_pending())
        .sum()
}

/// Join finished runners until all are done or `timeout` elapsed
async fn join_until(
    mut runners: Vec<RunnerHandle>,
    timeout: Duration,
    stop_started: Instant,
) -> Vec<RunnerHandle> {
    let deadline = Instant::now() + timeout;
    loop {
        let (finished, rest): (Vec<_>, Vec<_>) =
            runners.into_iter().partition(RunnerHandle::is_finished);
        for runner in finished {
            for module in &runner.modules {
                observability::record_join_duration(module, stop_started.elapsed());
            }
            runner.join();
        }
        runners = rest;
        if runners.is_empty() || Instant::now() >= deadline {
            return runners;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("modules", &self.module_names())
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{RecordingTuning, TuningCall};
    use crate::ModuleError;
    use contracts::{ModuleFeatures, ShutdownConfig};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stream::{InputPort, ModulePorts, Stream};

    /// Pushes `count` items once started
    struct Source {
        name: String,
        ports: ModulePorts,
        out: Stream<u64>,
        count: u64,
        started: AtomicBool,
        pushed_before_start: AtomicBool,
        features: ModuleFeatures,
    }

    impl Source {
        fn new(name: &str, count: u64) -> Self {
            let mut ports = ModulePorts::new();
            let out = ports.add_output::<u64>("out", "Numbers");
            Self {
                name: name.into(),
                ports,
                out,
                count,
                started: AtomicBool::new(false),
                pushed_before_start: AtomicBool::new(false),
                features: ModuleFeatures::empty(),
            }
        }
    }

    impl Module for Source {
        fn name(&self) -> &str {
            &self.name
        }
        fn id(&self) -> &str {
            "test_source"
        }
        fn driver(&self) -> ModuleDriver {
            ModuleDriver::ThreadDedicated
        }
        fn features(&self) -> ModuleFeatures {
            self.features
        }
        fn ports(&self) -> &ModulePorts {
            &self.ports
        }
        fn prepare(&self, _ctx: &ModuleContext, _subject: &TestSubject) -> Result<(), ModuleError> {
            Ok(())
        }
        fn start(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn run_thread(
            &self,
            ctx: &ModuleContext,
            start_wait: &OptionalWaitCondition,
        ) -> Result<(), ModuleError> {
            start_wait.wait();
            for i in 0..self.count {
                if !ctx.is_running() {
                    break;
                }
                if !self.started.load(Ordering::SeqCst) {
                    self.pushed_before_start.store(true, Ordering::SeqCst);
                }
                self.out.push(i);
            }
            Ok(())
        }
    }

    /// Collects items until end-of-stream
    struct Sink {
        ports: ModulePorts,
        input: Arc<InputPort<u64>>,
        received: Mutex<Vec<u64>>,
        saw_end: AtomicBool,
        dataset: Mutex<Option<std::path::PathBuf>>,
    }

    impl Sink {
        fn new() -> Self {
            let mut ports = ModulePorts::new();
            let input = ports.add_input::<u64>("in", "Numbers");
            Self {
                ports,
                input,
                received: Mutex::new(Vec::new()),
                saw_end: AtomicBool::new(false),
                dataset: Mutex::new(None),
            }
        }
    }

    impl Module for Sink {
        fn name(&self) -> &str {
            "sink"
        }
        fn id(&self) -> &str {
            "test_sink"
        }
        fn driver(&self) -> ModuleDriver {
            ModuleDriver::ThreadDedicated
        }
        fn ports(&self) -> &ModulePorts {
            &self.ports
        }
        fn prepare(&self, ctx: &ModuleContext, _subject: &TestSubject) -> Result<(), ModuleError> {
            *self.dataset.lock() = ctx.dataset_dir("numbers")?;
            Ok(())
        }
        fn run_thread(
            &self,
            _ctx: &ModuleContext,
            start_wait: &OptionalWaitCondition,
        ) -> Result<(), ModuleError> {
            start_wait.wait();
            let Some(sub) = self.input.subscription() else {
                return Ok(());
            };
            while let Some(item) = sub.next() {
                self.received.lock().push(item);
            }
            self.saw_end.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Event-driven module counting its polls
    struct Ticker {
        name: String,
        polls: AtomicUsize,
        ports: ModulePorts,
        fail_after: Option<usize>,
    }

    impl Ticker {
        fn new(name: &str, fail_after: Option<usize>) -> Self {
            Self {
                name: name.into(),
                polls: AtomicUsize::new(0),
                ports: ModulePorts::new(),
                fail_after,
            }
        }
    }

    impl Module for Ticker {
        fn name(&self) -> &str {
            &self.name
        }
        fn id(&self) -> &str {
            "test_ticker"
        }
        fn driver(&self) -> ModuleDriver {
            ModuleDriver::EventsShared
        }
        fn ports(&self) -> &ModulePorts {
            &self.ports
        }
        fn event_interval(&self) -> Duration {
            Duration::from_millis(1)
        }
        fn prepare(&self, _ctx: &ModuleContext, _subject: &TestSubject) -> Result<(), ModuleError> {
            Ok(())
        }
        fn process_events(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.fail_after {
                Some(limit) if polls >= limit => Err(ModuleError::device("sensor disconnected")),
                _ => Ok(()),
            }
        }
    }

    /// Fails in prepare
    struct Broken {
        ports: ModulePorts,
    }

    impl Module for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn id(&self) -> &str {
            "test_broken"
        }
        fn driver(&self) -> ModuleDriver {
            ModuleDriver::ThreadDedicated
        }
        fn ports(&self) -> &ModulePorts {
            &self.ports
        }
        fn prepare(&self, _ctx: &ModuleContext, _subject: &TestSubject) -> Result<(), ModuleError> {
            Err(ModuleError::device("no device found"))
        }
    }

    /// Ignores every stop request until released
    struct Stuck {
        ports: ModulePorts,
        release: Arc<AtomicBool>,
    }

    impl Module for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }
        fn id(&self) -> &str {
            "test_stuck"
        }
        fn driver(&self) -> ModuleDriver {
            ModuleDriver::ThreadDedicated
        }
        fn ports(&self) -> &ModulePorts {
            &self.ports
        }
        fn prepare(&self, _ctx: &ModuleContext, _subject: &TestSubject) -> Result<(), ModuleError> {
            Ok(())
        }
        fn run_thread(
            &self,
            _ctx: &ModuleContext,
            start_wait: &OptionalWaitCondition,
        ) -> Result<(), ModuleError> {
            start_wait.wait();
            while !self.release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            shutdown: ShutdownConfig {
                drain_window_ms: 200,
                join_timeout_ms: 2000,
                join_retry_timeout_ms: 1000,
            },
            ..EngineConfig::default()
        }
    }

    fn test_engine() -> Engine {
        let context = EngineContext::default().with_tuning(Arc::new(RecordingTuning::new()));
        Engine::new(context, fast_config())
    }

    fn stop_after(engine: &Engine, delay: Duration) {
        let stop = engine.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            stop.request_stop();
        });
    }

    #[tokio::test]
    async fn test_pipeline_delivers_in_order() {
        let mut engine = test_engine();
        let source = Arc::new(Source::new("source", 100));
        let sink = Arc::new(Sink::new());
        engine.add_module(sink.clone()).unwrap();
        engine.add_module(source.clone()).unwrap();
        engine.connect("source", "out", "sink", "in").unwrap();
        assert_eq!(engine.execution_order(), vec!["source", "sink"]);

        stop_after(&engine, Duration::from_millis(200));
        let report = engine.run_ephemeral().await.unwrap();

        assert!(report.success, "{:?}", report.failure_reason);
        assert!(report.collection.is_none());
        assert_eq!(*sink.received.lock(), (0..100).collect::<Vec<u64>>());
        assert!(sink.saw_end.load(Ordering::SeqCst));
        assert!(!source.pushed_before_start.load(Ordering::SeqCst));
        assert_eq!(engine.module_state("source"), Some(ModuleState::Idle));
        assert_eq!(engine.module_state("sink"), Some(ModuleState::Idle));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pipeline_on_multi_thread_runtime() {
        let mut engine = test_engine();
        let sink = Arc::new(Sink::new());
        engine.add_module(Arc::new(Source::new("source", 50))).unwrap();
        engine.add_module(sink.clone()).unwrap();
        engine.connect("source", "out", "sink", "in").unwrap();

        stop_after(&engine, Duration::from_millis(200));
        let report = engine.run_ephemeral().await.unwrap();
        assert!(report.success, "{:?}", report.failure_reason);
        assert_eq!(*sink.received.lock(), (0..50).collect::<Vec<u64>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_blocking_hook_leaves_worker_free() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ticks);
        let progressed = tokio::spawn(async move {
            let counter = Arc::clone(&seen);
            let ticker = tokio::spawn(async move {
                loop {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            });
            let progressed = run_hook(|| {
                let before = seen.load(Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(200));
                seen.load(Ordering::SeqCst) - before
            });
            ticker.abort();
            progressed
        })
        .await
        .unwrap();
        assert!(progressed > 0);
        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_blocking_hook_runs_inline_on_current_thread() {
        let thread = std::thread::current().id();
        assert_eq!(run_hook(|| std::thread::current().id()), thread);
    }

    #[test]
    fn test_blocking_hook_without_runtime() {
        assert_eq!(run_hook(|| 7), 7);
    }

    #[tokio::test]
    async fn test_second_run_reuses_connections() {
        let mut engine = test_engine();
        let source = Arc::new(Source::new("source", 10));
        let sink = Arc::new(Sink::new());
        engine.add_module(source).unwrap();
        engine.add_module(sink.clone()).unwrap();
        engine.connect("source", "out", "sink", "in").unwrap();

        for _ in 0..2 {
            stop_after(&engine, Duration::from_millis(100));
            assert!(engine.run_ephemeral().await.unwrap().success);
        }
        assert_eq!(sink.received.lock().len(), 20);
    }

    #[tokio::test]
    async fn test_persistent_run_writes_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            export_dir: Some(tmp.path().to_path_buf()),
            collection_name: "session".into(),
            ..fast_config()
        };
        let subject = TestSubject {
            id: "P01".into(),
            ..TestSubject::default()
        };
        let context = EngineContext::default()
            .with_tuning(Arc::new(RecordingTuning::new()))
            .with_test_subject(subject.clone());
        let mut engine = Engine::new(context, config);
        engine.add_module(Arc::new(Source::new("source", 5))).unwrap();
        engine.add_module(Arc::new(Sink::new())).unwrap();
        engine.connect("source", "out", "sink", "in").unwrap();

        stop_after(&engine, Duration::from_millis(100));
        let report = engine.run().await.unwrap();
        let collection = report.collection.unwrap();

        let manifest = DirectoryStorage::load_manifest(&collection.root).unwrap();
        assert!(manifest.success);
        assert_eq!(manifest.collection_id, collection.id);
        assert_eq!(manifest.test_subject, subject);
        assert_eq!(
            manifest.modules.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            vec!["source", "sink"]
        );
        assert_eq!(manifest.datasets.len(), 1);
        assert_eq!(manifest.datasets[0].module, "sink");
        assert!(collection.root.join("sink").join("numbers").is_dir());
        assert!(manifest.elapsed_s > 0.0);
    }

    #[tokio::test]
    async fn test_prepare_failure_aborts_run() {
        let tmp = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            export_dir: Some(tmp.path().to_path_buf()),
            ..fast_config()
        };
        let mut engine = Engine::new(
            EngineContext::default().with_tuning(Arc::new(RecordingTuning::new())),
            config,
        );
        let source = Arc::new(Source::new("source", 5));
        engine.add_module(Arc::new(Broken {
            ports: ModulePorts::new(),
        }))
        .unwrap();
        engine.add_module(source.clone()).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), engine.run())
            .await
            .unwrap()
            .unwrap();
        assert!(!report.success);
        assert!(report.failure_reason.unwrap().contains("broken"));
        assert_eq!(engine.module_state("broken"), Some(ModuleState::Error));
        assert!(!source.started.load(Ordering::SeqCst));

        let manifest = DirectoryStorage::load_manifest(&report.collection.unwrap().root).unwrap();
        assert!(!manifest.success);
        let errors = engine.take_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].module, "broken");
    }

    #[tokio::test]
    async fn test_module_error_stops_run() {
        let mut engine = test_engine();
        let healthy = Arc::new(Ticker::new("healthy", None));
        engine.add_module(healthy.clone()).unwrap();
        engine
            .add_module(Arc::new(Ticker::new("flaky", Some(5))))
            .unwrap();
        let mut events = engine.subscribe_events();

        let report = tokio::time::timeout(Duration::from_secs(5), engine.run_ephemeral())
            .await
            .unwrap()
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].module, "flaky");
        assert!(report.failure_reason.unwrap().contains("sensor disconnected"));
        assert!(healthy.polls.load(Ordering::SeqCst) > 0);
        assert_eq!(engine.module_state("flaky"), Some(ModuleState::Error));
        assert_eq!(engine.module_state("healthy"), Some(ModuleState::Idle));

        let seen: Vec<EngineEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(seen
            .iter()
            .any(|e| matches!(e, EngineEvent::RunStarted { collection } if collection == "ephemeral")));
        assert!(matches!(
            seen.last(),
            Some(EngineEvent::RunFinished { success: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_stall_is_reported() {
        let release = Arc::new(AtomicBool::new(false));
        let config = EngineConfig {
            shutdown: ShutdownConfig {
                drain_window_ms: 10,
                join_timeout_ms: 50,
                join_retry_timeout_ms: 50,
            },
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(
            EngineContext::default().with_tuning(Arc::new(RecordingTuning::new())),
            config,
        );
        engine
            .add_module(Arc::new(Stuck {
                ports: ModulePorts::new(),
                release: Arc::clone(&release),
            }))
            .unwrap();

        stop_after(&engine, Duration::from_millis(20));
        let err = engine.run_ephemeral().await.unwrap_err();
        match err {
            EngineError::Stall { modules } => assert_eq!(modules, vec!["stuck".to_string()]),
            other => panic!("unexpected error {other}"),
        }
        release.store(true, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_tuning_requests() {
        let tuning = Arc::new(RecordingTuning::new());
        let config = EngineConfig {
            threading: contracts::ThreadingConfig {
                realtime_priority: 15,
                affinity_cores: vec![3],
                engine_niceness: Some(-2),
                ..contracts::ThreadingConfig::default()
            },
            ..fast_config()
        };
        let mut engine = Engine::new(
            EngineContext::default().with_tuning(tuning.clone()),
            config,
        );
        let mut source = Source::new("rt", 1);
        source.features = ModuleFeatures::REALTIME | ModuleFeatures::REQUEST_CPU_AFFINITY;
        engine.add_module(Arc::new(source)).unwrap();

        stop_after(&engine, Duration::from_millis(50));
        assert!(engine.run_ephemeral().await.unwrap().success);

        let calls = tuning.calls();
        let thread = "mod-rt".to_string();
        assert!(calls.contains(&TuningCall::Pin {
            thread: thread.clone(),
            core: 3
        }));
        assert!(calls.contains(&TuningCall::Realtime {
            thread: thread.clone(),
            priority: 15
        }));
        assert!(calls.contains(&TuningCall::Reset { thread }));
        assert!(calls
            .iter()
            .any(|c| matches!(c, TuningCall::Niceness { niceness: -2, .. })));
    }

    #[tokio::test]
    async fn test_configuration_errors() {
        let mut engine = test_engine();
        let err = engine.run_ephemeral().await.unwrap_err();
        assert!(err.is_configuration_error());

        engine.add_module(Arc::new(Sink::new())).unwrap();
        let err = engine.add_module(Arc::new(Sink::new())).unwrap_err();
        assert!(err.is_configuration_error());

        // persistent run without any export directory
        let err = engine.run().await.unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_connect_validation() {
        let mut engine = test_engine();
        engine.add_module(Arc::new(Sink::new())).unwrap();
        engine.add_module(Arc::new(Source::new("source", 1))).unwrap();

        assert!(matches!(
            engine.connect("nope", "out", "sink", "in"),
            Err(EngineError::Contract(ContractError::ModuleNotFound { .. }))
        ));
        assert!(matches!(
            engine.connect("source", "missing", "sink", "in"),
            Err(EngineError::Contract(ContractError::PortNotFound { .. }))
        ));
        engine.connect("source", "out", "sink", "in").unwrap();
        engine.connect("source", "out", "sink", "in").unwrap();
        assert_eq!(engine.connections().len(), 1);
    }

    #[test]
    fn test_remove_module_cuts_connections() {
        let mut engine = test_engine();
        let sink = Arc::new(Sink::new());
        engine.add_module(sink.clone()).unwrap();
        engine.add_module(Arc::new(Source::new("source", 1))).unwrap();
        engine.connect("source", "out", "sink", "in").unwrap();

        engine.remove_module("source").unwrap();
        assert!(engine.connections().is_empty());
        assert!(sink.input.subscription().is_none());
        assert_eq!(engine.module_names(), vec!["sink"]);
        assert!(engine.remove_module("source").is_err());
    }

    #[test]
    fn test_stop_order_uses_rules() {
        let mut config = fast_config();
        config.stop_after.push(contracts::StopAfterRule {
            module: "a".into(),
            after: "b".into(),
        });
        let mut engine = Engine::new(EngineContext::default(), config);
        engine.add_module(Arc::new(Sink::new())).unwrap();
        engine.add_module(Arc::new(Source::new("a", 1))).unwrap();
        engine.add_module(Arc::new(Source::new("b", 1))).unwrap();
        engine.connect("a", "out", "sink", "in").unwrap();

        assert_eq!(engine.execution_order(), vec!["a", "b", "sink"]);
        assert_eq!(engine.stop_order(), vec!["b", "a", "sink"]);
    }
}
