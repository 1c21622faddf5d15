//! Resource monitoring during a run
//!
//! Disk space at the export location, available memory and the backlog of
//! every connected input port are sampled on their own intervals. Crossing
//! a threshold emits a warning event; only shrinking memory below the
//! emergency floor stops the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use contracts::{ConnectionHeat, EngineEvent, MonitorConfig, ResourceWarningKind};
use stream::{AnySubscription, HeatTracker};
use sysinfo::{Disks, System};
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::context::emit;
use crate::run_state::StopHandle;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Low disk space detection with a single warning per episode
#[derive(Debug)]
pub(crate) struct DiskCheck {
    threshold_bytes: u64,
    warned: bool,
}

impl DiskCheck {
    pub fn new(threshold_bytes: u64) -> Self {
        Self {
            threshold_bytes,
            warned: false,
        }
    }

    pub fn evaluate(&mut self, available_bytes: u64) -> Option<EngineEvent> {
        let low = available_bytes < self.threshold_bytes;
        if low == self.warned {
            return None;
        }
        self.warned = low;
        let message = format!(
            "{:.1} GiB free at the export location",
            available_bytes as f64 / GIB
        );
        Some(EngineEvent::ResourceWarning {
            kind: ResourceWarningKind::DiskSpace,
            resolved: !low,
            message,
        })
    }
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct MemoryVerdict {
    pub event: Option<EngineEvent>,
    pub emergency: bool,
}

/// Available memory tracking with trend detection
#[derive(Debug)]
pub(crate) struct MemoryCheck {
    warn_percent: f64,
    emergency_percent: f64,
    last_percent: Option<f64>,
    warned: bool,
}

impl MemoryCheck {
    pub fn new(warn_percent: f64, emergency_percent: f64) -> Self {
        Self {
            warn_percent,
            emergency_percent,
            last_percent: None,
            warned: false,
        }
    }

    pub fn evaluate(&mut self, available_percent: f64) -> MemoryVerdict {
        let shrinking = self
            .last_percent
            .is_some_and(|last| available_percent < last);
        self.last_percent = Some(available_percent);

        let low = available_percent < self.warn_percent;
        let event = (low != self.warned).then(|| {
            self.warned = low;
            EngineEvent::ResourceWarning {
                kind: ResourceWarningKind::Memory,
                resolved: !low,
                message: format!("{available_percent:.1}% of memory available"),
            }
        });

        MemoryVerdict {
            event,
            emergency: shrinking && available_percent < self.emergency_percent,
        }
    }
}

/// An input port watched for backlog
pub(crate) struct WatchedConnection {
    pub module: String,
    pub port: String,
    pub subscription: Arc<dyn AnySubscription>,
    heat: HeatTracker,
}

impl WatchedConnection {
    pub fn new(
        module: impl Into<String>,
        port: impl Into<String>,
        subscription: Arc<dyn AnySubscription>,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            module: module.into(),
            port: port.into(),
            subscription,
            heat: HeatTracker::new(config.heat_thresholds, config.heat_hysteresis),
        }
    }
}

/// Connection heat over all watched ports
pub(crate) struct HeatCheck {
    connections: Vec<WatchedConnection>,
    warned: bool,
}

impl HeatCheck {
    pub fn new(connections: Vec<WatchedConnection>) -> Self {
        Self {
            connections,
            warned: false,
        }
    }

    pub fn evaluate(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        for conn in &mut self.connections {
            let pending = conn.subscription.approx_pending();
            observability::record_subscription_backlog(&conn.module, &conn.port, pending);
            if let Some(heat) = conn.heat.update(pending) {
                debug!(module = %conn.module, port = %conn.port, pending, %heat, "connection heat changed");
                events.push(EngineEvent::ConnectionHeatChanged {
                    module: conn.module.clone(),
                    port: conn.port.clone(),
                    heat,
                });
            }
        }

        let hot: Vec<String> = self
            .connections
            .iter()
            .filter(|c| c.heat.current() >= ConnectionHeat::Medium)
            .map(|c| format!("{}.{}", c.module, c.port))
            .collect();
        let overloaded = !hot.is_empty();
        if overloaded != self.warned {
            self.warned = overloaded;
            let message = if overloaded {
                format!("consumers fall behind: {}", hot.join(", "))
            } else {
                "stream backlogs recovered".to_string()
            };
            events.push(EngineEvent::ResourceWarning {
                kind: ResourceWarningKind::StreamBuffers,
                resolved: !overloaded,
                message,
            });
        }
        events
    }
}

/// Periodic checks for the lifetime of one run
pub(crate) struct ResourceMonitor {
    config: MonitorConfig,
    export_dir: Option<PathBuf>,
    events: broadcast::Sender<EngineEvent>,
    stop: StopHandle,
    disk: DiskCheck,
    memory: MemoryCheck,
    heat: HeatCheck,
}

impl ResourceMonitor {
    pub fn new(
        config: MonitorConfig,
        export_dir: Option<PathBuf>,
        connections: Vec<WatchedConnection>,
        events: broadcast::Sender<EngineEvent>,
        stop: StopHandle,
    ) -> Self {
        Self {
            disk: DiskCheck::new(config.disk_warn_bytes),
            memory: MemoryCheck::new(config.memory_warn_percent, config.memory_emergency_percent),
            heat: HeatCheck::new(connections),
            config,
            export_dir,
            events,
            stop,
        }
    }

    /// Run until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut disk_tick = ticker(self.config.disk_interval_s);
        let mut memory_tick = ticker(self.config.memory_interval_s);
        let mut heat_tick = ticker(self.config.heat_interval_s);
        let mut system = System::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = disk_tick.tick() => self.check_disk(),
                _ = memory_tick.tick() => self.check_memory(&mut system),
                _ = heat_tick.tick() => {
                    for event in self.heat.evaluate() {
                        emit(&self.events, event);
                    }
                }
            }
        }
        debug!("resource monitor stopped");
    }

    fn check_disk(&mut self) {
        let Some(dir) = self.export_dir.as_deref() else {
            return;
        };
        match available_disk_space(dir) {
            Some(available) => {
                if let Some(event) = self.disk.evaluate(available) {
                    warn!(path = %dir.display(), available, "disk space warning changed");
                    emit(&self.events, event);
                }
            }
            None => debug!(path = %dir.display(), "no disk found for export directory"),
        }
    }

    fn check_memory(&mut self, system: &mut System) {
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return;
        }
        let percent = system.available_memory() as f64 / total as f64 * 100.0;
        let verdict = self.memory.evaluate(percent);
        if let Some(event) = verdict.event {
            warn!(available_percent = percent, "memory warning changed");
            emit(&self.events, event);
        }
        if verdict.emergency {
            error!(available_percent = percent, "memory nearly exhausted, stopping run");
            self.stop.abort(format!(
                "emergency stop: only {percent:.1}% of memory available"
            ));
        }
    }
}

fn ticker(seconds: u64) -> tokio::time::Interval {
    let mut tick = interval(Duration::from_secs(seconds.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

/// Free space of the disk holding `path` (longest matching mount point)
fn available_disk_space(path: &Path) -> Option<u64> {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream::Stream;

    #[test]
    fn test_disk_warning_once_per_episode() {
        let mut disk = DiskCheck::new(1000);
        assert_eq!(disk.evaluate(5000), None);
        assert!(matches!(
            disk.evaluate(500),
            Some(EngineEvent::ResourceWarning {
                kind: ResourceWarningKind::DiskSpace,
                resolved: false,
                ..
            })
        ));
        assert_eq!(disk.evaluate(400), None);
        assert!(matches!(
            disk.evaluate(2000),
            Some(EngineEvent::ResourceWarning { resolved: true, .. })
        ));
    }

    #[test]
    fn test_memory_emergency_needs_shrinking_trend() {
        let mut memory = MemoryCheck::new(10.0, 4.0);

        // first sample has no trend
        let first = memory.evaluate(3.0);
        assert!(!first.emergency);
        assert!(first.event.is_some());

        // stable low memory only warns
        assert_eq!(memory.evaluate(3.0), MemoryVerdict::default());

        // shrinking below the floor
        assert!(memory.evaluate(2.5).emergency);

        // shrinking above the floor is fine
        let mut memory = MemoryCheck::new(10.0, 4.0);
        memory.evaluate(8.0);
        let verdict = memory.evaluate(6.0);
        assert!(!verdict.emergency);
        assert!(verdict.event.is_some());
    }

    #[test]
    fn test_heat_check_reports_changes() {
        let stream = Stream::<u32>::new("samples", "Samples");
        let sub = Arc::new(stream.subscribe().unwrap());
        stream.start();

        let config = MonitorConfig {
            heat_thresholds: [10, 20, 30],
            heat_hysteresis: 2,
            ..MonitorConfig::default()
        };
        let mut heat = HeatCheck::new(vec![WatchedConnection::new(
            "rec",
            "in",
            Arc::clone(&sub) as Arc<dyn AnySubscription>,
            &config,
        )]);
        assert!(heat.evaluate().is_empty());

        for i in 0..25 {
            stream.push(i);
        }
        let events = heat.evaluate();
        assert_eq!(
            events[0],
            EngineEvent::ConnectionHeatChanged {
                module: "rec".into(),
                port: "in".into(),
                heat: ConnectionHeat::Medium
            }
        );
        assert!(matches!(
            events[1],
            EngineEvent::ResourceWarning {
                kind: ResourceWarningKind::StreamBuffers,
                resolved: false,
                ..
            }
        ));

        while sub.approx_pending() > 0 {
            sub.next();
        }
        let events = heat.evaluate();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            EngineEvent::ResourceWarning { resolved: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let (events, _rx) = broadcast::channel(16);
        let monitor = ResourceMonitor::new(
            MonitorConfig::default(),
            None,
            Vec::new(),
            events,
            StopHandle::new(),
        );
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(monitor.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
