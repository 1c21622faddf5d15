//! 引擎指标收集模块
//!
//! 指标经 `metrics` facade 导出；聚合器在内存中保留同样的信息，
//! 用于运行结束时的汇总。

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use contracts::{ConnectionHeat, EngineEvent, ModuleState, ResourceWarningKind, SyncDetails, SyncState};
use metrics::{counter, gauge, histogram};

/// 从引擎事件记录指标
pub fn record_engine_event(event: &EngineEvent) {
    match event {
        EngineEvent::ResourceWarning { kind, resolved, .. } => record_resource_warning(*kind, *resolved),
        EngineEvent::ConnectionHeatChanged { module, port, heat } => {
            record_connection_heat(module, port, *heat)
        }
        EngineEvent::ModuleStateChanged { module, state } => record_module_state(module, *state),
        EngineEvent::ModuleError { module, .. } => {
            counter!("daqflow_module_errors_total", "module" => module.clone()).increment(1);
        }
        EngineEvent::SyncReport { details, .. } => record_sync_details(details),
        EngineEvent::RunStarted { .. } => {
            counter!("daqflow_runs_started_total").increment(1);
            gauge!("daqflow_run_active").set(1.0);
        }
        EngineEvent::RunFinished { success, .. } => {
            let status = if *success { "success" } else { "failure" };
            counter!("daqflow_runs_finished_total", "status" => status).increment(1);
            gauge!("daqflow_run_active").set(0.0);
        }
    }
}

/// Module lifecycle state as a numeric gauge
pub fn record_module_state(module: &str, state: ModuleState) {
    let value = match state {
        ModuleState::Initializing => 0.0,
        ModuleState::Idle => 1.0,
        ModuleState::Preparing => 2.0,
        ModuleState::Ready => 3.0,
        ModuleState::Running => 4.0,
        ModuleState::Error => -1.0,
    };
    gauge!("daqflow_module_state", "module" => module.to_string()).set(value);
}

pub fn record_resource_warning(kind: ResourceWarningKind, resolved: bool) {
    let kind = match kind {
        ResourceWarningKind::DiskSpace => "disk_space",
        ResourceWarningKind::Memory => "memory",
        ResourceWarningKind::StreamBuffers => "stream_buffers",
    };
    gauge!("daqflow_resource_warning_active", "kind" => kind).set(if resolved { 0.0 } else { 1.0 });
    if !resolved {
        counter!("daqflow_resource_warnings_total", "kind" => kind).increment(1);
    }
}

pub fn record_connection_heat(module: &str, port: &str, heat: ConnectionHeat) {
    gauge!(
        "daqflow_connection_heat",
        "module" => module.to_string(),
        "port" => port.to_string()
    )
    .set(heat as u8 as f64);
}

pub fn record_sync_details(details: &SyncDetails) {
    let deviation = details.current_offset_us - details.expected_offset_us;
    histogram!("daqflow_sync_deviation_us", "sync" => details.id.clone()).record(deviation.abs() as f64);
}

/// Backlog of an input subscription
pub fn record_subscription_backlog(module: &str, port: &str, pending: usize) {
    gauge!(
        "daqflow_subscription_pending",
        "module" => module.to_string(),
        "port" => port.to_string()
    )
    .set(pending as f64);
}

/// Time a module took to join after being stopped
pub fn record_join_duration(module: &str, elapsed: Duration) {
    histogram!("daqflow_module_join_seconds", "module" => module.to_string()).record(elapsed.as_secs_f64());
}

/// In-memory aggregation of the engine events of one run
#[derive(Debug, Clone, Default)]
pub struct RunStatsAggregator {
    /// Module errors in arrival order
    pub module_errors: Vec<(String, String)>,

    /// Resource warnings raised (not counting resolutions)
    pub resource_warnings: HashMap<ResourceWarningKind, u64>,

    /// Highest heat seen per `module/port`
    pub peak_heat: BTreeMap<String, ConnectionHeat>,

    /// Per synchronizer statistics
    pub sync: BTreeMap<String, SyncStats>,

    /// Outcome once the run finished
    pub outcome: Option<(bool, Option<String>)>,
}

/// Statistics of the reports of one synchronizer
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub reports: u64,
    pub corrections: u64,
    pub last_state: SyncState,
    pub expected_offset_us: i64,
    pub deviation_us: RunningStats,
    pub correction_us: RunningStats,
}

impl RunStatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the statistics
    pub fn update(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::ResourceWarning {
                kind,
                resolved: false,
                ..
            } => {
                *self.resource_warnings.entry(*kind).or_insert(0) += 1;
            }
            EngineEvent::ConnectionHeatChanged { module, port, heat } => {
                let peak = self.peak_heat.entry(format!("{module}/{port}")).or_default();
                *peak = (*peak).max(*heat);
            }
            EngineEvent::ModuleError { module, message } => {
                self.module_errors.push((module.clone(), message.clone()));
            }
            EngineEvent::SyncReport { details, .. } => self.update_sync(details),
            EngineEvent::RunFinished {
                success,
                failure_reason,
            } => {
                self.outcome = Some((*success, failure_reason.clone()));
            }
            _ => {}
        }
    }

    fn update_sync(&mut self, details: &SyncDetails) {
        let stats = self.sync.entry(details.id.clone()).or_default();
        stats.reports += 1;
        if details.state == SyncState::Correcting && stats.last_state != SyncState::Correcting {
            stats.corrections += 1;
        }
        stats.last_state = details.state;
        if details.state != SyncState::Calibrating {
            stats.expected_offset_us = details.expected_offset_us;
            stats
                .deviation_us
                .push((details.current_offset_us - details.expected_offset_us) as f64);
            stats.correction_us.push(details.correction_us as f64);
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            success: self.outcome.as_ref().map(|(s, _)| *s),
            failure_reason: self.outcome.as_ref().and_then(|(_, r)| r.clone()),
            module_errors: self.module_errors.clone(),
            resource_warnings: self.resource_warnings.values().sum(),
            hot_connections: self
                .peak_heat
                .iter()
                .filter(|(_, heat)| **heat >= ConnectionHeat::Medium)
                .map(|(k, heat)| (k.clone(), *heat))
                .collect(),
            sync: self
                .sync
                .iter()
                .map(|(id, stats)| {
                    (
                        id.clone(),
                        SyncSummary {
                            final_state: stats.last_state,
                            expected_offset_us: stats.expected_offset_us,
                            corrections: stats.corrections,
                            deviation_us: StatsSummary::from(&stats.deviation_us),
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Summary of one synchronizer
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub final_state: SyncState,
    pub expected_offset_us: i64,
    pub corrections: u64,
    pub deviation_us: StatsSummary,
}

/// Printable end-of-run summary
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub success: Option<bool>,
    pub failure_reason: Option<String>,
    pub module_errors: Vec<(String, String)>,
    pub resource_warnings: u64,
    pub hot_connections: Vec<(String, ConnectionHeat)>,
    pub sync: Vec<(String, SyncSummary)>,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Run Summary ===")?;
        match (self.success, &self.failure_reason) {
            (Some(true), _) => writeln!(f, "Outcome: success")?,
            (Some(false), Some(reason)) => writeln!(f, "Outcome: failed ({reason})")?,
            (Some(false), None) => writeln!(f, "Outcome: failed")?,
            (None, _) => writeln!(f, "Outcome: unknown")?,
        }
        writeln!(f, "Resource warnings: {}", self.resource_warnings)?;

        if !self.module_errors.is_empty() {
            writeln!(f, "Module errors:")?;
            for (module, message) in &self.module_errors {
                writeln!(f, "  {module}: {message}")?;
            }
        }
        if !self.hot_connections.is_empty() {
            writeln!(f, "Congested connections:")?;
            for (connection, heat) in &self.hot_connections {
                writeln!(f, "  {connection}: {heat}")?;
            }
        }
        for (id, sync) in &self.sync {
            writeln!(
                f,
                "Sync {id}: {:?}, expected offset {} us, {} correction(s), deviation {}",
                sync.final_state, sync.expected_offset_us, sync.corrections, sync.deviation_us
            )?;
        }
        Ok(())
    }
}

/// Statistics summary
#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.1}, max={:.1}, mean={:.1}, std={:.1} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// 在线统计 (Welford 算法)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            let delta2 = value - self.mean;
            self.m2 += delta * delta2;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// 样本方差
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(state: SyncState, current: i64, correction: i64) -> SyncDetails {
        SyncDetails {
            id: "cam/frames".to_string(),
            state,
            expected_offset_us: 100,
            current_offset_us: current,
            correction_us: correction,
        }
    }

    #[test]
    fn test_running_stats() {
        let mut stats = RunningStats::default();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            stats.push(v);
        }

        assert_eq!(stats.count(), 5);
        assert!((stats.mean() - 3.0).abs() < 1e-10);
        assert!((stats.min() - 1.0).abs() < 1e-10);
        assert!((stats.max() - 5.0).abs() < 1e-10);
        assert!((stats.variance() - 2.5).abs() < 1e-10);
    }

    #[test]
    fn test_aggregator_counts_events() {
        let mut aggregator = RunStatsAggregator::new();
        aggregator.update(&EngineEvent::ResourceWarning {
            kind: ResourceWarningKind::Memory,
            resolved: false,
            message: "low".into(),
        });
        aggregator.update(&EngineEvent::ResourceWarning {
            kind: ResourceWarningKind::Memory,
            resolved: true,
            message: "ok".into(),
        });
        for heat in [ConnectionHeat::Medium, ConnectionHeat::Low] {
            aggregator.update(&EngineEvent::ConnectionHeatChanged {
                module: "rec".into(),
                port: "in".into(),
                heat,
            });
        }
        aggregator.update(&EngineEvent::ModuleError {
            module: "cam".into(),
            message: "device lost".into(),
        });
        aggregator.update(&EngineEvent::RunFinished {
            success: false,
            failure_reason: Some("device lost".into()),
        });

        let summary = aggregator.summary();
        assert_eq!(summary.resource_warnings, 1);
        assert_eq!(summary.hot_connections, vec![("rec/in".to_string(), ConnectionHeat::Medium)]);
        assert_eq!(summary.module_errors.len(), 1);
        assert_eq!(summary.success, Some(false));
    }

    #[test]
    fn test_sync_reports_are_aggregated() {
        let mut aggregator = RunStatsAggregator::new();
        for d in [
            details(SyncState::Calibrating, 0, 0),
            details(SyncState::InTolerance, 110, 0),
            details(SyncState::Correcting, 2100, 500),
            details(SyncState::Correcting, 2100, 1000),
            details(SyncState::InTolerance, 100, 0),
        ] {
            aggregator.update(&EngineEvent::SyncReport {
                module: "cam".into(),
                details: d,
            });
        }

        let stats = &aggregator.sync["cam/frames"];
        assert_eq!(stats.reports, 5);
        assert_eq!(stats.corrections, 1);
        assert_eq!(stats.deviation_us.count(), 4);
        assert_eq!(stats.last_state, SyncState::InTolerance);
    }

    #[test]
    fn test_summary_display() {
        let mut aggregator = RunStatsAggregator::new();
        aggregator.update(&EngineEvent::RunFinished {
            success: true,
            failure_reason: None,
        });
        aggregator.update(&EngineEvent::SyncReport {
            module: "cam".into(),
            details: details(SyncState::InTolerance, 150, 0),
        });

        let output = aggregator.summary().to_string();
        assert!(output.contains("Outcome: success"));
        assert!(output.contains("Sync cam/frames: InTolerance"));
    }
}
