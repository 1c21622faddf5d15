//! 配置校验模块
//!
//! 校验规则：
//! - 至少一个模块，模块名非空且唯一
//! - 连接引用已存在的模块，并给出两端端口名
//! - stop-after 规则引用已存在的模块
//! - 同步器容差与上报间隔为正
//! - 监控间隔为正，heat 阈值严格递增
//! - 内存紧急下限低于告警水位
//! - 关闭超时为正

use std::collections::HashSet;

use contracts::{ContractError, RunBlueprint};

/// 校验 RunBlueprint 配置
///
/// 返回第一个遇到的错误，或 Ok(())。
pub fn validate(blueprint: &RunBlueprint) -> Result<(), ContractError> {
    validate_modules(blueprint)?;
    validate_connections(blueprint)?;
    validate_stop_rules(blueprint)?;
    validate_synchronizers(blueprint)?;
    validate_engine(blueprint)?;
    Ok(())
}

fn validate_modules(blueprint: &RunBlueprint) -> Result<(), ContractError> {
    if blueprint.modules.is_empty() {
        return Err(ContractError::NoModules);
    }

    let mut seen = HashSet::new();
    for (idx, module) in blueprint.modules.iter().enumerate() {
        if module.name.trim().is_empty() {
            return Err(ContractError::config_validation(
                format!("modules[{idx}].name"),
                "module name cannot be empty",
            ));
        }
        if module.kind.trim().is_empty() {
            return Err(ContractError::config_validation(
                format!("modules[{}].kind", module.name),
                "module kind cannot be empty",
            ));
        }
        if !seen.insert(module.name.as_str()) {
            return Err(ContractError::DuplicateModule {
                name: module.name.clone(),
            });
        }
    }
    Ok(())
}

fn validate_connections(blueprint: &RunBlueprint) -> Result<(), ContractError> {
    let names: HashSet<_> = blueprint.modules.iter().map(|m| m.name.as_str()).collect();

    for (idx, conn) in blueprint.connections.iter().enumerate() {
        for (role, module) in [("source", &conn.source), ("target", &conn.target)] {
            if !names.contains(module.as_str()) {
                return Err(ContractError::config_validation(
                    format!("connections[{idx}].{role}"),
                    format!("module '{module}' not found"),
                ));
            }
        }
        if conn.output.is_empty() || conn.input.is_empty() {
            return Err(ContractError::config_validation(
                format!("connections[{idx}]"),
                "both output and input port ids are required",
            ));
        }
    }

    let mut inputs = HashSet::new();
    for conn in &blueprint.connections {
        if !inputs.insert((conn.target.as_str(), conn.input.as_str())) {
            return Err(ContractError::config_validation(
                format!("connections[{}.{}]", conn.target, conn.input),
                "input port already has a subscription",
            ));
        }
    }
    Ok(())
}

fn validate_stop_rules(blueprint: &RunBlueprint) -> Result<(), ContractError> {
    let names: HashSet<_> = blueprint.modules.iter().map(|m| m.name.as_str()).collect();

    for rule in &blueprint.engine.stop_after {
        for name in [&rule.module, &rule.after] {
            if !names.contains(name.as_str()) {
                return Err(ContractError::config_validation(
                    "engine.stop_after",
                    format!("module '{name}' not found"),
                ));
            }
        }
        if rule.module == rule.after {
            return Err(ContractError::config_validation(
                "engine.stop_after",
                format!("module '{}' cannot be stopped after itself", rule.module),
            ));
        }
    }
    Ok(())
}

fn validate_synchronizers(blueprint: &RunBlueprint) -> Result<(), ContractError> {
    for module in &blueprint.modules {
        if module.sync.tolerance_us <= 0 {
            return Err(ContractError::config_validation(
                format!("modules[{}].sync.tolerance_us", module.name),
                format!("tolerance must be > 0, got {}", module.sync.tolerance_us),
            ));
        }
        if module.sync.report_interval_s <= 0.0 {
            return Err(ContractError::config_validation(
                format!("modules[{}].sync.report_interval_s", module.name),
                "report interval must be > 0",
            ));
        }
    }
    Ok(())
}

fn validate_engine(blueprint: &RunBlueprint) -> Result<(), ContractError> {
    let engine = &blueprint.engine;
    let monitor = &engine.monitor;

    for (field, value) in [
        ("engine.monitor.disk_interval_s", monitor.disk_interval_s),
        ("engine.monitor.memory_interval_s", monitor.memory_interval_s),
        ("engine.monitor.heat_interval_s", monitor.heat_interval_s),
        ("engine.shutdown.join_timeout_ms", engine.shutdown.join_timeout_ms),
        (
            "engine.shutdown.join_retry_timeout_ms",
            engine.shutdown.join_retry_timeout_ms,
        ),
    ] {
        if value == 0 {
            return Err(ContractError::config_validation(field, "must be > 0"));
        }
    }

    let [low, medium, high] = monitor.heat_thresholds;
    if !(low < medium && medium < high) {
        return Err(ContractError::config_validation(
            "engine.monitor.heat_thresholds",
            format!("thresholds must be strictly increasing, got [{low}, {medium}, {high}]"),
        ));
    }
    if monitor.heat_hysteresis >= low {
        return Err(ContractError::config_validation(
            "engine.monitor.heat_hysteresis",
            format!("hysteresis ({}) must be below the lowest threshold ({low})", monitor.heat_hysteresis),
        ));
    }

    if monitor.memory_emergency_percent >= monitor.memory_warn_percent {
        return Err(ContractError::config_validation(
            "engine.monitor.memory_emergency_percent",
            format!(
                "emergency floor ({}) must be below the warning level ({})",
                monitor.memory_emergency_percent, monitor.memory_warn_percent
            ),
        ));
    }

    if engine.threading.max_events_modules_per_thread == 0 {
        return Err(ContractError::config_validation(
            "engine.threading.max_events_modules_per_thread",
            "must be > 0",
        ));
    }
    Ok(())
}
