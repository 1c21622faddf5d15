//! `info` command implementation.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use contracts::RunBlueprint;
use serde::Serialize;
use tracing::info;

use super::load_blueprint;
use crate::cli::InfoArgs;

/// Blueprint info for JSON output
#[derive(Serialize)]
struct ConfigInfo {
    version: String,
    test_subject: String,
    engine: EngineInfo,
    modules: Vec<ModuleInfo>,
    connections: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_after: Vec<String>,
}

#[derive(Serialize)]
struct EngineInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    export_dir: Option<String>,
    collection_name: String,
    join_timeout_ms: u64,
    max_events_modules_per_thread: usize,
}

#[derive(Serialize)]
struct ModuleInfo {
    name: String,
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    driver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    events_group: Option<String>,
    tolerance_us: i64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    params: BTreeMap<String, serde_json::Value>,
}

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration info");

    let blueprint = load_blueprint(&args.config)?;

    if args.json {
        let info = build_config_info(&blueprint, args);
        let json =
            serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&blueprint, args);
    }

    Ok(())
}

fn build_config_info(blueprint: &RunBlueprint, args: &InfoArgs) -> ConfigInfo {
    let modules = blueprint
        .modules
        .iter()
        .map(|m| ModuleInfo {
            name: m.name.clone(),
            kind: m.kind.clone(),
            driver: m.driver.map(|d| format!("{d:?}")),
            events_group: m.events_group.clone(),
            tolerance_us: m.sync.tolerance_us,
            params: if args.params {
                m.params.clone()
            } else {
                BTreeMap::new()
            },
        })
        .collect();

    let engine = &blueprint.engine;
    ConfigInfo {
        version: format!("{:?}", blueprint.version),
        test_subject: blueprint.test_subject.id.clone(),
        engine: EngineInfo {
            export_dir: engine.export_dir.as_ref().map(|p| p.display().to_string()),
            collection_name: engine.collection_name.clone(),
            join_timeout_ms: engine.shutdown.join_timeout_ms,
            max_events_modules_per_thread: engine.threading.max_events_modules_per_thread,
        },
        modules,
        connections: blueprint
            .connections
            .iter()
            .map(|c| format!("{}.{} -> {}.{}", c.source, c.output, c.target, c.input))
            .collect(),
        stop_after: engine
            .stop_after
            .iter()
            .map(|r| format!("{} after {}", r.module, r.after))
            .collect(),
    }
}

fn print_config_info(blueprint: &RunBlueprint, args: &InfoArgs) {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                  daqflow Run Blueprint                       ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    let engine = &blueprint.engine;
    println!("⚙️  Engine");
    println!("   ├─ Version: {:?}", blueprint.version);
    println!("   ├─ Collection: {}", engine.collection_name);
    match &engine.export_dir {
        Some(dir) => println!("   ├─ Export dir: {}", dir.display()),
        None => println!("   ├─ Export dir: (unset)"),
    }
    if blueprint.test_subject.id.is_empty() {
        println!("   └─ Test subject: (none)");
    } else {
        println!("   └─ Test subject: {}", blueprint.test_subject.id);
    }

    println!("\n🧩 Modules ({})", blueprint.modules.len());
    for (i, module) in blueprint.modules.iter().enumerate() {
        let is_last = i == blueprint.modules.len() - 1;
        let prefix = if is_last { "└─" } else { "├─" };
        let child_prefix = if is_last { "   " } else { "│  " };

        let driver = module
            .driver
            .map(|d| format!("{d:?}"))
            .unwrap_or_else(|| "default".to_string());
        println!("   {} {} ({}, {})", prefix, module.name, module.kind, driver);

        if args.params && !module.params.is_empty() {
            for (j, (key, value)) in module.params.iter().enumerate() {
                let param_is_last = j == module.params.len() - 1;
                let param_prefix = if param_is_last { "└─" } else { "├─" };
                println!("   {}  {} {} = {}", child_prefix, param_prefix, key, value);
            }
        }
    }

    if !blueprint.connections.is_empty() {
        println!("\n🔗 Connections ({})", blueprint.connections.len());
        for (i, c) in blueprint.connections.iter().enumerate() {
            let is_last = i == blueprint.connections.len() - 1;
            let prefix = if is_last { "└─" } else { "├─" };
            println!(
                "   {} {}.{} -> {}.{}",
                prefix, c.source, c.output, c.target, c.input
            );
        }
    }

    if !engine.stop_after.is_empty() {
        println!("\n⏹  Stop order rules");
        for rule in &engine.stop_after {
            println!("   - {} after {}", rule.module, rule.after);
        }
    }

    println!();
}
