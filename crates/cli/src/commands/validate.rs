//! `validate` command implementation.

use anyhow::{Context, Result};
use contracts::{EngineConfig, RunBlueprint};
use engine::{Engine, EngineContext};
use modules::ModuleRegistry;
use serde::Serialize;
use tracing::info;

use super::load_blueprint;
use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    version: String,
    module_count: usize,
    connection_count: usize,
    execution_order: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    export_dir: Option<String>,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();
    let invalid = |error: String| ValidationResult {
        valid: false,
        config_path: config_path.clone(),
        error: Some(error),
        warnings: None,
        summary: None,
    };

    let blueprint = match load_blueprint(&args.config) {
        Ok(blueprint) => blueprint,
        Err(e) => return invalid(e.to_string()),
    };

    // Build and wire every module on a scratch engine; this catches unknown
    // kinds, bad parameters and port type mismatches.
    let mut engine = Engine::new(EngineContext::default(), EngineConfig::default());
    if let Err(e) = ModuleRegistry::with_builtins().install(&mut engine, &blueprint) {
        return invalid(e.to_string());
    }
    let execution_order = engine.execution_order();
    engine.shutdown();

    let warnings = collect_warnings(&blueprint);
    ValidationResult {
        valid: true,
        config_path: config_path.clone(),
        error: None,
        warnings: if warnings.is_empty() {
            None
        } else {
            Some(warnings)
        },
        summary: Some(ConfigSummary {
            version: format!("{:?}", blueprint.version),
            module_count: blueprint.modules.len(),
            connection_count: blueprint.connections.len(),
            execution_order,
            export_dir: blueprint
                .engine
                .export_dir
                .as_ref()
                .map(|p| p.display().to_string()),
        }),
    }
}

/// Collect configuration warnings (non-fatal issues)
fn collect_warnings(blueprint: &RunBlueprint) -> Vec<String> {
    let mut warnings = Vec::new();

    if blueprint.engine.export_dir.is_none() {
        warnings.push(
            "engine.export_dir is not set - only --ephemeral runs or --export-dir work".to_string(),
        );
    }

    if blueprint.connections.is_empty() && blueprint.modules.len() > 1 {
        warnings.push("No connections configured - modules run unconnected".to_string());
    }

    for module in &blueprint.modules {
        let is_connected = blueprint
            .connections
            .iter()
            .any(|c| c.source == module.name || c.target == module.name);
        if !is_connected && blueprint.modules.len() > 1 {
            warnings.push(format!("Module '{}' is not connected", module.name));
        }
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Version: {}", summary.version);
            println!("  Modules: {}", summary.module_count);
            println!("  Connections: {}", summary.connection_count);
            println!("  Execution order: {}", summary.execution_order.join(" -> "));
            if let Some(ref dir) = summary.export_dir {
                println!("  Export dir: {}", dir);
            }
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}
