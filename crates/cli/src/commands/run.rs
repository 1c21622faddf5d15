//! `run` command implementation.

use std::time::Duration;

use anyhow::{Context, Result};
use contracts::{EngineEvent, RunBlueprint};
use engine::{Engine, EngineContext, RunReport, StopHandle};
use modules::ModuleRegistry;
use observability::RunStatsAggregator;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::load_blueprint;
use crate::cli::RunArgs;
use crate::error::CliError;

/// How long the summary collector may lag behind the finished run
const SUMMARY_GRACE: Duration = Duration::from_secs(2);

/// Execute the `run` command.
///
/// The engine is driven from a single-threaded runtime on the main thread,
/// so engine niceness applies to the thread orchestrating the run.
pub fn run_engine(args: &RunArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration");
    let mut blueprint = load_blueprint(&args.config)?;

    if let Some(dir) = &args.export_dir {
        info!(export_dir = %dir.display(), "Overriding export directory from CLI");
        blueprint.engine.export_dir = Some(dir.clone());
    }
    if args.metrics_port != 0 {
        observability::init_metrics_only(args.metrics_port)?;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    runtime.block_on(execute(args, blueprint))
}

async fn execute(args: &RunArgs, blueprint: RunBlueprint) -> Result<()> {
    let mut context = EngineContext::default().with_test_subject(blueprint.test_subject.clone());
    if let Some(seed) = args.seed {
        context = context.with_seed(seed);
    }

    let mut engine = Engine::new(context, blueprint.engine.clone());
    ModuleRegistry::with_builtins()
        .install(&mut engine, &blueprint)
        .context("Failed to build modules")?;

    info!(
        modules = engine.module_names().len(),
        connections = engine.connections().len(),
        order = ?engine.execution_order(),
        ephemeral = args.ephemeral,
        "Modules installed"
    );

    let collector = spawn_collector(engine.subscribe_events());
    spawn_stop_triggers(engine.stop_handle(), args.duration_secs);

    info!("Starting run...");
    let result = if args.ephemeral {
        engine.run_ephemeral().await
    } else {
        engine.run().await
    };

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            collector.abort();
            return Err(e).context("Run aborted");
        }
    };

    match tokio::time::timeout(SUMMARY_GRACE, collector).await {
        Ok(Ok(stats)) => println!("\n{}", stats.summary()),
        Ok(Err(e)) => warn!(error = %e, "Summary collector failed"),
        Err(_) => warn!("Run summary incomplete"),
    }
    print_report(&report);
    engine.shutdown();

    if report.success {
        info!(elapsed_s = report.elapsed_s, "daqflow finished");
        Ok(())
    } else {
        let reason = report
            .failure_reason
            .unwrap_or_else(|| "unknown reason".to_string());
        Err(CliError::run_failed(reason).into())
    }
}

/// Fold engine events into run statistics until the run finishes
fn spawn_collector(mut events: broadcast::Receiver<EngineEvent>) -> JoinHandle<RunStatsAggregator> {
    tokio::spawn(async move {
        let mut stats = RunStatsAggregator::new();
        loop {
            match events.recv().await {
                Ok(event) => {
                    let finished = matches!(event, EngineEvent::RunFinished { .. });
                    stats.update(&event);
                    if finished {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Summary collector lagged behind engine events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        stats
    })
}

/// Stop the run on Ctrl-C / SIGTERM and, when set, after `duration_secs`
fn spawn_stop_triggers(stop: StopHandle, duration_secs: u64) {
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Received shutdown signal, stopping run...");
        signal_stop.request_stop();
    });

    if duration_secs > 0 {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(duration_secs)).await;
            info!(duration_secs, "Run duration elapsed");
            stop.request_stop();
        });
    }
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn print_report(report: &RunReport) {
    println!("Elapsed: {:.2} s", report.elapsed_s);
    println!("Execution order: {}", report.execution_order.join(" -> "));
    match &report.collection {
        Some(collection) => println!(
            "Collection: {} ({})",
            collection.root.display(),
            collection.id
        ),
        None => println!("Collection: none (ephemeral run)"),
    }
    if !report.errors.is_empty() {
        println!("Errors:");
        for failure in &report.errors {
            println!("  {}: {}", failure.module, failure.message);
        }
    }
    println!();
}
