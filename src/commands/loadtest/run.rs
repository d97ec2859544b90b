//! `sqlload loadtest run` command implementation.

use anyhow::{Context, Result};
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use sqlload::loadtest::catalog::QueryCatalog;
use sqlload::loadtest::config::LoadTestConfig;
use sqlload::loadtest::error_log::ErrorLog;
use sqlload::loadtest::exporter::{self, PrometheusExporter};
use sqlload::loadtest::metrics::MetricsAggregator;
use sqlload::loadtest::orchestrator::{LoadTestResult, LoadTester};
use sqlload::loadtest::session::SqlxSessionFactory;
use sqlload::loadtest::summary::render_summary;

use super::resolve_config_path;

/// Execute the `loadtest run` command.
///
/// Loads config (via explicit path or auto-discovery), applies CLI overrides,
/// wires metrics sinks, runs the orchestrator under a signal handler and
/// prints the summary. The summary is printed even when startup fails.
pub async fn execute_run(
    config_path: Option<PathBuf>,
    users: Option<u32>,
    duration: Option<u64>,
    database_url: Option<String>,
    no_color: bool,
) -> Result<()> {
    // Step 1: Load config
    let config_file = resolve_config_path(config_path)?;
    eprintln!("Loading config from: {}", config_file.display());

    let mut config = LoadTestConfig::load(&config_file)
        .with_context(|| format!("Failed to load config '{}'", config_file.display()))?;

    // Step 2: Apply CLI overrides and re-check
    apply_overrides(&mut config, users, duration, database_url);
    config.validate().context("Invalid configuration after CLI overrides")?;

    // Step 3: Build the metrics sinks and the orchestrator
    let plan = config.to_plan();
    let catalog = QueryCatalog::new(config.test.queries.clone())?;

    let prometheus = if config.metrics.prometheus.enabled {
        Some(Arc::new(PrometheusExporter::new()?))
    } else {
        None
    };
    let metrics = Arc::new(match &prometheus {
        Some(exp) => MetricsAggregator::with_exporter(exp.clone()),
        None => MetricsAggregator::new(),
    });

    let factory = Arc::new(SqlxSessionFactory::from_config(&config.database));
    let mut tester = LoadTester::new(plan.clone(), catalog, metrics, factory);
    if config.metrics.enabled {
        tester = tester.with_snapshot_file(&config.metrics.output_file, config.metrics.interval());
    }
    if let Some(path) = &config.metrics.error_log_file {
        let log = ErrorLog::open(path)
            .with_context(|| format!("Failed to open error log '{}'", path.display()))?;
        tracing::info!(path = %log.path().display(), "Logging failed queries");
        tester = tester.with_error_log(Arc::new(log));
    }

    let exporter_cancel = CancellationToken::new();
    let exporter_task = prometheus.map(|exp| {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics.prometheus.port));
        let path = config.metrics.prometheus.path.clone();
        let cancel = exporter_cancel.clone();
        eprintln!("Prometheus metrics on http://{addr}{path}");
        tokio::spawn(async move { exporter::serve(exp, addr, &path, cancel).await })
    });

    // Step 4: Run under the signal handler
    let target = config.database.display_target();
    eprintln!("Target database: {target}");

    let started = Instant::now();
    let signals = tokio::spawn(handle_shutdown_signals(tester.cancel_token()));
    let outcome = tester.run().await;
    signals.abort();
    tester.close().await;

    exporter_cancel.cancel();
    if let Some(task) = exporter_task {
        match task.await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => tracing::warn!(error = %e, "Prometheus exporter stopped with an error"),
            Err(e) => tracing::warn!(error = %e, "Prometheus exporter task failed"),
        }
    }

    // Step 5: Output the terminal summary
    if no_color || !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }

    match outcome {
        Ok(result) => {
            println!("{}", render_summary(&result, &plan, &target));
            if config.metrics.enabled {
                eprintln!();
                eprintln!("Metrics written to: {}", config.metrics.output_file.display());
            }
            Ok(())
        },
        Err(e) => {
            let stats = tester.stats();
            let partial = LoadTestResult {
                snapshot: stats.snapshot,
                elapsed: started.elapsed(),
                peak_workers: tester.peak_workers(),
                final_workers: stats.active_workers,
                cancelled: false,
            };
            println!("{}", render_summary(&partial, &plan, &target));
            Err(anyhow::Error::new(e).context("Load test failed"))
        },
    }
}

/// Apply CLI flag overrides to a loaded config.
///
/// `--users` sets the initial population; a scaling plan still takes over
/// once its first step fires.
fn apply_overrides(
    config: &mut LoadTestConfig,
    users: Option<u32>,
    duration: Option<u64>,
    database_url: Option<String>,
) {
    if let Some(u) = users {
        if config.has_scaling() {
            tracing::info!(users = u, "--users sets the initial population; scaling steps still apply");
        }
        config.test.concurrent_users = u;
    }
    if let Some(d) = duration {
        config.test.duration_secs = d;
    }
    if let Some(url) = database_url.filter(|u| !u.trim().is_empty()) {
        config.database.url = Some(url);
    }
}

/// Two-phase shutdown on Ctrl+C (and SIGTERM on unix).
///
/// The first signal cancels the run and lets workers drain. The second
/// exits immediately with status 1.
async fn handle_shutdown_signals(cancel: CancellationToken) {
    if let Err(e) = wait_for_signal().await {
        tracing::warn!(error = %e, "Failed to install signal handler");
        return;
    }
    eprintln!("\nReceived shutdown signal, stopping gracefully...");
    cancel.cancel();

    if wait_for_signal().await.is_ok() {
        eprintln!("\nReceived second signal, aborting immediately.");
        std::process::exit(1);
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
