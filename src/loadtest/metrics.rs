//! Shared, lock-guarded metrics aggregation for a running load test.
//!
//! Workers call [`MetricsAggregator::record_outcome`] once per query
//! execution; the orchestrator and any observer read consistent copies via
//! [`MetricsAggregator::snapshot`].
//!
//! # Design
//!
//! - **Single lock**: one [`parking_lot::RwLock`] guards the per-query map,
//!   the global totals and both gauges. Recording takes the write half and
//!   blocks briefly under contention, so no outcome is ever dropped.
//! - **Snapshots only**: callers never see the live map. A snapshot is a
//!   plain value that can be serialized or sent across tasks.
//! - **Latency histograms**: each query keeps an HdrHistogram in
//!   microseconds for the p50/p95/p99 columns of the summary.
//! - **Mirroring**: when a [`PrometheusExporter`] is attached, every outcome
//!   and gauge change is forwarded to it. Gauges are mirrored while the write
//!   lock is held so the exporter never lags behind the aggregator.
//! - **Atomic files**: snapshots are written to a temporary sibling and
//!   renamed over the destination.
//!
//! The JSON form of a snapshot is:
//!
//! ```json
//! {
//!   "recent_orders": {
//!     "total_queries": 120,
//!     "successful_queries": 118,
//!     "failed_queries": 2,
//!     "avg_duration_ms": 4.7
//!   },
//!   "active_users": 10
//! }
//! ```

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::loadtest::error::LoadTestError;
use crate::loadtest::exporter::PrometheusExporter;

/// Result of one query execution by one worker.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// Catalog name of the executed query.
    pub query: String,
    pub success: bool,
    /// Wall-clock execution time, including any timeout wait.
    pub duration: Duration,
    /// Rows counted (row-returning kinds) or rows affected (write kinds).
    pub rows_affected: u64,
    /// Driver or timeout error text for failed executions.
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl QueryOutcome {
    /// Create a success outcome stamped with the current time.
    pub fn success(query: impl Into<String>, duration: Duration, rows_affected: u64) -> Self {
        Self {
            query: query.into(),
            success: true,
            duration,
            rows_affected,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a failure outcome stamped with the current time.
    pub fn failure(query: impl Into<String>, duration: Duration, error: String) -> Self {
        Self {
            query: query.into(),
            success: false,
            duration,
            rows_affected: 0,
            error: Some(error),
            timestamp: Utc::now(),
        }
    }
}

/// Latency percentiles for one query, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencySummary {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

/// Running statistics for one query name.
///
/// Only the four counters named in the snapshot format are serialized.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryStats {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub failed_queries: u64,
    #[serde(skip)]
    pub total_duration: Duration,
    pub avg_duration_ms: f64,
    #[serde(skip)]
    pub rows_affected: u64,
    #[serde(skip)]
    pub latency: LatencySummary,
}

impl QueryStats {
    /// Fraction of executions that failed (0.0..=1.0).
    pub fn error_rate(&self) -> f64 {
        if self.total_queries == 0 {
            return 0.0;
        }
        self.failed_queries as f64 / self.total_queries as f64
    }
}

/// Point-in-time copy of all aggregated statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Per-query statistics keyed by query name, in name order.
    #[serde(flatten)]
    pub queries: BTreeMap<String, QueryStats>,
    pub active_users: usize,
    #[serde(skip)]
    pub active_connections: usize,
    #[serde(skip)]
    pub total_queries: u64,
    #[serde(skip)]
    pub total_errors: u64,
}

impl MetricsSnapshot {
    /// Statistics for a single query, if it has run at least once.
    pub fn query(&self, name: &str) -> Option<&QueryStats> {
        self.queries.get(name)
    }

    /// Global error rate as a fraction (0.0..=1.0).
    pub fn error_rate(&self) -> f64 {
        if self.total_queries == 0 {
            return 0.0;
        }
        self.total_errors as f64 / self.total_queries as f64
    }

    /// Serialize in the snapshot file format.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Per-query accumulator kept behind the lock.
struct QueryAccumulator {
    stats: QueryStats,
    histogram: Histogram<u64>,
}

impl QueryAccumulator {
    fn new() -> Self {
        let mut histogram = Histogram::<u64>::new(3).expect("3 sigfigs is always valid");
        histogram.auto(true);
        Self {
            stats: QueryStats::default(),
            histogram,
        }
    }

    fn record(&mut self, outcome: &QueryOutcome) {
        let stats = &mut self.stats;
        stats.total_queries += 1;
        if outcome.success {
            stats.successful_queries += 1;
        } else {
            stats.failed_queries += 1;
        }
        stats.total_duration += outcome.duration;
        stats.rows_affected += outcome.rows_affected;
        stats.avg_duration_ms =
            stats.total_duration.as_nanos() as f64 / 1_000_000.0 / stats.total_queries as f64;

        let micros = outcome.duration.as_micros().min(u128::from(u64::MAX)) as u64;
        let _ = self.histogram.record(micros.max(1));
    }

    fn snapshot(&self) -> QueryStats {
        let mut stats = self.stats.clone();
        if !self.histogram.is_empty() {
            let ms = |v: u64| v as f64 / 1000.0;
            stats.latency = LatencySummary {
                p50: ms(self.histogram.value_at_quantile(0.50)),
                p95: ms(self.histogram.value_at_quantile(0.95)),
                p99: ms(self.histogram.value_at_quantile(0.99)),
                max: ms(self.histogram.max()),
            };
        }
        stats
    }
}

#[derive(Default)]
struct AggregateState {
    queries: HashMap<String, QueryAccumulator>,
    active_users: usize,
    active_connections: usize,
    total_queries: u64,
    total_errors: u64,
}

/// Thread-safe running statistics shared by all workers.
pub struct MetricsAggregator {
    state: RwLock<AggregateState>,
    exporter: Option<Arc<PrometheusExporter>>,
    flush_cancel: CancellationToken,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    /// Suffix source for temporary snapshot files.
    flush_seq: AtomicU64,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    /// Create an aggregator with no exporter attached.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(AggregateState::default()),
            exporter: None,
            flush_cancel: CancellationToken::new(),
            flush_task: Mutex::new(None),
            closed: AtomicBool::new(false),
            flush_seq: AtomicU64::new(0),
        }
    }

    /// Create an aggregator that mirrors into `exporter`.
    pub fn with_exporter(exporter: Arc<PrometheusExporter>) -> Self {
        Self {
            exporter: Some(exporter),
            ..Self::new()
        }
    }

    /// Fold one outcome into the named query's statistics and the global totals.
    pub fn record_outcome(&self, outcome: &QueryOutcome) {
        {
            let mut state = self.state.write();
            state.total_queries += 1;
            if !outcome.success {
                state.total_errors += 1;
            }
            state
                .queries
                .entry(outcome.query.clone())
                .or_insert_with(QueryAccumulator::new)
                .record(outcome);
        }

        if let Some(exporter) = &self.exporter {
            exporter.observe(outcome);
        }
    }

    pub fn set_active_users(&self, n: usize) {
        let mut state = self.state.write();
        state.active_users = n;
        if let Some(exporter) = &self.exporter {
            exporter.set_active_users(n);
        }
    }

    /// Count one more open database session.
    pub fn connection_opened(&self) {
        self.adjust_connections(|n| n + 1);
    }

    /// Count one fewer open database session.
    pub fn connection_closed(&self) {
        self.adjust_connections(|n| n.saturating_sub(1));
    }

    fn adjust_connections(&self, f: impl FnOnce(usize) -> usize) {
        let mut state = self.state.write();
        state.active_connections = f(state.active_connections);
        if let Some(exporter) = &self.exporter {
            exporter.set_active_connections(state.active_connections);
        }
    }

    pub fn active_users(&self) -> usize {
        self.state.read().active_users
    }

    pub fn active_connections(&self) -> usize {
        self.state.read().active_connections
    }

    /// Take a consistent copy of every statistic.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.read();
        MetricsSnapshot {
            queries: state
                .queries
                .iter()
                .map(|(name, acc)| (name.clone(), acc.snapshot()))
                .collect(),
            active_users: state.active_users,
            active_connections: state.active_connections,
            total_queries: state.total_queries,
            total_errors: state.total_errors,
        }
    }

    /// Write the current snapshot to `path`, creating parent directories.
    ///
    /// The file is replaced by rename, so readers see either the previous
    /// snapshot or the new one in full.
    pub async fn flush_to(&self, path: &Path) -> Result<(), LoadTestError> {
        let io_err = |source: std::io::Error| LoadTestError::MetricsIo {
            source,
            path: path.display().to_string(),
        };

        let json = self.snapshot().to_json_pretty().map_err(|e| io_err(e.into()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let tmp = self.temp_path(path);
        if let Err(e) = tokio::fs::write(&tmp, json).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(e));
        }
        Ok(())
    }

    /// Hidden sibling of `path`, unique per flush.
    fn temp_path(&self, path: &Path) -> PathBuf {
        let seq = self.flush_seq.fetch_add(1, Ordering::Relaxed);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "metrics.json".to_string());
        path.with_file_name(format!(".{name}.{}.{seq}.tmp", std::process::id()))
    }

    /// Start writing snapshots to `path` every `interval` on a background task.
    ///
    /// No-op if a flush task is already running or the aggregator is closed.
    pub async fn start_periodic_flush(self: &Arc<Self>, interval: Duration, path: PathBuf) {
        let mut slot = self.flush_task.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if slot.is_some() {
            tracing::warn!("Periodic metrics flush already running");
            return;
        }

        let this = Arc::clone(self);
        let cancel = self.flush_cancel.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match this.flush_to(&path).await {
                            Ok(()) => tracing::debug!(path = %path.display(), "Metrics snapshot written"),
                            Err(e) => tracing::warn!(error = %e, "Metrics flush failed"),
                        }
                    }
                }
            }
        }));
    }

    /// Returns `true` while a periodic flush task is alive.
    pub async fn is_flushing(&self) -> bool {
        self.flush_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the periodic flush and wait for an in-flight write to finish.
    ///
    /// Every call returns only once the flush task has exited, so a write
    /// issued afterwards is never overtaken by a periodic one.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.flush_cancel.cancel();
            tracing::debug!("Metrics aggregator closed");
        }

        let mut slot = self.flush_task.lock().await;
        if let Some(handle) = slot.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Metrics flush task panicked");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
