//! Load test orchestrator: worker population, scaling and shutdown.
//!
//! [`LoadTester`] is the top-level entry point that:
//! - Ramps the initial worker population up over the configured window
//! - Applies the timed scaling plan while the test runs
//! - Waits for the test duration or external cancellation
//! - Drains every worker, flushes the final snapshot and logs the totals
//!
//! The worker collection lives behind a single async mutex held across the
//! staggered sleeps of a ramp or scale step, so population changes never
//! interleave. Workers are appended on growth and popped from the end on
//! shrink (last started, first stopped).

use crate::loadtest::catalog::QueryCatalog;
use crate::loadtest::error::LoadTestError;
use crate::loadtest::error_log::ErrorLog;
use crate::loadtest::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::loadtest::plan::{stagger_interval, TestPlan};
use crate::loadtest::session::SessionFactory;
use crate::loadtest::worker::{Worker, WorkerContext};

use std::cmp::Ordering as CmpOrdering;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Compile-time Send/Sync verification for types crossing task boundaries.
fn _assert_send<T: Send>() {}
fn _assert_sync<T: Sync>() {}
#[allow(dead_code)]
fn _check_send_bounds() {
    _assert_send::<LoadTestResult>();
    _assert_send::<LoadTestStats>();
    _assert_send::<LoadTester>();
    _assert_sync::<LoadTester>();
}

/// Final result of a load test run.
#[derive(Debug, Clone)]
pub struct LoadTestResult {
    /// Statistics after every worker has stopped.
    pub snapshot: MetricsSnapshot,
    /// Wall-clock time from start to the end of shutdown.
    pub elapsed: Duration,
    /// Largest worker population observed.
    pub peak_workers: usize,
    /// Worker population when the run stopped.
    pub final_workers: usize,
    /// `true` if the run ended on external cancellation.
    pub cancelled: bool,
}

/// Point-in-time view of a running test.
#[derive(Debug, Clone)]
pub struct LoadTestStats {
    pub snapshot: MetricsSnapshot,
    pub active_workers: usize,
    pub target_workers: usize,
}

/// Where and how often to write the JSON snapshot.
#[derive(Debug, Clone)]
struct SnapshotTarget {
    path: PathBuf,
    interval: Duration,
}

/// Drives one load test from ramp-up to shutdown.
pub struct LoadTester {
    plan: TestPlan,
    factory: Arc<dyn SessionFactory>,
    metrics: Arc<MetricsAggregator>,
    ctx: Arc<WorkerContext>,
    /// Also serves as the scaling lock.
    workers: Mutex<Vec<Worker>>,
    next_id: AtomicUsize,
    target: AtomicUsize,
    peak: AtomicUsize,
    tracker: TaskTracker,
    cancel: CancellationToken,
    closed: AtomicBool,
    snapshot: Option<SnapshotTarget>,
}

impl LoadTester {
    /// Create an orchestrator for `plan`. Nothing connects until
    /// [`run`](Self::run) or [`start_workers`](Self::start_workers).
    pub fn new(
        plan: TestPlan,
        catalog: QueryCatalog,
        metrics: Arc<MetricsAggregator>,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        let ctx = WorkerContext::new(Arc::new(catalog), metrics.clone(), plan.worker.clone());
        Self {
            plan,
            factory,
            metrics,
            ctx: Arc::new(ctx),
            workers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            target: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            snapshot: None,
        }
    }

    /// Append failed queries to `log`.
    pub fn with_error_log(mut self, log: Arc<ErrorLog>) -> Self {
        let ctx = WorkerContext {
            catalog: self.ctx.catalog.clone(),
            metrics: self.ctx.metrics.clone(),
            settings: self.ctx.settings.clone(),
            error_log: Some(log),
        };
        self.ctx = Arc::new(ctx);
        self
    }

    /// Write the JSON snapshot to `path` every `interval`, plus once at the end.
    pub fn with_snapshot_file(mut self, path: impl Into<PathBuf>, interval: Duration) -> Self {
        self.snapshot = Some(SnapshotTarget {
            path: path.into(),
            interval,
        });
        self
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    /// Token that stops the run when cancelled. Hand it to signal handlers.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current worker population, as published to the gauge.
    pub fn active_workers(&self) -> usize {
        self.metrics.active_users()
    }

    /// Largest population reached so far.
    pub fn peak_workers(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> LoadTestStats {
        LoadTestStats {
            snapshot: self.metrics.snapshot(),
            active_workers: self.metrics.active_users(),
            target_workers: self.target.load(Ordering::Acquire),
        }
    }

    /// Run the full test: ramp-up, scaling, steady state and shutdown.
    ///
    /// Cancellation during ramp-up still yields a result with
    /// `cancelled == true`. A connection failure during ramp-up stops the
    /// workers already started, flushes and logs the final statistics and
    /// then returns the error.
    pub async fn run(&self) -> Result<LoadTestResult, LoadTestError> {
        let test_start = Instant::now();
        tracing::info!(
            users = self.plan.concurrent_users,
            duration_secs = self.plan.duration.as_secs_f64(),
            ramp_up_secs = self.plan.ramp_up.as_secs_f64(),
            queries = self.ctx.catalog.len(),
            scaling_steps = self.plan.scaling.steps.len(),
            "Starting load test"
        );

        if let Some(target) = &self.snapshot {
            self.metrics
                .start_periodic_flush(target.interval, target.path.clone())
                .await;
        }

        match self.start_workers().await {
            Ok(()) => {},
            Err(e) if e.is_cancelled() => {
                tracing::info!("Load test cancelled during ramp-up");
                let final_workers = self.shutdown().await;
                return Ok(self.finish(test_start, final_workers, true).await);
            },
            Err(e) => {
                tracing::error!(error = %e, "Load test startup failed");
                let final_workers = self.shutdown().await;
                self.finish(test_start, final_workers, false).await;
                return Err(e);
            },
        }
        tracing::info!(workers = self.active_workers(), "Ramp-up complete");

        // The driver is dropped at the end of this block, releasing the
        // scaling lock if a step was still in progress.
        let cancelled = {
            let driver = self.drive_scaling(test_start);
            tokio::pin!(driver);
            let mut driver_done = !self.plan.scaling.is_active();
            let deadline = tokio::time::sleep(self.plan.duration);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = &mut deadline => break false,
                    _ = self.cancel.cancelled() => break true,
                    _ = &mut driver, if !driver_done => driver_done = true,
                }
            }
        };
        if cancelled {
            tracing::info!("Load test cancelled, stopping workers");
        }

        let final_workers = self.shutdown().await;
        Ok(self.finish(test_start, final_workers, cancelled).await)
    }

    /// Start the initial population, staggered over the ramp-up window.
    pub async fn start_workers(&self) -> Result<(), LoadTestError> {
        let target = self.plan.concurrent_users;
        self.target.store(target, Ordering::Release);

        let mut workers = self.workers.lock().await;
        let missing = target.saturating_sub(workers.len());
        self.grow(&mut workers, missing, self.plan.ramp_up).await
    }

    /// Move the population to `target`, spreading the change over `ramp`.
    ///
    /// A no-op when the population already equals `target`.
    pub async fn scale_users(
        &self,
        target: usize,
        ramp: Duration,
        description: &str,
    ) -> Result<(), LoadTestError> {
        if self.cancel.is_cancelled() {
            return Err(LoadTestError::Cancelled);
        }

        let mut workers = self.workers.lock().await;
        let current = workers.len();
        self.target.store(target, Ordering::Release);

        match target.cmp(&current) {
            CmpOrdering::Equal => {
                tracing::debug!(workers = current, description, "Scaling step is a no-op");
                Ok(())
            },
            CmpOrdering::Greater => {
                tracing::info!(from = current, to = target, description, "Scaling up");
                self.grow(&mut workers, target - current, ramp).await
            },
            CmpOrdering::Less => {
                tracing::info!(from = current, to = target, description, "Scaling down");
                self.shrink(&mut workers, current - target, ramp).await
            },
        }
    }

    /// Stop every worker and release every session. Only the first call has
    /// any effect; later calls return immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.shutdown().await;
        self.metrics.close().await;
        tracing::debug!("Load tester closed");
    }

    /// Apply each scaling step once its offset from `test_start` has passed.
    async fn drive_scaling(&self, test_start: Instant) {
        if !self.plan.scaling.is_active() {
            return;
        }
        let start = tokio::time::Instant::from_std(test_start);

        for (i, step) in self.plan.scaling.steps.iter().enumerate() {
            tokio::select! {
                _ = tokio::time::sleep_until(start + step.at) => {}
                _ = self.cancel.cancelled() => return,
            }

            tracing::info!(step = i + 1, to = step.target, description = %step.description, "Applying scaling step");
            if let Err(e) = self.scale_users(step.target, step.ramp, &step.description).await {
                if e.is_cancelled() {
                    tracing::debug!(step = i + 1, "Scaling interrupted by cancellation");
                } else {
                    tracing::error!(step = i + 1, error = %e, "Scaling step failed, abandoning scaling plan");
                }
                return;
            }
        }
        tracing::debug!("Scaling plan complete");
    }

    /// Start `count` workers, one every `window / count`.
    async fn grow(
        &self,
        workers: &mut Vec<Worker>,
        count: usize,
        window: Duration,
    ) -> Result<(), LoadTestError> {
        let interval = stagger_interval(window, count);

        for i in 0..count {
            if self.cancel.is_cancelled() {
                return Err(LoadTestError::Cancelled);
            }
            let worker = self.spawn_worker().await?;
            workers.push(worker);
            self.publish_population(workers.len());

            if let Some(interval) = interval.filter(|_| i + 1 < count) {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = self.cancel.cancelled() => return Err(LoadTestError::Cancelled),
                }
            }
        }
        Ok(())
    }

    /// Stop the `count` most recently started workers, one every `window / count`.
    async fn shrink(
        &self,
        workers: &mut Vec<Worker>,
        count: usize,
        window: Duration,
    ) -> Result<(), LoadTestError> {
        let interval = stagger_interval(window, count);

        for i in 0..count {
            let Some(worker) = workers.pop() else {
                break;
            };
            worker.stop();
            tracing::debug!(worker_id = worker.id(), "Worker removed");
            self.publish_population(workers.len());

            if let Some(interval) = interval.filter(|_| i + 1 < count) {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = self.cancel.cancelled() => return Err(LoadTestError::Cancelled),
                }
            }
        }
        Ok(())
    }

    /// Open a session and start a worker on it.
    async fn spawn_worker(&self) -> Result<Worker, LoadTestError> {
        let worker_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = tokio::select! {
            result = self.factory.connect(worker_id) => {
                result.map_err(|source| LoadTestError::Connection { worker_id, source })?
            }
            _ = self.cancel.cancelled() => return Err(LoadTestError::Cancelled),
        };

        let worker = Worker::new(worker_id, self.cancel.child_token());
        worker.start(session, self.ctx.clone(), &self.tracker);
        tracing::debug!(worker_id, "Worker added");
        Ok(worker)
    }

    fn publish_population(&self, n: usize) {
        self.metrics.set_active_users(n);
        self.peak.fetch_max(n, Ordering::AcqRel);
    }

    /// Stop every remaining worker and wait for all worker tasks to exit.
    /// Returns the population at the moment of shutdown.
    async fn shutdown(&self) -> usize {
        let mut workers = self.workers.lock().await;
        let remaining = workers.len();
        while let Some(worker) = workers.pop() {
            worker.stop();
        }
        drop(workers);

        self.tracker.close();
        self.tracker.wait().await;
        self.metrics.set_active_users(0);
        remaining
    }

    /// Stop periodic flushing, write the final snapshot and log the totals.
    async fn finish(&self, test_start: Instant, final_workers: usize, cancelled: bool) -> LoadTestResult {
        // Joins the flush task, so the write below is the last one.
        self.metrics.close().await;
        if let Some(target) = &self.snapshot {
            match self.metrics.flush_to(&target.path).await {
                Ok(()) => tracing::info!(path = %target.path.display(), "Final metrics snapshot written"),
                Err(e) => tracing::error!(error = %e, "Final metrics flush failed"),
            }
        }

        let snapshot = self.metrics.snapshot();
        let elapsed = test_start.elapsed();
        tracing::info!(
            total_queries = snapshot.total_queries,
            total_errors = snapshot.total_errors,
            error_rate = snapshot.error_rate(),
            elapsed_secs = elapsed.as_secs_f64(),
            "Load test finished"
        );
        for (name, stats) in &snapshot.queries {
            tracing::info!(
                query = %name,
                total = stats.total_queries,
                failed = stats.failed_queries,
                avg_ms = stats.avg_duration_ms,
                "Query statistics"
            );
        }

        LoadTestResult {
            snapshot,
            elapsed,
            peak_workers: self.peak.load(Ordering::Acquire),
            final_workers,
            cancelled,
        }
    }
}
