//! Worker task loop for load test execution.
//!
//! Each worker owns its own [`DatabaseSession`] and independently executes
//! weighted-random queries from the shared [`QueryCatalog`]. Every execution
//! produces one [`QueryOutcome`] recorded straight into the shared
//! [`MetricsAggregator`]. Failures are recorded and logged; only
//! cancellation ends the loop.

use crate::loadtest::catalog::{QueryCatalog, QueryDefinition, QueryKind};
use crate::loadtest::error::DbError;
use crate::loadtest::error_log::{ErrorLog, ErrorLogEntry};
use crate::loadtest::metrics::{MetricsAggregator, QueryOutcome};
use crate::loadtest::plan::WorkerSettings;
use crate::loadtest::session::DatabaseSession;

use chrono::Utc;
use parking_lot::Mutex;
use rand::prelude::*;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Lifecycle of a worker: `Created → Running → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(WorkerState::Created as u8)))
    }

    fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move to `to` only if currently in `from`.
    fn transition(&self, from: WorkerState, to: WorkerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Everything a worker shares with its siblings.
pub struct WorkerContext {
    pub catalog: Arc<QueryCatalog>,
    pub metrics: Arc<MetricsAggregator>,
    pub settings: WorkerSettings,
    pub error_log: Option<Arc<ErrorLog>>,
}

impl WorkerContext {
    pub fn new(
        catalog: Arc<QueryCatalog>,
        metrics: Arc<MetricsAggregator>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            catalog,
            metrics,
            settings,
            error_log: None,
        }
    }

    /// Attach a JSON-lines error log.
    pub fn with_error_log(mut self, log: Arc<ErrorLog>) -> Self {
        self.error_log = Some(log);
        self
    }
}

/// Handle to one worker task.
///
/// The session itself lives inside the task and is closed by the task when
/// the loop exits, so it is released exactly once no matter how many times
/// [`Worker::stop`] or [`Worker::close`] are called.
pub struct Worker {
    id: usize,
    state: StateCell,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Create a worker whose token is cancelled when `cancel` is.
    pub fn new(id: usize, cancel: CancellationToken) -> Self {
        Self {
            id,
            state: StateCell::new(),
            cancel,
            handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    /// Spawn the execution loop on `tracker`. Has no effect unless the
    /// worker is still in the `Created` state.
    pub fn start(
        &self,
        session: Box<dyn DatabaseSession>,
        ctx: Arc<WorkerContext>,
        tracker: &TaskTracker,
    ) {
        if !self.state.transition(WorkerState::Created, WorkerState::Running) {
            tracing::warn!(worker_id = self.id, state = %self.state(), "Worker can only be started once");
            return;
        }

        ctx.metrics.connection_opened();

        let handle = tracker.spawn(run_loop(
            self.id,
            session,
            ctx,
            self.cancel.clone(),
            self.state.clone(),
        ));
        *self.handle.lock() = Some(handle);
    }

    /// Signal the loop to exit after its current query. Idempotent.
    pub fn stop(&self) {
        if self.state.transition(WorkerState::Created, WorkerState::Stopped) {
            return;
        }
        self.state.transition(WorkerState::Running, WorkerState::Stopping);
        self.cancel.cancel();
    }

    /// Stop the worker and wait for its task to release the session.
    pub async fn close(&self) {
        self.stop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(worker_id = self.id, error = %e, "Worker task panicked");
            }
        }
    }
}

/// The per-worker select / execute / record / think loop.
async fn run_loop(
    worker_id: usize,
    mut session: Box<dyn DatabaseSession>,
    ctx: Arc<WorkerContext>,
    cancel: CancellationToken,
    state: StateCell,
) {
    tracing::debug!(worker_id, "Worker started");
    let mut rng = StdRng::from_rng(&mut rand::rng());
    let settings = &ctx.settings;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let query = ctx.catalog.select(&mut rng);
        let outcome = execute_query(worker_id, session.as_mut(), query, &ctx).await;
        ctx.metrics.record_outcome(&outcome);

        let factor = rng.random_range(settings.jitter_min..=settings.jitter_max);
        let pause = settings.think_time_with(factor);
        if pause.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = cancel.cancelled() => break,
        }
    }

    state.set(WorkerState::Stopping);
    session.close().await;
    ctx.metrics.connection_closed();
    state.set(WorkerState::Stopped);
    tracing::debug!(worker_id, "Worker stopped");
}

/// A failed execution and the path that failed.
struct Failure {
    operation: &'static str,
    error: DbError,
}

/// Execute `query` once and build its outcome.
async fn execute_query(
    worker_id: usize,
    session: &mut dyn DatabaseSession,
    query: &QueryDefinition,
    ctx: &WorkerContext,
) -> QueryOutcome {
    let start = Instant::now();
    let result = dispatch(session, query, &ctx.settings).await;
    let duration = start.elapsed();

    match result {
        Ok(rows) => QueryOutcome::success(&query.name, duration, rows),
        Err(Failure { operation, error }) => {
            tracing::debug!(
                worker_id,
                query = %query.name,
                operation,
                category = error.error_category(),
                error = %error,
                "Query failed"
            );
            let message = error.to_string();
            if let Some(log) = &ctx.error_log {
                log.append(&ErrorLogEntry {
                    timestamp: Utc::now(),
                    worker_id,
                    query: &query.name,
                    operation,
                    error: &message,
                });
            }
            QueryOutcome::failure(&query.name, duration, message)
        },
    }
}

/// Route a query to the session call matching its kind.
async fn dispatch(
    session: &mut dyn DatabaseSession,
    query: &QueryDefinition,
    settings: &WorkerSettings,
) -> Result<u64, Failure> {
    let timeout = settings.query_timeout;
    let fetch_failed = |error| Failure {
        operation: "fetch",
        error,
    };
    let execute_failed = |error| Failure {
        operation: "execute",
        error,
    };

    match query.kind {
        QueryKind::Select => bounded(timeout, session.fetch_count(query, settings.row_cap))
            .await
            .map_err(fetch_failed),
        QueryKind::Insert | QueryKind::Update | QueryKind::Delete => {
            bounded(timeout, session.execute(query))
                .await
                .map_err(execute_failed)
        },
        QueryKind::Generic => {
            match bounded(timeout, session.fetch_count(query, settings.row_cap)).await {
                Ok(rows) => Ok(rows),
                // Statements that cannot return rows get a second chance as a
                // plain execute; timeouts and broken sessions do not.
                Err(DbError::Query { message }) => {
                    tracing::trace!(query = %query.name, %message, "Row fetch failed, retrying as execute");
                    bounded(timeout, session.execute(query))
                        .await
                        .map_err(execute_failed)
                },
                Err(other) => Err(fetch_failed(other)),
            }
        },
    }
}

/// Apply the per-query deadline to a session call.
async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, DbError>>,
) -> Result<T, DbError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| Err(DbError::Timeout { after: timeout }))
}
