//! Prometheus exporter for live load test counters.
//!
//! The [`MetricsAggregator`](crate::loadtest::metrics::MetricsAggregator)
//! mirrors every outcome and gauge change into a [`PrometheusExporter`].
//! Each exporter owns its own [`Registry`], so several runs (or tests) in
//! one process never collide on metric names.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::loadtest::error::LoadTestError;
use crate::loadtest::metrics::QueryOutcome;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Latency buckets in seconds, from sub-millisecond lookups to stalled queries.
const DURATION_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Registry plus the handful of collectors a load test updates.
pub struct PrometheusExporter {
    registry: Registry,
    queries_total: IntCounterVec,
    errors_total: IntCounterVec,
    query_duration: HistogramVec,
    active_users: IntGauge,
    active_connections: IntGauge,
}

impl PrometheusExporter {
    /// Create and register all collectors.
    pub fn new() -> Result<Self, LoadTestError> {
        let registry = Registry::new();

        let queries_total = IntCounterVec::new(
            Opts::new("sqlload_queries_total", "Queries executed, by outcome"),
            &["query", "status"],
        )
        .map_err(exporter_error)?;
        let errors_total = IntCounterVec::new(
            Opts::new("sqlload_errors_total", "Failed query executions"),
            &["query"],
        )
        .map_err(exporter_error)?;
        let query_duration = HistogramVec::new(
            HistogramOpts::new(
                "sqlload_query_duration_seconds",
                "Query execution latency in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["query"],
        )
        .map_err(exporter_error)?;
        let active_users = IntGauge::new("sqlload_active_users", "Workers currently running")
            .map_err(exporter_error)?;
        let active_connections = IntGauge::new(
            "sqlload_active_connections",
            "Database sessions currently open",
        )
        .map_err(exporter_error)?;

        registry
            .register(Box::new(queries_total.clone()))
            .map_err(exporter_error)?;
        registry
            .register(Box::new(errors_total.clone()))
            .map_err(exporter_error)?;
        registry
            .register(Box::new(query_duration.clone()))
            .map_err(exporter_error)?;
        registry
            .register(Box::new(active_users.clone()))
            .map_err(exporter_error)?;
        registry
            .register(Box::new(active_connections.clone()))
            .map_err(exporter_error)?;

        Ok(Self {
            registry,
            queries_total,
            errors_total,
            query_duration,
            active_users,
            active_connections,
        })
    }

    /// Mirror a single outcome.
    pub fn observe(&self, outcome: &QueryOutcome) {
        let status = if outcome.success { "success" } else { "error" };
        self.queries_total
            .with_label_values(&[outcome.query.as_str(), status])
            .inc();
        if !outcome.success {
            self.errors_total
                .with_label_values(&[outcome.query.as_str()])
                .inc();
        }
        self.query_duration
            .with_label_values(&[outcome.query.as_str()])
            .observe(outcome.duration.as_secs_f64());
    }

    pub fn set_active_users(&self, n: usize) {
        self.active_users.set(n as i64);
    }

    pub fn set_active_connections(&self, n: usize) {
        self.active_connections.set(n as i64);
    }

    /// Encode the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, LoadTestError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(exporter_error)?;
        String::from_utf8(buffer).map_err(|e| LoadTestError::Exporter {
            message: e.to_string(),
        })
    }
}

fn exporter_error(err: impl std::fmt::Display) -> LoadTestError {
    LoadTestError::Exporter {
        message: err.to_string(),
    }
}

async fn metrics_handler(State(exporter): State<Arc<PrometheusExporter>>) -> Response {
    match exporter.render() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {e}"),
        )
            .into_response(),
    }
}

/// Build the scrape router serving `path`.
pub fn router(exporter: Arc<PrometheusExporter>, path: &str) -> Router {
    Router::new()
        .route(path, get(metrics_handler))
        .with_state(exporter)
}

/// Serve the exporter on `addr` until `cancel` fires.
pub async fn serve(
    exporter: Arc<PrometheusExporter>,
    addr: SocketAddr,
    path: &str,
    cancel: CancellationToken,
) -> Result<(), LoadTestError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(exporter_error)?;
    tracing::info!(%addr, path, "Serving Prometheus metrics");

    axum::serve(listener, router(exporter, path))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(exporter_error)
}
