//! Error types for the load testing engine.
//!
//! Defines [`LoadTestError`] for configuration, startup and reporting errors,
//! and [`DbError`] for database failures encountered by a single session.

use std::time::Duration;

/// Errors that stop a load test or prevent it from starting.
#[derive(Debug, thiserror::Error)]
pub enum LoadTestError {
    /// TOML parse failure -- the config file contains invalid TOML syntax
    /// or does not match the expected schema.
    #[error("Failed to parse config TOML: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },

    /// Semantic validation failure -- the config parsed successfully but
    /// contains invalid values (e.g., empty catalog, zero weight).
    #[error("Config validation error: {message}")]
    ConfigValidation { message: String },

    /// File I/O failure -- the config file could not be read from disk.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigIo {
        source: std::io::Error,
        path: String,
    },

    /// A worker could not open its database session. Aborts the startup
    /// sequence that tried to add the worker.
    #[error("Worker {worker_id} failed to connect: {source}")]
    Connection { worker_id: usize, source: DbError },

    /// The operation was aborted by the shared cancellation token.
    #[error("Load test cancelled")]
    Cancelled,

    /// Writing a metrics snapshot failed.
    #[error("Failed to write metrics to '{path}': {source}")]
    MetricsIo {
        source: std::io::Error,
        path: String,
    },

    /// The Prometheus exporter could not be registered or served.
    #[error("Metrics exporter error: {message}")]
    Exporter { message: String },
}

impl LoadTestError {
    /// Returns `true` when the error is the normal cancellation outcome
    /// rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Database errors raised by a [`DatabaseSession`](crate::loadtest::session::DatabaseSession).
///
/// Query-level variants are recorded as failed outcomes and never stop a worker.
#[derive(Debug, thiserror::Error, Clone)]
pub enum DbError {
    /// The call exceeded the per-query (or health check) deadline.
    #[error("Database call timed out after {}ms", after.as_millis())]
    Timeout { after: Duration },

    /// The statement was rejected or failed while executing.
    #[error("Query failed: {message}")]
    Query { message: String },

    /// The session could not be established or the health check failed.
    #[error("Connection failed: {message}")]
    Connect { message: String },

    /// The session was already closed.
    #[error("Session is closed")]
    Closed,
}

impl DbError {
    /// Returns a short category string for metrics and error-log grouping.
    ///
    /// Categories: `"timeout"`, `"query"`, `"connect"`, `"closed"`.
    pub fn error_category(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Query { .. } => "query",
            Self::Connect { .. } => "connect",
            Self::Closed => "closed",
        }
    }

    /// Classify a `sqlx` error into a [`DbError`].
    ///
    /// Pool and I/O level failures become [`DbError::Connect`]; everything
    /// else (syntax errors, constraint violations, decode failures) is a
    /// [`DbError::Query`].
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::Configuration(_) => Self::Connect {
                message: err.to_string(),
            },
            sqlx::Error::PoolClosed => Self::Closed,
            other => Self::Query {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_timeout() {
        let err = DbError::Timeout {
            after: Duration::from_millis(250),
        };
        assert_eq!(err.error_category(), "timeout");
        assert_eq!(err.to_string(), "Database call timed out after 250ms");
    }

    #[test]
    fn test_error_category_query() {
        let err = DbError::Query {
            message: "syntax error at or near \"SELEC\"".to_string(),
        };
        assert_eq!(err.error_category(), "query");
    }

    #[test]
    fn test_error_category_connect_and_closed() {
        let err = DbError::Connect {
            message: "connection refused".to_string(),
        };
        assert_eq!(err.error_category(), "connect");
        assert_eq!(DbError::Closed.error_category(), "closed");
    }

    #[test]
    fn test_from_sqlx_pool_timeout_is_connect() {
        let err = DbError::from_sqlx(sqlx::Error::PoolTimedOut);
        assert_eq!(err.error_category(), "connect");
    }

    #[test]
    fn test_from_sqlx_pool_closed() {
        let err = DbError::from_sqlx(sqlx::Error::PoolClosed);
        assert!(matches!(err, DbError::Closed));
    }

    #[test]
    fn test_from_sqlx_row_not_found_is_query() {
        let err = DbError::from_sqlx(sqlx::Error::RowNotFound);
        assert_eq!(err.error_category(), "query");
    }

    #[test]
    fn test_connection_error_display() {
        let err = LoadTestError::Connection {
            worker_id: 3,
            source: DbError::Connect {
                message: "refused".to_string(),
            },
        };
        assert_eq!(
            err.to_string(),
            "Worker 3 failed to connect: Connection failed: refused"
        );
        assert!(!err.is_cancelled());
        assert!(LoadTestError::Cancelled.is_cancelled());
    }
}
