//! TOML-based load test configuration.
//!
//! Defines typed structs for parsing load test definitions from TOML config
//! files: the target database and its pool settings, the weighted query
//! catalog, an optional scaling plan and the metrics sinks.
//!
//! # Example TOML
//!
//! ```toml
//! [database]
//! type = "postgres"
//! host = "db.internal"
//! username = "bench"
//! password = "secret"
//! database = "shop"
//!
//! [test]
//! duration_secs = 300
//! concurrent_users = 10
//! ramp_up_secs = 30
//! think_time_ms = 1000
//!
//! [[test.queries]]
//! name = "recent_orders"
//! sql = "SELECT * FROM orders ORDER BY created_at DESC LIMIT 50"
//! weight = 8
//! type = "select"
//!
//! [[test.queries]]
//! name = "touch_session"
//! sql = "UPDATE sessions SET seen_at = now() WHERE id = $1"
//! weight = 2
//! type = "update"
//! params = [17]
//!
//! [scaling]
//! enabled = true
//!
//! [[scaling.steps]]
//! at_secs = 120
//! target_users = 25
//! ramp_secs = 20
//! description = "lunch peak"
//!
//! [metrics]
//! output_file = "metrics.json"
//! ```
//!
//! Every section except `[test]` may be omitted, in which case defaults
//! apply. The database URL can also be supplied via `--database-url` or the
//! `DATABASE_URL` environment variable.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::loadtest::catalog::{validate_definitions, QueryDefinition};
use crate::loadtest::error::LoadTestError;
use crate::loadtest::plan::{
    ScalingPlan, ScalingStep, TestPlan, WorkerSettings, DEFAULT_JITTER, DEFAULT_ROW_CAP,
};

/// Top-level load test configuration parsed from a TOML file.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoadTestConfig {
    /// Target database and connection pool settings.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Run parameters and the weighted query catalog.
    pub test: TestSettings,
    /// Timed changes of the worker population.
    #[serde(default)]
    pub scaling: ScalingConfig,
    /// Snapshot file, error log and Prometheus exporter.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Supported database engines.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    #[serde(alias = "postgresql")]
    Postgres,
    Mysql,
    Sqlite,
}

impl DatabaseKind {
    /// Well-known port used when `port` is not set.
    pub fn default_port(self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::Mysql => 3306,
            Self::Sqlite => 0,
        }
    }

    /// Scheme used in connection URLs for this engine.
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }
}

/// Database connection parameters.
///
/// Pool settings are passed through to the driver untouched; the engine
/// applies no sizing logic of its own.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub kind: DatabaseKind,
    /// Full connection URL. When set, the component fields below are ignored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub host: String,
    /// Defaults to the engine's well-known port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Database name, or the file path for sqlite.
    pub database: String,
    pub ssl_mode: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime_secs: u64,
    pub conn_max_idle_time_secs: u64,
    /// Deadline for every query a worker issues.
    pub query_timeout_ms: u64,
    /// Deadline for the post-connect `SELECT 1`.
    pub health_check_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: DatabaseKind::Postgres,
            url: None,
            host: "localhost".to_string(),
            port: None,
            username: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            ssl_mode: "disable".to_string(),
            max_open_conns: 100,
            max_idle_conns: 10,
            conn_max_lifetime_secs: 3600,
            conn_max_idle_time_secs: 600,
            query_timeout_ms: 30_000,
            health_check_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    /// Port to connect to, falling back to the engine default.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.kind.default_port())
    }

    /// Build the connection URL handed to `sqlx`.
    ///
    /// Credentials are percent-encoded. For sqlite the `database` field is
    /// treated as a file path (`:memory:` selects an in-memory database).
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        match self.kind {
            DatabaseKind::Sqlite => {
                if self.database == ":memory:" {
                    "sqlite::memory:".to_string()
                } else {
                    format!("sqlite://{}?mode=rwc", self.database)
                }
            },
            DatabaseKind::Postgres => format!(
                "postgres://{}@{}:{}/{}?sslmode={}",
                self.credentials(),
                self.host,
                self.effective_port(),
                self.database,
                self.ssl_mode
            ),
            DatabaseKind::Mysql => format!(
                "mysql://{}@{}:{}/{}?ssl-mode={}",
                self.credentials(),
                self.host,
                self.effective_port(),
                self.database,
                mysql_ssl_mode(&self.ssl_mode)
            ),
        }
    }

    /// Connection target without credentials, safe to log.
    pub fn display_target(&self) -> String {
        match (&self.url, self.kind) {
            (Some(url), _) => redact_url(url),
            (None, DatabaseKind::Sqlite) => format!("sqlite://{}", self.database),
            (None, kind) => format!(
                "{}://{}:{}/{}",
                kind.scheme(),
                self.host,
                self.effective_port(),
                self.database
            ),
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    fn credentials(&self) -> String {
        let user = urlencoding::encode(&self.username);
        if self.password.is_empty() {
            user.into_owned()
        } else {
            format!("{}:{}", user, urlencoding::encode(&self.password))
        }
    }
}

/// Map libpq-style `sslmode` values onto the MySQL driver's spelling.
fn mysql_ssl_mode(mode: &str) -> &str {
    match mode {
        "disable" => "disabled",
        "prefer" => "preferred",
        "require" => "required",
        "verify-ca" => "verify_ca",
        "verify-full" => "verify_identity",
        other => other,
    }
}

/// Strip the userinfo part from a connection URL.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        },
        _ => url.to_string(),
    }
}

/// Run parameters and the weighted query catalog.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TestSettings {
    /// Steady-state run time in seconds, counted after ramp-up.
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    /// Initial worker population.
    #[serde(default = "default_concurrent_users")]
    pub concurrent_users: u32,
    /// Window over which the initial workers are started. `0` starts them all at once.
    #[serde(default = "default_ramp_up_secs")]
    pub ramp_up_secs: u64,
    /// Base pause between two executions of one worker.
    #[serde(default = "default_think_time_ms")]
    pub think_time_ms: u64,
    /// `[min, max]` multiplier applied to the think time on every iteration.
    #[serde(default = "default_think_time_jitter")]
    pub think_time_jitter: [f64; 2],
    /// Rows counted per `select` execution before the cursor is dropped.
    #[serde(default = "default_max_rows_counted")]
    pub max_rows_counted: u64,
    /// Weighted query catalog.
    #[serde(default)]
    pub queries: Vec<QueryDefinition>,
}

fn default_duration_secs() -> u64 {
    300
}

fn default_concurrent_users() -> u32 {
    10
}

fn default_ramp_up_secs() -> u64 {
    30
}

fn default_think_time_ms() -> u64 {
    1000
}

fn default_think_time_jitter() -> [f64; 2] {
    [DEFAULT_JITTER.0, DEFAULT_JITTER.1]
}

fn default_max_rows_counted() -> u64 {
    DEFAULT_ROW_CAP
}

/// Timed population changes, as written in TOML.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ScalingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub steps: Vec<ScalingStepConfig>,
}

/// One `[[scaling.steps]]` entry.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScalingStepConfig {
    /// Offset from test start, in seconds.
    pub at_secs: u64,
    /// Worker count to reach.
    pub target_users: u32,
    /// Window over which the change is staggered, in seconds.
    #[serde(default)]
    pub ramp_secs: u64,
    #[serde(default)]
    pub description: String,
}

/// Metrics sinks.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enables the periodic JSON snapshot.
    pub enabled: bool,
    /// Seconds between two snapshot flushes.
    pub interval_secs: u64,
    /// Snapshot destination, overwritten on every flush.
    pub output_file: PathBuf,
    /// Optional JSON-lines log of failed queries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_log_file: Option<PathBuf>,
    pub prometheus: PrometheusConfig,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            output_file: PathBuf::from("metrics.json"),
            error_log_file: None,
            prometheus: PrometheusConfig::default(),
        }
    }
}

impl MetricsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Pull endpoint for Prometheus scrapes.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PrometheusConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8080,
            path: "/metrics".to_string(),
        }
    }
}

impl LoadTestConfig {
    /// Parse a TOML string into a validated [`LoadTestConfig`].
    ///
    /// Returns an error if the TOML is malformed or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, LoadTestError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a [`LoadTestConfig`] from a file path.
    ///
    /// Returns [`LoadTestError::ConfigIo`] if the file cannot be read,
    /// [`LoadTestError::ConfigParse`] if the TOML is malformed, or
    /// [`LoadTestError::ConfigValidation`] if validation fails.
    pub fn load(path: &Path) -> Result<Self, LoadTestError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadTestError::ConfigIo {
            source,
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Returns `true` if a scaling plan will run.
    pub fn has_scaling(&self) -> bool {
        self.scaling.enabled && !self.scaling.steps.is_empty()
    }

    /// Validate that the config is semantically correct.
    ///
    /// Checks:
    /// - `duration_secs > 0` and `concurrent_users > 0`
    /// - The query catalog is non-empty, with named, non-empty, positively
    ///   weighted and uniquely named entries
    /// - `0 < jitter_min <= jitter_max`, `max_rows_counted > 0`
    /// - Pool limits and timeouts are positive and consistent
    /// - Metrics interval and Prometheus path are usable
    /// - An enabled scaling plan has steps in non-decreasing time order
    pub fn validate(&self) -> Result<(), LoadTestError> {
        let test = &self.test;
        if test.duration_secs == 0 {
            return invalid("test.duration_secs must be greater than 0");
        }
        if test.concurrent_users == 0 {
            return invalid("test.concurrent_users must be greater than 0");
        }

        validate_definitions(&test.queries)?;

        let [jitter_min, jitter_max] = test.think_time_jitter;
        if !(jitter_min > 0.0 && jitter_min <= jitter_max && jitter_max.is_finite()) {
            return invalid(format!(
                "test.think_time_jitter must satisfy 0 < min <= max, got [{jitter_min}, {jitter_max}]"
            ));
        }
        if test.max_rows_counted == 0 {
            return invalid("test.max_rows_counted must be greater than 0");
        }

        let db = &self.database;
        if db.max_open_conns == 0 {
            return invalid("database.max_open_conns must be greater than 0");
        }
        if db.max_idle_conns > db.max_open_conns {
            return invalid(format!(
                "database.max_idle_conns ({}) cannot exceed max_open_conns ({})",
                db.max_idle_conns, db.max_open_conns
            ));
        }
        if db.query_timeout_ms == 0 || db.health_check_timeout_ms == 0 {
            return invalid("database timeouts must be greater than 0");
        }

        if self.metrics.enabled && self.metrics.interval_secs == 0 {
            return invalid("metrics.interval_secs must be greater than 0");
        }
        if self.metrics.prometheus.enabled && !self.metrics.prometheus.path.starts_with('/') {
            return invalid(format!(
                "metrics.prometheus.path must start with '/', got '{}'",
                self.metrics.prometheus.path
            ));
        }

        if self.scaling.enabled {
            if self.scaling.steps.is_empty() {
                return invalid("scaling.enabled is true but no [[scaling.steps]] are defined");
            }
            let mut last_offset = 0;
            for (i, step) in self.scaling.steps.iter().enumerate() {
                if step.target_users == 0 {
                    return invalid(format!(
                        "Scaling step {} has target_users=0; use a positive target",
                        i + 1
                    ));
                }
                if step.at_secs < last_offset {
                    return invalid(format!(
                        "Scaling step {} fires at {}s, before the previous step ({}s)",
                        i + 1,
                        step.at_secs,
                        last_offset
                    ));
                }
                last_offset = step.at_secs;
            }
        }

        Ok(())
    }

    /// Resolve the TOML units into the [`TestPlan`] the orchestrator runs.
    pub fn to_plan(&self) -> TestPlan {
        let test = &self.test;
        let scaling = ScalingPlan {
            enabled: self.scaling.enabled,
            steps: self
                .scaling
                .steps
                .iter()
                .map(|s| ScalingStep {
                    at: Duration::from_secs(s.at_secs),
                    target: s.target_users as usize,
                    ramp: Duration::from_secs(s.ramp_secs),
                    description: s.description.clone(),
                })
                .collect(),
        };

        TestPlan {
            duration: Duration::from_secs(test.duration_secs),
            concurrent_users: test.concurrent_users as usize,
            ramp_up: Duration::from_secs(test.ramp_up_secs),
            worker: WorkerSettings {
                think_time: Duration::from_millis(test.think_time_ms),
                jitter_min: test.think_time_jitter[0],
                jitter_max: test.think_time_jitter[1],
                row_cap: test.max_rows_counted,
                query_timeout: self.database.query_timeout(),
            },
            scaling,
        }
    }
}

fn invalid(message: impl Into<String>) -> Result<(), LoadTestError> {
    Err(LoadTestError::ConfigValidation {
        message: message.into(),
    })
}
