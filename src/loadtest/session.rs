//! Database session seam between workers and the driver.
//!
//! Workers only see [`DatabaseSession`] and [`SessionFactory`]. The
//! production implementation, [`SqlxSessionFactory`], opens one `sqlx` pool
//! per worker for the configured engine. Tests plug in scripted sessions.
//!
//! Sessions do not apply deadlines themselves: the worker wraps every call
//! in the per-query timeout so that custom sessions get the same bound.

use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use sqlx::mysql::MySql;
use sqlx::pool::PoolOptions;
use sqlx::postgres::Postgres;
use sqlx::sqlite::Sqlite;
use sqlx::{Database, Pool};
use std::time::Duration;

use crate::loadtest::catalog::{QueryDefinition, QueryParam};
use crate::loadtest::config::{DatabaseConfig, DatabaseKind};
use crate::loadtest::error::DbError;

/// One worker's exclusive handle to the database.
#[async_trait]
pub trait DatabaseSession: Send {
    /// Run a row-returning statement and count rows, stopping at `cap`.
    async fn fetch_count(&mut self, query: &QueryDefinition, cap: u64) -> Result<u64, DbError>;

    /// Run a statement without reading rows. Returns rows affected.
    async fn execute(&mut self, query: &QueryDefinition) -> Result<u64, DbError>;

    /// Cheap liveness probe.
    async fn ping(&mut self) -> Result<(), DbError>;

    /// Release the underlying connections. Further calls fail with
    /// [`DbError::Closed`]; closing twice is a no-op.
    async fn close(&mut self);
}

/// Opens sessions for new workers.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, worker_id: usize) -> Result<Box<dyn DatabaseSession>, DbError>;
}

/// Ping `session`, failing with [`DbError::Timeout`] after `timeout`.
pub async fn health_check(
    session: &mut dyn DatabaseSession,
    timeout: Duration,
) -> Result<(), DbError> {
    match tokio::time::timeout(timeout, session.ping()).await {
        Ok(result) => result,
        Err(_) => Err(DbError::Timeout { after: timeout }),
    }
}

/// Pool parameters passed through to `sqlx` unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl PoolSettings {
    fn options<DB: Database>(&self) -> PoolOptions<DB> {
        PoolOptions::<DB>::new()
            .max_connections(self.max_connections)
            .min_connections(0)
            .max_lifetime(self.max_lifetime)
            .idle_timeout(self.idle_timeout)
            .acquire_timeout(self.acquire_timeout)
    }
}

/// A pool for whichever engine the URL points at.
#[derive(Debug, Clone)]
enum DriverPool {
    Postgres(Pool<Postgres>),
    MySql(Pool<MySql>),
    Sqlite(Pool<Sqlite>),
}

impl DriverPool {
    async fn close(&self) {
        match self {
            Self::Postgres(pool) => pool.close().await,
            Self::MySql(pool) => pool.close().await,
            Self::Sqlite(pool) => pool.close().await,
        }
    }
}

/// Build a `sqlx::query` for `$db` with every catalog parameter bound in order.
macro_rules! bound_query {
    ($db:ty, $query:expr) => {{
        let mut q = sqlx::query::<$db>(&$query.sql);
        for param in &$query.params {
            q = match param {
                QueryParam::Int(v) => q.bind(*v),
                QueryParam::Float(v) => q.bind(*v),
                QueryParam::Bool(v) => q.bind(*v),
                QueryParam::Text(v) => q.bind(v.clone()),
            };
        }
        q
    }};
}

async fn count_rows<S, R>(mut rows: S, cap: u64) -> Result<u64, DbError>
where
    S: Stream<Item = Result<R, sqlx::Error>> + Unpin,
{
    let mut count = 0;
    while count < cap {
        match rows.try_next().await.map_err(DbError::from_sqlx)? {
            Some(_) => count += 1,
            None => break,
        }
    }
    Ok(count)
}

/// [`DatabaseSession`] backed by a per-worker `sqlx` pool.
#[derive(Debug)]
pub struct SqlxSession {
    pool: DriverPool,
    closed: bool,
}

#[async_trait]
impl DatabaseSession for SqlxSession {
    async fn fetch_count(&mut self, query: &QueryDefinition, cap: u64) -> Result<u64, DbError> {
        if self.closed {
            return Err(DbError::Closed);
        }
        match &self.pool {
            DriverPool::Postgres(pool) => count_rows(bound_query!(Postgres, query).fetch(pool), cap).await,
            DriverPool::MySql(pool) => count_rows(bound_query!(MySql, query).fetch(pool), cap).await,
            DriverPool::Sqlite(pool) => count_rows(bound_query!(Sqlite, query).fetch(pool), cap).await,
        }
    }

    async fn execute(&mut self, query: &QueryDefinition) -> Result<u64, DbError> {
        if self.closed {
            return Err(DbError::Closed);
        }
        let affected = match &self.pool {
            DriverPool::Postgres(pool) => bound_query!(Postgres, query)
                .execute(pool)
                .await
                .map_err(DbError::from_sqlx)?
                .rows_affected(),
            DriverPool::MySql(pool) => bound_query!(MySql, query)
                .execute(pool)
                .await
                .map_err(DbError::from_sqlx)?
                .rows_affected(),
            DriverPool::Sqlite(pool) => bound_query!(Sqlite, query)
                .execute(pool)
                .await
                .map_err(DbError::from_sqlx)?
                .rows_affected(),
        };
        Ok(affected)
    }

    async fn ping(&mut self) -> Result<(), DbError> {
        if self.closed {
            return Err(DbError::Closed);
        }
        let result = match &self.pool {
            DriverPool::Postgres(pool) => sqlx::query("SELECT 1").execute(pool).await.map(drop),
            DriverPool::MySql(pool) => sqlx::query("SELECT 1").execute(pool).await.map(drop),
            DriverPool::Sqlite(pool) => sqlx::query("SELECT 1").execute(pool).await.map(drop),
        };
        result.map_err(|e| DbError::Connect {
            message: e.to_string(),
        })
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pool.close().await;
    }
}

/// Opens a [`SqlxSession`] per worker and health-checks it before handing it out.
#[derive(Debug, Clone)]
pub struct SqlxSessionFactory {
    kind: DatabaseKind,
    url: String,
    pool: PoolSettings,
    health_check_timeout: Duration,
}

impl SqlxSessionFactory {
    pub fn from_config(db: &DatabaseConfig) -> Self {
        let url = db.connection_url();
        Self {
            kind: kind_from_url(&url).unwrap_or(db.kind),
            url,
            pool: PoolSettings {
                max_connections: db.max_open_conns,
                max_lifetime: Duration::from_secs(db.conn_max_lifetime_secs),
                idle_timeout: Duration::from_secs(db.conn_max_idle_time_secs),
                acquire_timeout: db.query_timeout(),
            },
            health_check_timeout: db.health_check_timeout(),
        }
    }

    pub fn kind(&self) -> DatabaseKind {
        self.kind
    }

    pub fn pool_settings(&self) -> &PoolSettings {
        &self.pool
    }

    async fn open_pool(&self) -> Result<DriverPool, sqlx::Error> {
        Ok(match self.kind {
            DatabaseKind::Postgres => DriverPool::Postgres(self.pool.options().connect(&self.url).await?),
            DatabaseKind::Mysql => DriverPool::MySql(self.pool.options().connect(&self.url).await?),
            DatabaseKind::Sqlite => DriverPool::Sqlite(self.pool.options().connect(&self.url).await?),
        })
    }
}

#[async_trait]
impl SessionFactory for SqlxSessionFactory {
    async fn connect(&self, worker_id: usize) -> Result<Box<dyn DatabaseSession>, DbError> {
        let pool = match tokio::time::timeout(self.health_check_timeout, self.open_pool()).await {
            Ok(Ok(pool)) => pool,
            Ok(Err(e)) => {
                return Err(DbError::Connect {
                    message: e.to_string(),
                })
            },
            Err(_) => {
                return Err(DbError::Timeout {
                    after: self.health_check_timeout,
                })
            },
        };

        let mut session = SqlxSession {
            pool,
            closed: false,
        };
        if let Err(e) = health_check(&mut session, self.health_check_timeout).await {
            session.close().await;
            return Err(e);
        }

        tracing::debug!(worker_id, kind = ?self.kind, "Database session opened");
        Ok(Box::new(session))
    }
}

/// Infer the engine from a connection URL scheme.
fn kind_from_url(url: &str) -> Option<DatabaseKind> {
    let scheme = url.split(':').next()?;
    match scheme {
        "postgres" | "postgresql" => Some(DatabaseKind::Postgres),
        "mysql" | "mariadb" => Some(DatabaseKind::Mysql),
        "sqlite" => Some(DatabaseKind::Sqlite),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::catalog::QueryKind;

    fn memory_db() -> DatabaseConfig {
        DatabaseConfig {
            kind: DatabaseKind::Sqlite,
            database: ":memory:".to_string(),
            max_open_conns: 1,
            max_idle_conns: 1,
            ..DatabaseConfig::default()
        }
    }

    fn stmt(sql: &str, kind: QueryKind) -> QueryDefinition {
        QueryDefinition::new("t", sql, 1, kind)
    }

    #[test]
    fn test_kind_from_url() {
        assert_eq!(kind_from_url("postgresql://h/db"), Some(DatabaseKind::Postgres));
        assert_eq!(kind_from_url("mariadb://h/db"), Some(DatabaseKind::Mysql));
        assert_eq!(kind_from_url("sqlite::memory:"), Some(DatabaseKind::Sqlite));
        assert_eq!(kind_from_url("mssql://h/db"), None);
    }

    #[test]
    fn test_factory_passes_pool_settings_through() {
        let db = DatabaseConfig {
            max_open_conns: 42,
            conn_max_lifetime_secs: 90,
            conn_max_idle_time_secs: 30,
            query_timeout_ms: 2500,
            ..DatabaseConfig::default()
        };
        let factory = SqlxSessionFactory::from_config(&db);
        assert_eq!(
            factory.pool_settings(),
            &PoolSettings {
                max_connections: 42,
                max_lifetime: Duration::from_secs(90),
                idle_timeout: Duration::from_secs(30),
                acquire_timeout: Duration::from_millis(2500),
            }
        );
    }

    #[test]
    fn test_factory_prefers_url_scheme() {
        let db = DatabaseConfig {
            kind: DatabaseKind::Postgres,
            url: Some("mysql://root@localhost/app".to_string()),
            ..DatabaseConfig::default()
        };
        assert_eq!(SqlxSessionFactory::from_config(&db).kind(), DatabaseKind::Mysql);
    }

    #[tokio::test]
    async fn test_sqlite_session_counts_rows_up_to_cap() {
        let factory = SqlxSessionFactory::from_config(&memory_db());
        let mut session = factory.connect(0).await.unwrap();

        session
            .execute(&stmt("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)", QueryKind::Generic))
            .await
            .unwrap();
        for _ in 0..5 {
            let mut insert = stmt("INSERT INTO items (label) VALUES (?)", QueryKind::Insert);
            insert.params = vec![QueryParam::Text("x".to_string())];
            assert_eq!(session.execute(&insert).await.unwrap(), 1);
        }

        let select = stmt("SELECT * FROM items", QueryKind::Select);
        assert_eq!(session.fetch_count(&select, 1000).await.unwrap(), 5);
        assert_eq!(session.fetch_count(&select, 3).await.unwrap(), 3);

        let update = stmt("UPDATE items SET label = 'y' WHERE id <= 2", QueryKind::Update);
        assert_eq!(session.execute(&update).await.unwrap(), 2);

        session.close().await;
    }

    #[tokio::test]
    async fn test_sqlite_session_reports_query_errors() {
        let factory = SqlxSessionFactory::from_config(&memory_db());
        let mut session = factory.connect(1).await.unwrap();

        let err = session
            .fetch_count(&stmt("SELECT * FROM missing_table", QueryKind::Select), 10)
            .await
            .unwrap_err();
        assert_eq!(err.error_category(), "query");
        session.close().await;
    }

    #[tokio::test]
    async fn test_closed_session_rejects_calls_and_closes_once() {
        let factory = SqlxSessionFactory::from_config(&memory_db());
        let mut session = factory.connect(2).await.unwrap();
        session.close().await;
        session.close().await;

        let err = session.ping().await.unwrap_err();
        assert!(matches!(err, DbError::Closed));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let db = DatabaseConfig {
            kind: DatabaseKind::Sqlite,
            url: Some("sqlite:///nonexistent-dir/sub/db.sqlite?mode=ro".to_string()),
            ..DatabaseConfig::default()
        };
        let factory = SqlxSessionFactory::from_config(&db);
        let err = factory.connect(0).await.err().unwrap();
        assert!(matches!(err, DbError::Connect { .. } | DbError::Timeout { .. }));
    }
}
