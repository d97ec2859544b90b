//! Scripted sessions for driving the orchestrator without a database.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlload::loadtest::catalog::{QueryCatalog, QueryDefinition, QueryKind};
use sqlload::loadtest::error::DbError;
use sqlload::loadtest::session::{DatabaseSession, SessionFactory};

/// Counters shared between a [`ScriptedFactory`] and every session it opens.
#[derive(Debug, Default)]
pub struct SessionLedger {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    /// Every `close()` call, including repeats on an already closed session.
    pub close_calls: AtomicUsize,
    pub executions: AtomicUsize,
}

impl SessionLedger {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn open(&self) -> usize {
        self.connects() - self.closes()
    }
}

/// Opens [`ScriptedSession`]s that answer instantly (plus `latency`) and
/// fail every query whose name is in `failing`.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    pub ledger: Arc<SessionLedger>,
    pub failing: Arc<HashSet<String>>,
    pub latency: Duration,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, names: &[&str]) -> Self {
        self.failing = Arc::new(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn connect(&self, _worker_id: usize) -> Result<Box<dyn DatabaseSession>, DbError> {
        self.ledger.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            ledger: self.ledger.clone(),
            failing: self.failing.clone(),
            latency: self.latency,
            closed: false,
        }))
    }
}

pub struct ScriptedSession {
    ledger: Arc<SessionLedger>,
    failing: Arc<HashSet<String>>,
    latency: Duration,
    closed: bool,
}

impl ScriptedSession {
    async fn answer(&mut self, query: &QueryDefinition, rows: u64) -> Result<u64, DbError> {
        if self.closed {
            return Err(DbError::Closed);
        }
        self.ledger.executions.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing.contains(&query.name) {
            return Err(DbError::Query {
                message: format!("scripted failure for {}", query.name),
            });
        }
        Ok(rows)
    }
}

#[async_trait]
impl DatabaseSession for ScriptedSession {
    async fn fetch_count(&mut self, query: &QueryDefinition, cap: u64) -> Result<u64, DbError> {
        self.answer(query, 10.min(cap)).await
    }

    async fn execute(&mut self, query: &QueryDefinition) -> Result<u64, DbError> {
        self.answer(query, 1).await
    }

    async fn ping(&mut self) -> Result<(), DbError> {
        Ok(())
    }

    async fn close(&mut self) {
        self.ledger.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed {
            self.closed = true;
            self.ledger.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Catalog of `select` queries with the given names and weights.
pub fn catalog(entries: &[(&str, u32)]) -> QueryCatalog {
    QueryCatalog::new(
        entries
            .iter()
            .map(|(name, weight)| QueryDefinition::new(*name, "SELECT 1", *weight, QueryKind::Select))
            .collect(),
    )
    .expect("test catalog is valid")
}
