//! Load testing engine for SQL databases.
//!
//! Provides typed TOML configuration, a weighted query catalog, one database
//! session per worker, a scaling orchestrator and aggregated metrics with
//! JSON snapshots and a Prometheus endpoint.

pub mod catalog;
pub mod config;
pub mod error;
pub mod error_log;
pub mod exporter;
pub mod metrics;
pub mod orchestrator;
pub mod plan;
pub mod session;
pub mod summary;
pub mod worker;
