//! sqlload: weighted, scalable load generation for SQL databases.
//!
//! The [`loadtest`] module holds the engine: TOML configuration, the query
//! catalog, per-worker database sessions, the orchestrator that ramps and
//! scales the worker population, and metrics aggregation with JSON and
//! Prometheus output.

pub mod loadtest;
