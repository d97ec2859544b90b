//! Weighted query catalog.
//!
//! A [`QueryCatalog`] is built once per run from the configured query list
//! and shared read-only by every worker. Selection is a linear walk over the
//! cumulative weights, which is plenty for catalogs of a few dozen entries.

use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::loadtest::error::LoadTestError;

/// How a statement is executed and how its row count is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    /// Row-returning; rows are counted up to the configured cap.
    Select,
    /// Non-row-returning; reports rows affected.
    Insert,
    /// Non-row-returning; reports rows affected.
    Update,
    /// Non-row-returning; reports rows affected.
    Delete,
    /// Tries a row-returning execution, falls back to a plain execute.
    #[default]
    Generic,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Generic => "generic",
        };
        f.write_str(s)
    }
}

/// A positional bind parameter.
///
/// TOML integers, floats, booleans and strings map onto the matching variant.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum QueryParam {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

/// One weighted statement in the catalog.
///
/// Deserialized straight from `[[test.queries]]` tables:
///
/// ```toml
/// [[test.queries]]
/// name = "top_products"
/// sql = "SELECT * FROM products ORDER BY sold DESC LIMIT ?"
/// weight = 3
/// type = "select"
/// params = [20]
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QueryDefinition {
    /// Unique name, used as the metrics key.
    pub name: String,
    /// Statement text passed to the driver unchanged.
    pub sql: String,
    /// Relative selection weight. Must be positive.
    pub weight: u32,
    #[serde(rename = "type", default)]
    pub kind: QueryKind,
    /// Values bound to the statement placeholders, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<QueryParam>,
}

impl QueryDefinition {
    /// Build a definition with no bind parameters.
    pub fn new(name: impl Into<String>, sql: impl Into<String>, weight: u32, kind: QueryKind) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            weight,
            kind,
            params: Vec::new(),
        }
    }
}

/// Immutable, weighted set of [`QueryDefinition`]s.
#[derive(Debug, Clone)]
pub struct QueryCatalog {
    queries: Vec<QueryDefinition>,
    total_weight: u64,
}

impl QueryCatalog {
    /// Build a catalog, rejecting definitions that could never be selected
    /// or that would collide in metrics.
    pub fn new(queries: Vec<QueryDefinition>) -> Result<Self, LoadTestError> {
        validate_definitions(&queries)?;
        let total_weight = queries.iter().map(|q| u64::from(q.weight)).sum();
        Ok(Self {
            queries,
            total_weight,
        })
    }

    /// Pick a definition with probability `weight / total_weight`.
    pub fn select<R: RngExt>(&self, rng: &mut R) -> &QueryDefinition {
        if self.queries.len() == 1 {
            return &self.queries[0];
        }

        let draw = rng.random_range(0..self.total_weight);
        let mut cumulative = 0u64;
        for query in &self.queries {
            cumulative += u64::from(query.weight);
            if draw < cumulative {
                return query;
            }
        }

        // Unreachable while total_weight is the exact sum of the weights.
        &self.queries[0]
    }

    /// Sum of all weights. Always greater than zero.
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// Always `false`: an empty catalog cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn queries(&self) -> &[QueryDefinition] {
        &self.queries
    }
}

/// Snapshot key holding the active-user gauge; cannot double as a query name.
const RESERVED_NAME: &str = "active_users";

/// Check the invariants every catalog must hold.
///
/// Shared by [`QueryCatalog::new`] and config validation so both report the
/// same messages.
pub fn validate_definitions(queries: &[QueryDefinition]) -> Result<(), LoadTestError> {
    if queries.is_empty() {
        return Err(LoadTestError::ConfigValidation {
            message: "Config must contain at least one [[test.queries]] entry".to_string(),
        });
    }

    let mut seen = HashSet::new();
    for (i, query) in queries.iter().enumerate() {
        if query.name.trim().is_empty() {
            return Err(LoadTestError::ConfigValidation {
                message: format!("Query {} has an empty name", i + 1),
            });
        }
        if query.name == RESERVED_NAME {
            return Err(LoadTestError::ConfigValidation {
                message: format!("Query name '{RESERVED_NAME}' is reserved by the snapshot format"),
            });
        }
        if query.sql.trim().is_empty() {
            return Err(LoadTestError::ConfigValidation {
                message: format!("Query '{}' has an empty sql statement", query.name),
            });
        }
        if query.weight == 0 {
            return Err(LoadTestError::ConfigValidation {
                message: format!("Query '{}' has weight=0; weights must be positive", query.name),
            });
        }
        if !seen.insert(query.name.as_str()) {
            return Err(LoadTestError::ConfigValidation {
                message: format!("Duplicate query name '{}'", query.name),
            });
        }
    }
    Ok(())
}
