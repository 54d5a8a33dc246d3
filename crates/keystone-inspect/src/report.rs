//! Builds the inspection report for a database location.

use keystone_db::{
    chunk_capacity, count_placeholders, read_rows_by_ids, with_connection, BatchLimits,
    DatabaseContext, DbError, FromRow,
};
use rusqlite::types::{ToSql, Value};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Number;
use thiserror::Error;

use crate::config::{Config, LookupConfig};

/// Errors that can occur while inspecting a database.
#[derive(Debug, Error)]
pub enum InspectError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// A database operation failed.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The report could not be serialized.
    #[error("failed to serialize report: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A configured key or parameter has no SQL equivalent.
    #[error("unsupported value in lookup configuration: {0}")]
    UnsupportedValue(String),
}

/// Everything `keystone-inspect` prints.
#[derive(Debug, Serialize)]
pub struct Report {
    /// Location the context was opened with.
    pub location: String,
    /// `sqlite_version()` of the linked engine.
    pub engine_version: String,
    /// Statement size limits read from a pooled connection.
    pub limits: LimitsReport,
    /// Pool occupancy after the report was gathered.
    pub pool: PoolReport,
    /// Result of the configured lookup, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lookup: Option<LookupReport>,
}

/// Engine limits relevant to batching.
#[derive(Debug, Serialize)]
pub struct LimitsReport {
    /// Maximum bound parameters per statement.
    pub max_params: usize,
    /// Maximum `OR` terms per statement.
    pub max_terms: usize,
}

/// Pool occupancy.
#[derive(Debug, Serialize)]
pub struct PoolReport {
    /// Open connections waiting to be reused.
    pub idle: usize,
    /// Connections held by callers.
    pub checked_out: usize,
    /// Maximum number of open connections.
    pub capacity: usize,
    /// Whether the context was closed.
    pub closed: bool,
}

/// Outcome of a configured batched lookup.
#[derive(Debug, Serialize)]
pub struct LookupReport {
    /// Number of keys looked up.
    pub keys: usize,
    /// Keys bound per statement.
    pub chunk_size: usize,
    /// Rows returned, one JSON array per row.
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// A result row kept as loosely typed JSON values.
struct JsonRow(Vec<serde_json::Value>);

impl FromRow for JsonRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let columns = row.as_ref().column_count();
        let mut values = Vec::with_capacity(columns);
        for index in 0..columns {
            values.push(sql_to_json(row.get::<usize, Value>(index)?));
        }
        Ok(Self(values))
    }
}

/// Opens the configured database and gathers the report.
///
/// # Errors
///
/// Returns `InspectError::Db` if the database cannot be opened or queried,
/// and `InspectError::UnsupportedValue` if the configured lookup holds
/// values with no SQL equivalent.
pub fn inspect(config: &Config) -> Result<Report, InspectError> {
    let ctx = DatabaseContext::open(&config.database.path, config.database.runtime_settings())?;

    let (engine_version, limits, lookup) =
        with_connection(&ctx, |conn| -> Result<_, InspectError> {
            let version: String = conn
                .query_row("SELECT sqlite_version()", [], |row| row.get(0))
                .map_err(DbError::from)?;
            let limits = BatchLimits::for_connection(conn);
            let lookup = config
                .inspect
                .lookup
                .as_ref()
                .map(|lookup| run_lookup(conn, limits, lookup))
                .transpose()?;
            Ok((version, limits, lookup))
        })?;

    let status = ctx.status();
    let report = Report {
        location: ctx.location().to_string(),
        engine_version,
        limits: LimitsReport {
            max_params: limits.max_params,
            max_terms: limits.max_terms,
        },
        pool: PoolReport {
            idle: status.idle,
            checked_out: status.checked_out,
            capacity: status.capacity,
            closed: status.closed,
        },
        lookup,
    };

    ctx.close();
    Ok(report)
}

fn run_lookup(
    conn: &Connection,
    limits: BatchLimits,
    lookup: &LookupConfig,
) -> Result<LookupReport, InspectError> {
    let keys = lookup
        .keys
        .iter()
        .map(|key| key.iter().map(json_to_sql).collect::<Result<Vec<_>, _>>())
        .collect::<Result<Vec<Vec<Value>>, _>>()?;
    let static_values = lookup
        .static_params
        .iter()
        .map(json_to_sql)
        .collect::<Result<Vec<_>, _>>()?;
    let static_params: Vec<&dyn ToSql> = static_values.iter().map(|v| v as &dyn ToSql).collect();

    let chunk_size = if keys.is_empty() {
        0
    } else {
        chunk_capacity(
            static_params.len(),
            count_placeholders(&lookup.per_id_filter)?,
            limits,
        )?
    };

    let rows: Vec<JsonRow> = read_rows_by_ids(
        conn,
        &lookup.base_query,
        &lookup.per_id_filter,
        &static_params,
        &keys,
        lookup.static_filter.as_deref(),
    )?;

    tracing::info!(
        keys = keys.len(),
        chunk_size,
        rows = rows.len(),
        "configured lookup complete"
    );

    Ok(LookupReport {
        keys: keys.len(),
        chunk_size,
        rows: rows.into_iter().map(|JsonRow(values)| values).collect(),
    })
}

fn json_to_sql(value: &serde_json::Value) -> Result<Value, InspectError> {
    match value {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Integer(i64::from(*b))),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Real(f))
            } else {
                Err(InspectError::UnsupportedValue(n.to_string()))
            }
        }
        serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
        other => Err(InspectError::UnsupportedValue(other.to_string())),
    }
}

fn sql_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::from(i),
        Value::Real(f) => {
            Number::from_f64(f).map_or(serde_json::Value::Null, serde_json::Value::Number)
        }
        Value::Text(s) => serde_json::Value::String(s),
        Value::Blob(bytes) => serde_json::Value::from(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, InspectConfig};
    use serde_json::json;

    fn memory_config(lookup: Option<LookupConfig>) -> Config {
        Config {
            database: DatabaseConfig {
                path: DatabaseContext::unique_memory_uri(),
                ..DatabaseConfig::default()
            },
            inspect: InspectConfig { lookup },
            ..Config::default()
        }
    }

    #[test]
    fn reports_engine_limits_and_pool() {
        let report = inspect(&memory_config(None)).expect("inspect");

        assert!(!report.engine_version.is_empty());
        assert!(report.limits.max_params > 0);
        assert_eq!(report.pool.capacity, 8);
        assert_eq!(report.pool.checked_out, 0);
        assert!(!report.pool.closed);
        assert!(report.lookup.is_none());
    }

    #[test]
    fn runs_configured_lookup() {
        let lookup = LookupConfig {
            base_query: "SELECT * FROM (SELECT 1 AS id, 20 AS field1, 11 AS field2, 'first' AS name \
                         UNION ALL SELECT 2, 30, 11, 'second')"
                .to_string(),
            per_id_filter: "field1=? AND field2=?".to_string(),
            static_filter: Some("field1<?".to_string()),
            static_params: vec![json!(30)],
            keys: vec![vec![json!(20), json!(11)], vec![json!(30), json!(11)]],
        };

        let report = inspect(&memory_config(Some(lookup))).expect("inspect");
        let lookup = report.lookup.expect("lookup report");

        assert_eq!(lookup.keys, 2);
        assert!(lookup.chunk_size >= 2);
        assert_eq!(lookup.rows, vec![vec![json!(1), json!(20), json!(11), json!("first")]]);
    }

    #[test]
    fn nested_values_are_rejected() {
        let lookup = LookupConfig {
            base_query: "SELECT 1".to_string(),
            per_id_filter: "x=?".to_string(),
            static_filter: None,
            static_params: Vec::new(),
            keys: vec![vec![json!({"nested": true})]],
        };

        let err = inspect(&memory_config(Some(lookup))).expect_err("object keys");
        assert!(matches!(err, InspectError::UnsupportedValue(_)));
    }

    #[test]
    fn values_convert_between_sql_and_json() {
        assert_eq!(json_to_sql(&json!(true)).expect("bool"), Value::Integer(1));
        assert_eq!(json_to_sql(&json!(1.5)).expect("real"), Value::Real(1.5));
        assert_eq!(sql_to_json(Value::Text("a".into())), json!("a"));
        assert_eq!(sql_to_json(Value::Blob(vec![1, 2])), json!([1, 2]));
    }
}
