//! Batched reads and writes keyed by large id sets.
//!
//! SQLite caps the number of bound parameters per statement, and the depth
//! of the expression tree a `WHERE` clause may build. The helpers here split
//! an id set into consecutive chunks that fit both limits, run one statement
//! per chunk, and concatenate the results in chunk order. Rows within a chunk
//! keep the order the engine returned them in.
//!
//! A failure in any chunk aborts the whole call; rows already fetched from
//! earlier chunks are discarded. Chunks are not wrapped in a transaction, so a
//! concurrent writer can change rows between chunk executions.

use rusqlite::limits::Limit;
use rusqlite::types::ToSql;
use rusqlite::Connection;

use crate::error::{DbError, Result};
use crate::row::{count_placeholders, CompositeKey, FromRow};

/// Marker replaced with the `?` list in id templates.
const ID_LIST_MARKER: &str = "{}";

/// Engine limits that bound the size of one composed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Maximum bound parameters per statement.
    pub max_params: usize,
    /// Maximum number of per-key terms joined with `OR` in one statement.
    pub max_terms: usize,
}

impl BatchLimits {
    /// Limits of a stock SQLite build before 3.32 (999 variables, expression
    /// depth 1000).
    pub const SQLITE_LEGACY: Self = Self {
        max_params: 999,
        max_terms: 500,
    };

    /// Reads the variable-number and expression-depth limits from `conn`.
    ///
    /// Each `OR` term adds at least two levels to the expression tree, so the
    /// term budget is half the depth limit. A depth limit of zero means the
    /// engine enforces none.
    pub fn for_connection(conn: &Connection) -> Self {
        let max_params = usize::try_from(conn.limit(Limit::SQLITE_LIMIT_VARIABLE_NUMBER))
            .unwrap_or(Self::SQLITE_LEGACY.max_params);
        let max_terms = match usize::try_from(conn.limit(Limit::SQLITE_LIMIT_EXPR_DEPTH)) {
            Ok(0) => usize::MAX,
            Ok(depth) => (depth / 2).max(1),
            Err(_) => Self::SQLITE_LEGACY.max_terms,
        };

        Self {
            max_params,
            max_terms,
        }
    }

    fn without_term_limit(self) -> Self {
        Self {
            max_terms: usize::MAX,
            ..self
        }
    }
}

/// Number of keys of `arity` values that fit in one statement next to
/// `static_params` fixed parameters.
///
/// # Errors
///
/// - `DbError::MalformedFilter` if `arity` is zero.
/// - `DbError::QueryTooLarge` if not even one key fits.
pub fn chunk_capacity(
    static_params: usize,
    arity: usize,
    limits: BatchLimits,
) -> Result<usize> {
    if arity == 0 {
        return Err(DbError::MalformedFilter(
            "per-id filter has no placeholders".to_string(),
        ));
    }

    let by_params = limits.max_params.saturating_sub(static_params) / arity;
    if by_params == 0 {
        return Err(DbError::QueryTooLarge {
            static_params,
            arity,
            max_params: limits.max_params,
        });
    }

    Ok(by_params.min(limits.max_terms.max(1)))
}

/// Builds the `WHERE` clause body for a chunk of `key_count` keys.
///
/// Produces `(<static>) AND ((<f>) OR (<f>) ...)`, or only the `OR` group
/// when there is no static filter.
pub fn compose_where(
    static_filter: Option<&str>,
    per_id_filter: &str,
    key_count: usize,
) -> String {
    let term = format!("({per_id_filter})");
    let terms = vec![term.as_str(); key_count].join(" OR ");

    match static_filter {
        Some(filter) => format!("({filter}) AND ({terms})"),
        None => terms,
    }
}

/// Reads every row matched by any of `ids`, subject to an optional static
/// filter, in as few statements as the connection's limits allow.
///
/// `base_query` is a `SELECT` without a `WHERE` clause whose columns line up
/// with `T`'s fields. `per_id_filter` is a boolean expression with one `?`
/// per key value, for example `"field1=? AND field2=?"`. `static_params`
/// bind to the placeholders of `static_filter` and are bound first in every
/// statement.
///
/// Results come back chunk by chunk in the order of `ids`, each chunk in
/// storage order. Keys that match nothing contribute nothing; keys that match
/// several rows contribute all of them.
///
/// # Errors
///
/// - `DbError::MalformedFilter` if a key's arity differs from the filter's
///   placeholder count, or the static filter and its parameters disagree.
/// - `DbError::QueryTooLarge` if one key cannot fit beside the static
///   parameters.
/// - `DbError::Sqlite` if any chunk fails.
pub fn read_rows_by_ids<T, K>(
    conn: &Connection,
    base_query: &str,
    per_id_filter: &str,
    static_params: &[&dyn ToSql],
    ids: &[K],
    static_filter: Option<&str>,
) -> Result<Vec<T>>
where
    T: FromRow,
    K: CompositeKey,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    read_rows_by_ids_with_limits(
        conn,
        BatchLimits::for_connection(conn),
        base_query,
        per_id_filter,
        static_params,
        ids,
        static_filter,
    )
}

/// [`read_rows_by_ids`] with explicit limits instead of the connection's.
pub fn read_rows_by_ids_with_limits<T, K>(
    conn: &Connection,
    limits: BatchLimits,
    base_query: &str,
    per_id_filter: &str,
    static_params: &[&dyn ToSql],
    ids: &[K],
    static_filter: Option<&str>,
) -> Result<Vec<T>>
where
    T: FromRow,
    K: CompositeKey,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    check_static_filter(static_filter, static_params)?;
    let arity = count_placeholders(per_id_filter)?;
    for (index, key) in ids.iter().enumerate() {
        if key.arity() != arity {
            return Err(DbError::MalformedFilter(format!(
                "key {index} has {} values but the per-id filter `{per_id_filter}` has {arity} placeholders",
                key.arity()
            )));
        }
    }

    let chunk_size = chunk_capacity(static_params.len(), arity, limits)?;
    let mut rows = Vec::new();
    let mut statements = 0;

    for chunk in ids.chunks(chunk_size) {
        let sql = format!(
            "{base_query} WHERE {}",
            compose_where(static_filter, per_id_filter, chunk.len())
        );

        let mut params: Vec<&dyn ToSql> =
            Vec::with_capacity(static_params.len() + arity * chunk.len());
        params.extend_from_slice(static_params);
        for key in chunk {
            key.bind_values(&mut params);
        }

        let mut stmt = conn.prepare_cached(&sql)?;
        let mapped = stmt.query_map(params.as_slice(), T::from_row)?;
        for row in mapped {
            rows.push(row?);
        }
        statements += 1;
    }

    tracing::debug!(
        keys = ids.len(),
        chunk_size,
        statements,
        rows = rows.len(),
        "batched read by composite keys"
    );
    Ok(rows)
}

/// Reads rows for a set of scalar ids.
///
/// `sql_template` contains exactly one `{}`, which is replaced by a
/// comma-separated `?` list, typically inside `IN ({})`. Placeholders for
/// `static_params` must come before the id list.
///
/// # Errors
///
/// - `DbError::MalformedFilter` if the template is malformed or disagrees
///   with `static_params`.
/// - `DbError::QueryTooLarge` if not even one id fits.
/// - `DbError::Sqlite` if any chunk fails.
pub fn read_rows_by_id<T, I>(
    conn: &Connection,
    sql_template: &str,
    static_params: &[&dyn ToSql],
    ids: &[I],
) -> Result<Vec<T>>
where
    T: FromRow,
    I: ToSql,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let chunk_size = id_chunk_size(conn, sql_template, static_params)?;
    let mut rows = Vec::new();

    for chunk in ids.chunks(chunk_size) {
        let sql = expand_id_template(sql_template, chunk.len());
        let params = bind_id_chunk(static_params, chunk);

        let mut stmt = conn.prepare_cached(&sql)?;
        let mapped = stmt.query_map(params.as_slice(), T::from_row)?;
        for row in mapped {
            rows.push(row?);
        }
    }

    tracing::debug!(
        ids = ids.len(),
        chunk_size,
        rows = rows.len(),
        "batched read by id"
    );
    Ok(rows)
}

/// Runs an `UPDATE` or `DELETE` for a set of scalar ids and returns the total
/// number of rows changed.
///
/// Templates follow the same rules as [`read_rows_by_id`].
///
/// # Errors
///
/// Same as [`read_rows_by_id`]. Chunks already executed before a failing
/// chunk stay applied unless the caller runs this inside a transaction.
pub fn execute_sql_by_id<I: ToSql>(
    conn: &Connection,
    sql_template: &str,
    static_params: &[&dyn ToSql],
    ids: &[I],
) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }

    let chunk_size = id_chunk_size(conn, sql_template, static_params)?;
    let mut changed = 0;

    for chunk in ids.chunks(chunk_size) {
        let sql = expand_id_template(sql_template, chunk.len());
        let params = bind_id_chunk(static_params, chunk);
        changed += conn.prepare_cached(&sql)?.execute(params.as_slice())?;
    }

    tracing::debug!(ids = ids.len(), chunk_size, changed, "batched write by id");
    Ok(changed)
}

fn check_static_filter(
    static_filter: Option<&str>,
    static_params: &[&dyn ToSql],
) -> Result<()> {
    let expected = match static_filter {
        Some(filter) => count_placeholders(filter)?,
        None => 0,
    };
    if expected != static_params.len() {
        return Err(DbError::MalformedFilter(format!(
            "static filter has {expected} placeholders but {} static parameters were supplied",
            static_params.len()
        )));
    }
    Ok(())
}

fn id_chunk_size(
    conn: &Connection,
    sql_template: &str,
    static_params: &[&dyn ToSql],
) -> Result<usize> {
    let mut parts = sql_template.split(ID_LIST_MARKER);
    let (before, after) = match (parts.next(), parts.next(), parts.next()) {
        (Some(before), Some(after), None) => (before, after),
        _ => {
            return Err(DbError::MalformedFilter(format!(
                "id template must contain exactly one `{ID_LIST_MARKER}`: {sql_template}"
            )))
        }
    };

    if count_placeholders(after)? != 0 {
        return Err(DbError::MalformedFilter(
            "static placeholders must precede the id list".to_string(),
        ));
    }
    let expected = count_placeholders(before)?;
    if expected != static_params.len() {
        return Err(DbError::MalformedFilter(format!(
            "id template has {expected} static placeholders but {} static parameters were supplied",
            static_params.len()
        )));
    }

    let limits = BatchLimits::for_connection(conn).without_term_limit();
    chunk_capacity(static_params.len(), 1, limits)
}

fn expand_id_template(sql_template: &str, id_count: usize) -> String {
    let list = vec!["?"; id_count].join(",");
    sql_template.replacen(ID_LIST_MARKER, &list, 1)
}

fn bind_id_chunk<'a, I: ToSql>(
    static_params: &[&'a dyn ToSql],
    chunk: &'a [I],
) -> Vec<&'a dyn ToSql> {
    let mut params: Vec<&dyn ToSql> = Vec::with_capacity(static_params.len() + chunk.len());
    params.extend_from_slice(static_params);
    params.extend(chunk.iter().map(|id| id as &dyn ToSql));
    params
}
