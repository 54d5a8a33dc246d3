//! Connection management and batched key lookups over SQLite.
//!
//! Provides a [`DatabaseContext`] that owns a bounded connection pool for one
//! database location, scoped connection injection for functions that take a
//! `&Connection`, and batched readers that look up rows by large sets of
//! composite keys without exceeding the engine's bound-parameter limit.
//!
//! # Design decisions
//!
//! - **Explicit pool over `r2d2::ManageConnection`**: connections are opened
//!   through the `r2d2` factory trait (`r2d2_sqlite` for SQLite) but checked
//!   out of a pool that supports explicit release and close, so a closed
//!   context refuses work and closes stragglers as they come back.
//! - **RAII release**: a checked-out connection is a guard. Dropping it, or
//!   unwinding past it, returns the connection to the pool.
//! - **Chunked key lookups**: key sets are split by the connection's
//!   `SQLITE_LIMIT_VARIABLE_NUMBER` and expression-depth limits. Results keep
//!   chunk order, and each chunk keeps storage order.
//!
//! # Usage
//!
//! ```no_run
//! use keystone_db::{read_rows_by_ids, with_connection, DatabaseContext, DbError, DbRuntimeSettings};
//!
//! let ctx = DatabaseContext::open("ledger.db", DbRuntimeSettings::default())?;
//! let keys = [(20_i64, 11_i64), (30, 11), (40, 11)];
//!
//! let names: Vec<(i64, String)> = with_connection(&ctx, |conn| {
//!     read_rows_by_ids(
//!         conn,
//!         "SELECT id, name FROM entries",
//!         "field1=? AND field2=?",
//!         &[],
//!         &keys,
//!         None,
//!     )
//! })?;
//! # Ok::<(), DbError>(())
//! ```

mod batch;
mod context;
mod error;
mod inject;
mod pool;
mod row;

pub use batch::{
    chunk_capacity, compose_where, execute_sql_by_id, read_rows_by_id, read_rows_by_ids,
    read_rows_by_ids_with_limits, BatchLimits,
};
pub use context::{DatabaseContext, DbRuntimeSettings, SqliteConnection};
pub use error::{DbError, Result};
pub use inject::{inject_connection, with_connection};
pub use pool::{ConnectionPool, PoolStatus, PooledConnection};
pub use row::{count_placeholders, CompositeKey, FromRow};
