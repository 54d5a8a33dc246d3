//! Scoped connection injection.
//!
//! Functions that need a database connection take `&Connection` as their
//! first argument. [`with_connection`] runs such a function against a
//! connection borrowed from a [`DatabaseContext`], and [`inject_connection`]
//! turns one into a function that takes the context instead.

use rusqlite::Connection;

use crate::context::DatabaseContext;
use crate::error::DbError;

/// Acquires a connection from `ctx`, runs `f` with it and releases it.
///
/// The connection is released on every exit path: success, error and panic
/// (the guard's drop returns it). An error from `f` is returned unchanged even
/// if the release also fails; a release failure after a successful `f` is
/// returned as the error.
///
/// # Errors
///
/// Returns the error from `f`, or an acquisition/release failure converted
/// into `E`.
pub fn with_connection<T, E, F>(ctx: &DatabaseContext, f: F) -> Result<T, E>
where
    F: FnOnce(&Connection) -> Result<T, E>,
    E: From<DbError>,
{
    let conn = ctx.acquire()?;
    let outcome = f(&*conn);
    let released = ctx.release(conn);

    match outcome {
        Ok(value) => {
            released?;
            Ok(value)
        }
        Err(err) => {
            if let Err(release_err) = released {
                tracing::warn!(
                    error = %release_err,
                    "failed to release connection after wrapped function failed"
                );
            }
            Err(err)
        }
    }
}

/// Wraps `f(&Connection, args)` into `g(&DatabaseContext, args)`.
///
/// Each call to `g` acquires a connection from the context, passes it to `f`
/// as the first argument with `args` unchanged, and releases it as
/// [`with_connection`] does. Use a tuple for `args` when `f` takes several
/// arguments.
///
/// ```no_run
/// use keystone_db::{inject_connection, DatabaseContext, DbError, DbRuntimeSettings};
///
/// let count_rich = inject_connection(|conn, min_balance: i64| -> Result<i64, DbError> {
///     Ok(conn.query_row(
///         "SELECT COUNT(*) FROM accounts WHERE balance >= ?1",
///         [min_balance],
///         |row| row.get(0),
///     )?)
/// });
///
/// let ctx = DatabaseContext::open("app.db", DbRuntimeSettings::default())?;
/// let n = count_rich(&ctx, 1_000)?;
/// # Ok::<(), DbError>(())
/// ```
pub fn inject_connection<A, T, E, F>(f: F) -> impl Fn(&DatabaseContext, A) -> Result<T, E>
where
    F: Fn(&Connection, A) -> Result<T, E>,
    E: From<DbError>,
{
    move |ctx: &DatabaseContext, args: A| with_connection(ctx, |conn| f(conn, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DbRuntimeSettings;
    use std::panic::{self, AssertUnwindSafe};

    #[derive(Debug, thiserror::Error)]
    enum AppError {
        #[error("db: {0}")]
        Db(#[from] DbError),
        #[error("rejected {0}")]
        Rejected(i64),
    }

    fn single_connection_context() -> DatabaseContext {
        let settings = DbRuntimeSettings {
            pool_max_size: 1,
            acquire_timeout_ms: 50,
            ..DbRuntimeSettings::default()
        };
        DatabaseContext::open(DatabaseContext::unique_memory_uri(), settings)
            .expect("context should open")
    }

    #[test]
    fn wrapped_function_receives_connection_and_arguments() {
        let ctx = single_connection_context();
        let reader = inject_connection(
            |conn: &Connection, id: i64| -> Result<(String, i64), DbError> {
                let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
                assert_eq!(one, 1);
                Ok(("tuple".to_string(), id))
            },
        );

        let result = reader(&ctx, 111).expect("reader should succeed");
        assert_eq!(result, ("tuple".to_string(), 111));
        assert_eq!(ctx.status().checked_out, 0);
    }

    #[test]
    fn multiple_arguments_pass_through_as_tuple() {
        let ctx = single_connection_context();
        let add = inject_connection(
            |conn: &Connection, (a, b): (i64, i64)| -> Result<i64, DbError> {
                Ok(conn.query_row("SELECT ?1 + ?2", [a, b], |row| row.get(0))?)
            },
        );

        assert_eq!(add(&ctx, (2, 40)).expect("add"), 42);
        assert_eq!(add(&ctx, (1, 1)).expect("add again"), 2);
    }

    #[test]
    fn failure_releases_connection_once() {
        let ctx = single_connection_context();

        let result: Result<(), AppError> =
            with_connection(&ctx, |_conn| Err(AppError::Rejected(7)));
        assert!(matches!(result, Err(AppError::Rejected(7))));

        let status = ctx.status();
        assert_eq!(status.checked_out, 0);
        assert_eq!(status.idle, 1);

        // The only connection is available again.
        let conn = ctx.acquire().expect("connection should be free");
        ctx.release(conn).expect("release");
    }

    #[test]
    fn engine_errors_propagate_unchanged() {
        let ctx = single_connection_context();
        let result: Result<i64, DbError> = with_connection(&ctx, |conn| {
            Ok(conn.query_row("SELECT nope FROM missing", [], |row| row.get(0))?)
        });

        assert!(matches!(result, Err(DbError::Sqlite(_))));
        assert_eq!(ctx.status().idle, 1);
    }

    #[test]
    fn panic_releases_connection() {
        let ctx = single_connection_context();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let _: Result<(), DbError> = with_connection(&ctx, |_conn| panic!("boom"));
        }));
        assert!(outcome.is_err());

        assert_eq!(ctx.status().checked_out, 0);
        ctx.acquire().expect("connection should be free after panic");
    }

    #[test]
    fn closed_context_surfaces_acquire_error() {
        let ctx = single_connection_context();
        ctx.close();

        let result: Result<(), AppError> = with_connection(&ctx, |_conn| Ok(()));
        assert!(matches!(result, Err(AppError::Db(DbError::ContextClosed))));
    }

    #[test]
    fn close_during_call_surfaces_release_error() {
        let ctx = single_connection_context();
        let result: Result<i64, AppError> = with_connection(&ctx, |_conn| {
            ctx.close();
            Ok(1)
        });

        assert!(matches!(
            result,
            Err(AppError::Db(DbError::InvalidConnectionState(_)))
        ));
        assert_eq!(ctx.status().checked_out, 0);
    }

    #[test]
    fn nested_acquire_times_out_on_single_connection_pool() {
        let ctx = single_connection_context();
        let result: Result<(), DbError> = with_connection(&ctx, |_outer| {
            with_connection(&ctx, |_inner| Ok(()))
        });

        assert!(matches!(result, Err(DbError::PoolExhausted { .. })));
        assert_eq!(ctx.status().checked_out, 0);
    }
}
