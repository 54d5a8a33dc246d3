//! Error types for the database access layer.

use std::time::Duration;

/// Errors that can occur while managing connections or running batched
/// queries.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The database location could not be opened.
    #[error("failed to open database at {location}: {message}")]
    StorageOpen {
        /// The location that was being opened.
        location: String,
        /// The engine's description of the failure.
        message: String,
    },

    /// No connection became available before the acquire deadline.
    #[error("connection pool exhausted: no connection available within {timeout:?}")]
    PoolExhausted {
        /// How long the caller waited.
        timeout: Duration,
    },

    /// A connection was released to a pool that did not hand it out.
    #[error("invalid connection state: {0}")]
    InvalidConnectionState(String),

    /// The context has been closed and can no longer hand out connections.
    #[error("database context is closed")]
    ContextClosed,

    /// A single key cannot be bound alongside the static parameters.
    #[error(
        "query too large: {static_params} static parameters plus one key of arity {arity} \
         exceed the limit of {max_params} bound parameters"
    )]
    QueryTooLarge {
        /// Number of static filter parameters bound per statement.
        static_params: usize,
        /// Number of values in each composite key.
        arity: usize,
        /// Engine limit on bound parameters per statement.
        max_params: usize,
    },

    /// A filter template does not agree with the values bound to it.
    #[error("malformed filter: {0}")]
    MalformedFilter(String),

    /// The engine rejected a statement.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result alias using [`DbError`].
pub type Result<T> = std::result::Result<T, DbError>;
