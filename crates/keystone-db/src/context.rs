//! Database context: one connection pool bound to one database location.

use std::fmt;
use std::time::Duration;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;

use crate::error::Result;
use crate::pool::{ConnectionPool, PoolStatus, PooledConnection};

/// A SQLite connection checked out of a [`DatabaseContext`].
pub type SqliteConnection = PooledConnection<SqliteConnectionManager>;

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    pub pool_max_size: u32,

    /// How long `acquire` waits for a free connection, in milliseconds.
    pub acquire_timeout_ms: u64,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
            acquire_timeout_ms: 30_000,
        }
    }
}

/// Owns the connection pool for one database location.
///
/// A context is shared by every thread that talks to the database. It hands
/// out connections with [`acquire`](Self::acquire), takes them back with
/// [`release`](Self::release) (or when the guard drops), and shuts the pool
/// down with [`close`](Self::close). Dropping the context closes it.
pub struct DatabaseContext {
    settings: DbRuntimeSettings,
    pool: ConnectionPool<SqliteConnectionManager>,
}

impl DatabaseContext {
    /// Opens a context for `location` and eagerly opens one connection.
    ///
    /// `location` is a file path or an SQLite URI such as the one returned by
    /// [`shared_memory_uri`](Self::shared_memory_uri). Every connection has
    /// foreign keys enabled, the configured busy timeout applied and WAL
    /// journaling requested (in-memory databases report `memory`).
    ///
    /// # Errors
    ///
    /// Returns `DbError::StorageOpen` if the location cannot be opened.
    pub fn open(location: impl Into<String>, settings: DbRuntimeSettings) -> Result<Self> {
        let location = location.into();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let manager = SqliteConnectionManager::file(&location)
            .with_flags(flags)
            .with_init(move |conn| {
                conn.execute_batch(&format!(
                    "PRAGMA busy_timeout = {};
                     PRAGMA foreign_keys = ON;",
                    settings.busy_timeout_ms
                ))?;

                let journal_mode: String =
                    conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
                if journal_mode != "wal" && journal_mode != "memory" {
                    return Err(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                        Some(format!(
                            "failed to set WAL journal mode, got: {journal_mode}"
                        )),
                    ));
                }
                Ok(())
            });

        let pool = ConnectionPool::new(
            location.clone(),
            manager,
            settings.pool_max_size,
            Duration::from_millis(settings.acquire_timeout_ms),
        );
        pool.prime()?;

        tracing::info!(
            location = %location,
            pool_max_size = settings.pool_max_size,
            "opened database context"
        );

        Ok(Self { settings, pool })
    }

    /// Builds a URI for an in-process, shared, non-persistent database.
    ///
    /// Every connection opened with the same `token` in this process sees the
    /// same database for as long as at least one of them stays open. Distinct
    /// tokens address isolated databases.
    pub fn shared_memory_uri(token: &str) -> String {
        format!("file:{token}?mode=memory&cache=shared")
    }

    /// A [`shared_memory_uri`](Self::shared_memory_uri) with a fresh random
    /// token, for isolated test fixtures.
    pub fn unique_memory_uri() -> String {
        Self::shared_memory_uri(&uuid::Uuid::new_v4().simple().to_string())
    }

    /// Checks out a connection for exclusive use.
    ///
    /// # Errors
    ///
    /// - `DbError::ContextClosed` after [`close`](Self::close).
    /// - `DbError::PoolExhausted` if the pool stays full past the acquire timeout.
    /// - `DbError::StorageOpen` if a new connection cannot be opened.
    pub fn acquire(&self) -> Result<SqliteConnection> {
        self.pool.acquire()
    }

    /// Returns a connection to the pool.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidConnectionState` if `conn` was acquired from a
    /// different context, or if this context was closed while `conn` was out.
    /// The connection is closed in the latter case.
    pub fn release(&self, conn: SqliteConnection) -> Result<()> {
        self.pool.release(conn)
    }

    /// Closes all idle connections and refuses further acquisition.
    ///
    /// Connections still checked out are closed when released, and that
    /// release reports `DbError::InvalidConnectionState`. Calling `close`
    /// again has no effect.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Current pool occupancy.
    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// The location this context was opened with.
    pub fn location(&self) -> &str {
        self.pool.location()
    }

    /// The settings this context was opened with.
    pub fn settings(&self) -> DbRuntimeSettings {
        self.settings
    }
}

impl fmt::Debug for DatabaseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseContext")
            .field("location", &self.location())
            .field("settings", &self.settings)
            .field("status", &self.status())
            .finish()
    }
}

impl Drop for DatabaseContext {
    fn drop(&mut self) {
        self.close();
    }
}
