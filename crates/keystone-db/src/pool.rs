//! Bounded connection pool with explicit acquire, release and close.
//!
//! The pool is generic over any [`r2d2::ManageConnection`] so the same
//! checkout discipline applies to SQLite connections and to test factories.
//! All mutable state (idle set, checked-out ids, reserved slots and the
//! closed flag) sits behind a single mutex; callers that find the pool at
//! capacity wait on a condition variable until a connection is returned,
//! the pool is closed, or the acquire deadline passes.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use r2d2::ManageConnection;

use crate::error::{DbError, Result};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Point-in-time view of a pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections waiting in the idle set.
    pub idle: usize,
    /// Connections currently held by callers.
    pub checked_out: usize,
    /// Maximum number of open connections.
    pub capacity: usize,
    /// Whether the pool has been closed.
    pub closed: bool,
}

struct IdleConnection<C> {
    id: u64,
    conn: C,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    checked_out: HashSet<u64>,
    /// Slots reserved by callers that are opening a connection outside the lock.
    opening: usize,
    next_conn_id: u64,
    closed: bool,
}

impl<C> PoolState<C> {
    fn open_count(&self) -> usize {
        self.idle.len() + self.checked_out.len() + self.opening
    }
}

struct SharedPool<M: ManageConnection> {
    id: u64,
    location: String,
    manager: M,
    capacity: usize,
    acquire_timeout: Duration,
    state: Mutex<PoolState<M::Connection>>,
    available: Condvar,
}

impl<M: ManageConnection> SharedPool<M> {
    /// Returns a checked-out connection to the idle set, or closes it when
    /// the pool is closed or the factory reports it broken.
    ///
    /// A release after close still closes the connection and frees its slot,
    /// then fails with `InvalidConnectionState`.
    fn check_in(&self, id: u64, mut conn: M::Connection) -> Result<()> {
        let broken = self.manager.has_broken(&mut conn);
        let mut state = self.state.lock();

        if !state.checked_out.remove(&id) {
            drop(state);
            return Err(DbError::InvalidConnectionState(format!(
                "connection {id} is not checked out of the pool for {}",
                self.location
            )));
        }

        if state.closed {
            drop(state);
            drop(conn);
            tracing::debug!(
                location = %self.location,
                connection = id,
                "closed connection released after pool shutdown"
            );
            return Err(DbError::InvalidConnectionState(format!(
                "connection {id} released after the pool for {} was closed",
                self.location
            )));
        }

        if broken {
            drop(state);
            drop(conn);
            tracing::warn!(
                location = %self.location,
                connection = id,
                "discarding broken connection"
            );
        } else {
            state.idle.push_back(IdleConnection { id, conn });
            drop(state);
        }

        self.available.notify_one();
        Ok(())
    }
}

/// A bounded pool of connections for one database location.
///
/// Cloning a `ConnectionPool` yields another handle to the same pool.
pub struct ConnectionPool<M: ManageConnection> {
    shared: Arc<SharedPool<M>>,
}

impl<M: ManageConnection> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ManageConnection> fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("location", &self.shared.location)
            .field("status", &self.status())
            .finish()
    }
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Creates an empty pool. Connections are opened on demand by
    /// [`acquire`](Self::acquire); use [`prime`](Self::prime) to open one
    /// eagerly.
    ///
    /// A `capacity` of zero is treated as one.
    pub fn new(
        location: impl Into<String>,
        manager: M,
        capacity: u32,
        acquire_timeout: Duration,
    ) -> Self {
        let shared = SharedPool {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            location: location.into(),
            manager,
            capacity: capacity.max(1) as usize,
            acquire_timeout,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                checked_out: HashSet::new(),
                opening: 0,
                next_conn_id: 1,
                closed: false,
            }),
            available: Condvar::new(),
        };

        Self {
            shared: Arc::new(shared),
        }
    }

    /// Opens one connection and parks it in the idle set, surfacing an
    /// unusable location immediately instead of at first use.
    ///
    /// # Errors
    ///
    /// Returns `DbError::StorageOpen` if the factory cannot open the location.
    pub fn prime(&self) -> Result<()> {
        let conn = self.acquire()?;
        self.release(conn)
    }

    /// Checks out a connection for exclusive use.
    ///
    /// Reuses an idle connection when one exists, opens a new one while the
    /// pool is below capacity, and otherwise blocks until a connection is
    /// released or the acquire timeout elapses.
    ///
    /// # Errors
    ///
    /// - `DbError::ContextClosed` if the pool is closed (including while waiting).
    /// - `DbError::PoolExhausted` if no connection frees up before the deadline.
    /// - `DbError::StorageOpen` if a new connection cannot be opened.
    pub fn acquire(&self) -> Result<PooledConnection<M>> {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.acquire_timeout;
        let mut state = shared.state.lock();

        loop {
            if state.closed {
                return Err(DbError::ContextClosed);
            }

            if let Some(IdleConnection { id, conn }) = state.idle.pop_back() {
                state.checked_out.insert(id);
                return Ok(PooledConnection::new(id, conn, Arc::clone(shared)));
            }

            if state.open_count() < shared.capacity {
                state.opening += 1;
                drop(state);
                return self.open_reserved();
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    location = %shared.location,
                    capacity = shared.capacity,
                    timeout_ms = shared.acquire_timeout.as_millis() as u64,
                    "timed out waiting for a pooled connection"
                );
                return Err(DbError::PoolExhausted {
                    timeout: shared.acquire_timeout,
                });
            }

            shared.available.wait_until(&mut state, deadline);
        }
    }

    /// Opens a connection into a slot already reserved under the lock.
    fn open_reserved(&self) -> Result<PooledConnection<M>> {
        let shared = &self.shared;

        match shared.manager.connect() {
            Ok(conn) => {
                let mut state = shared.state.lock();
                state.opening -= 1;

                if state.closed {
                    drop(state);
                    drop(conn);
                    shared.available.notify_all();
                    return Err(DbError::ContextClosed);
                }

                let id = state.next_conn_id;
                state.next_conn_id += 1;
                state.checked_out.insert(id);
                let open = state.open_count();
                drop(state);

                tracing::debug!(
                    location = %shared.location,
                    connection = id,
                    open,
                    "opened pooled connection"
                );
                Ok(PooledConnection::new(id, conn, Arc::clone(shared)))
            }
            Err(e) => {
                shared.state.lock().opening -= 1;
                shared.available.notify_one();
                Err(DbError::StorageOpen {
                    location: shared.location.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Returns a connection to the pool.
    ///
    /// If the pool was closed while the connection was checked out, the
    /// connection is closed instead of being re-pooled and the release fails.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidConnectionState` if the connection was not
    /// handed out by this pool (it then goes back to the pool that owns it),
    /// or if this pool was closed while the connection was out.
    pub fn release(&self, conn: PooledConnection<M>) -> Result<()> {
        if !Arc::ptr_eq(&conn.pool, &self.shared) {
            return Err(DbError::InvalidConnectionState(format!(
                "connection {} belongs to pool {} ({}), not pool {} ({})",
                conn.id, conn.pool.id, conn.pool.location, self.shared.id, self.shared.location
            )));
        }
        conn.release()
    }

    /// Closes every idle connection and refuses further acquisition.
    ///
    /// Connections still checked out are closed when they are released.
    /// Returns `false` if the pool was already closed.
    pub fn close(&self) -> bool {
        let idle = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        self.shared.available.notify_all();

        let closed_idle = idle.len();
        drop(idle);
        tracing::info!(
            location = %self.shared.location,
            closed_idle,
            "connection pool closed"
        );
        true
    }

    /// Returns the current occupancy of the pool.
    pub fn status(&self) -> PoolStatus {
        let state = self.shared.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            checked_out: state.checked_out.len(),
            capacity: self.shared.capacity,
            closed: state.closed,
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// The location this pool opens connections to.
    pub fn location(&self) -> &str {
        &self.shared.location
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dereferences to the underlying connection. Dropping the guard returns the
/// connection to its pool; [`release`](Self::release) does the same but
/// reports failures to the caller.
pub struct PooledConnection<M: ManageConnection> {
    id: u64,
    conn: Option<M::Connection>,
    pool: Arc<SharedPool<M>>,
}

impl<M: ManageConnection> PooledConnection<M> {
    fn new(id: u64, conn: M::Connection, pool: Arc<SharedPool<M>>) -> Self {
        Self {
            id,
            conn: Some(conn),
            pool,
        }
    }

    /// Identifier of this connection, unique within its pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the connection to the pool that handed it out.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidConnectionState` if the pool has no record of
    /// this connection being checked out, or was closed while it was out.
    pub fn release(mut self) -> Result<()> {
        match self.conn.take() {
            Some(conn) => self.pool.check_in(self.id, conn),
            None => Err(DbError::InvalidConnectionState(format!(
                "connection {} was already released",
                self.id
            ))),
        }
    }
}

impl<M: ManageConnection> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("location", &self.pool.location)
            .finish()
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `release` and `drop` take the connection, and both consume the guard.
        self.conn.as_ref().expect("pooled connection used after release")
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("pooled connection used after release")
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = self.pool.check_in(self.id, conn) {
                tracing::warn!(error = %e, "failed to return connection on drop");
            }
        }
    }
}
