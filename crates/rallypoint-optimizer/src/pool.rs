//! Bounded pool of reusable transport handles.
//!
//! At most `max_connections` handles are ever checked out at once, and a
//! handle serves one request at a time. When every handle is busy,
//! `acquire` parks on a [`Notify`] until a release or `connection_timeout`,
//! whichever comes first.
//!
//! Handles are never destroyed while the pool lives. An idle handle that
//! went stale (idle past `idle_timeout`, or past its request budget) is
//! *recycled* on its next checkout: same slot, fresh id. The old id is
//! reported through [`PooledConnection::replaced`] so the caller can close
//! whatever physical link backed it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rallypoint_protocol::ConfigError;
use rallypoint_transport::ConnectionId;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

use crate::{OptimizerError, PoolConfig};

/// Whether a pooled handle is checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Free,
    Busy,
}

/// Bookkeeping for one pooled handle.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub last_used: Instant,
    /// Requests served since this id was issued.
    pub request_count: u64,
}

struct PoolState {
    connections: Vec<Connection>,
    next_id: u64,
    peak_active: usize,
    closed: bool,
}

impl PoolState {
    fn allocate_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId::new(self.next_id)
    }

    fn active(&self) -> usize {
        self.connections
            .iter()
            .filter(|c| c.state == ConnectionState::Busy)
            .count()
    }
}

struct PoolShared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    released: Notify,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, id: ConnectionId) {
        {
            let mut state = self.lock();
            if let Some(conn) = state.connections.iter_mut().find(|c| c.id == id) {
                conn.state = ConnectionState::Free;
                conn.last_used = Instant::now();
            }
        }
        self.released.notify_one();
        tracing::trace!(%id, "connection released");
    }
}

/// Handle to the shared pool. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Creates an empty pool. Handles are opened lazily by `acquire`.
    ///
    /// # Errors
    /// [`ConfigError`] for a zero capacity: such a pool could never serve.
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        tracing::info!(
            max_connections = config.max_connections,
            timeout_ms = config.connection_timeout.as_millis() as u64,
            "connection pool created"
        );
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                state: Mutex::new(PoolState {
                    connections: Vec::new(),
                    next_id: 0,
                    peak_active: 0,
                    closed: false,
                }),
                released: Notify::new(),
            }),
        })
    }

    /// Checks out a handle, waiting up to `connection_timeout` for one.
    ///
    /// # Errors
    /// - [`OptimizerError::PoolExhausted`] when the wait times out
    /// - [`OptimizerError::Shutdown`] after [`close`](Self::close)
    pub async fn acquire(&self) -> Result<PooledConnection, OptimizerError> {
        let started = Instant::now();
        let deadline = started + self.shared.config.connection_timeout;

        loop {
            // Register interest *before* checking, so a release that lands
            // between the check and the await still wakes us.
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_acquire()? {
                return Ok(lease);
            }

            if time::timeout_at(deadline, notified).await.is_err() {
                let waited = started.elapsed();
                tracing::warn!(
                    waited_ms = waited.as_millis() as u64,
                    max_connections = self.shared.config.max_connections,
                    "connection pool exhausted"
                );
                return Err(OptimizerError::PoolExhausted { waited });
            }
        }
    }

    /// Checks out a handle without waiting. `Ok(None)` if all are busy.
    pub fn try_acquire(&self) -> Result<Option<PooledConnection>, OptimizerError> {
        let config = &self.shared.config;
        let mut state = self.shared.lock();
        if state.closed {
            return Err(OptimizerError::Shutdown);
        }
        let now = Instant::now();

        // Least-recently-used idle handle first.
        let idle = state
            .connections
            .iter()
            .enumerate()
            .filter(|(_, c)| c.state == ConnectionState::Free)
            .min_by_key(|(_, c)| c.last_used)
            .map(|(i, _)| i);

        let (id, replaced) = match idle {
            Some(index) => {
                let stale = {
                    let conn = &state.connections[index];
                    now.saturating_duration_since(conn.last_used) > config.idle_timeout
                        || conn.request_count >= config.max_requests_per_connection
                };
                let fresh = stale.then(|| state.allocate_id());
                let conn = &mut state.connections[index];
                let replaced = fresh.map(|new_id| {
                    let old = conn.id;
                    conn.id = new_id;
                    conn.request_count = 0;
                    old
                });
                conn.state = ConnectionState::Busy;
                conn.last_used = now;
                conn.request_count += 1;
                (conn.id, replaced)
            }
            None if state.connections.len() < config.max_connections => {
                let id = state.allocate_id();
                state.connections.push(Connection {
                    id,
                    state: ConnectionState::Busy,
                    last_used: now,
                    request_count: 1,
                });
                tracing::debug!(%id, size = state.connections.len(), "connection opened");
                (id, None)
            }
            None => return Ok(None),
        };

        let active = state.active();
        state.peak_active = state.peak_active.max(active);
        if let Some(old) = replaced {
            tracing::debug!(%old, new = %id, "stale connection recycled");
        }

        Ok(Some(PooledConnection {
            id,
            replaced,
            shared: Arc::clone(&self.shared),
        }))
    }

    /// Returns a handle to the pool. Same as dropping the lease.
    pub fn release(&self, connection: PooledConnection) {
        drop(connection);
    }

    /// Stops handing out connections and returns every id for closing.
    /// Waiters wake up with [`OptimizerError::Shutdown`].
    pub fn close(&self) -> Vec<ConnectionId> {
        let ids = {
            let mut state = self.shared.lock();
            state.closed = true;
            state.connections.iter().map(|c| c.id).collect()
        };
        self.shared.released.notify_waiters();
        tracing::info!("connection pool closed");
        ids
    }

    /// Handles currently checked out.
    pub fn active(&self) -> usize {
        self.shared.lock().active()
    }

    /// Highest number of simultaneously checked-out handles seen.
    pub fn peak_active(&self) -> usize {
        self.shared.lock().peak_active
    }

    /// Handles opened so far (busy or free).
    pub fn size(&self) -> usize {
        self.shared.lock().connections.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.config.max_connections
    }

    pub fn connection_timeout(&self) -> Duration {
        self.shared.config.connection_timeout
    }

    /// A copy of every handle's bookkeeping.
    pub fn snapshot(&self) -> Vec<Connection> {
        self.shared.lock().connections.clone()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.capacity())
            .field("size", &self.size())
            .field("active", &self.active())
            .finish()
    }
}

/// A checked-out handle. Returned to the pool when dropped.
pub struct PooledConnection {
    id: ConnectionId,
    replaced: Option<ConnectionId>,
    shared: Arc<PoolShared>,
}

impl PooledConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The id this handle had before it was recycled, if it was.
    pub fn replaced(&self) -> Option<ConnectionId> {
        self.replaced
    }

    pub fn release(self) {}
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.shared.release(self.id);
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").field("id", &self.id).finish()
    }
}
