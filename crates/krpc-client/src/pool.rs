use dashmap::DashMap;
use krpc_common::protocol::error::{KrpcError, Result};
use krpc_common::protocol::Endpoint;
use krpc_common::transport::SerializerKind;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::connection::Connection;
use crate::heartbeat::{spawn_heartbeat, HeartbeatConfig};

/// Connection pool configuration.
///
/// # Default Configuration
///
/// - `max_connections`: 10
/// - `acquire_timeout_ms`: 30000 (30 seconds)
/// - `connect_timeout_ms`: 5000
///
/// # Example
///
/// ```rust
/// use krpc_client::PoolConfig;
///
/// let config = PoolConfig {
///     max_connections: 20,
///     ..PoolConfig::default()
/// };
/// assert_eq!(config.acquire_timeout_ms, 30000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections per endpoint, busy or idle
    pub max_connections: usize,
    /// Maximum time to wait for a free connection slot in milliseconds
    pub acquire_timeout_ms: u64,
    /// Maximum time to establish a new TCP connection in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_ms: 30000,
            connect_timeout_ms: 5000,
        }
    }
}

struct PoolShared {
    config: PoolConfig,
    heartbeat: HeartbeatConfig,
    serializer: SerializerKind,
    idle: Mutex<HashMap<Endpoint, Vec<Arc<Connection>>>>,
    slots: DashMap<Endpoint, Arc<Semaphore>>,
    closed: AtomicBool,
}

impl PoolShared {
    fn slots_for(&self, endpoint: &Endpoint) -> Arc<Semaphore> {
        self.slots
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_connections.max(1))))
            .value()
            .clone()
    }

    fn take_idle(&self, endpoint: &Endpoint) -> Option<Arc<Connection>> {
        let mut idle = self.idle.lock();
        let connections = idle.get_mut(endpoint)?;
        // LIFO keeps the most recently used, most likely alive, connection hot
        while let Some(connection) = connections.pop() {
            if connection.is_reusable() {
                return Some(connection);
            }
            tracing::debug!("Discarding stale connection to {}", endpoint);
        }
        None
    }

    fn give_back(&self, connection: Arc<Connection>) {
        if self.closed.load(Ordering::Acquire) {
            connection.close();
            return;
        }
        if connection.is_closed() {
            return;
        }
        self.idle
            .lock()
            .entry(connection.endpoint().clone())
            .or_default()
            .push(connection);
    }
}

/// Connection checked out of the pool.
///
/// Dereferences to [`Connection`]. Dropping it returns the connection to the
/// pool, or discards it if it was closed while checked out, and frees its
/// slot.
pub struct PooledConnection {
    connection: Arc<Connection>,
    pool: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.give_back(Arc::clone(&self.connection));
    }
}

/// Pool of persistent connections, grouped by endpoint.
///
/// # Architecture
///
/// - Each endpoint has at most `max_connections` connections, busy or idle
/// - Idle connections are reused LIFO and checked for a closed peer first
/// - Every new connection gets its own heartbeat task
/// - Connections closed by a failed call are discarded on return
///
/// # Example
///
/// ```rust,no_run
/// use krpc_client::{ConnectionPool, PoolConfig};
/// use krpc_common::protocol::{Endpoint, RequestEnvelope};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = ConnectionPool::new(PoolConfig::default());
///
/// let conn = pool.acquire(&Endpoint::new("127.0.0.1", 9000)).await?;
/// let response = conn.call(&RequestEnvelope::new("UserService", "getUserByUserId", vec![])).await?;
///
/// // Dropping `conn` hands it back to the pool
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_options(config, HeartbeatConfig::default(), SerializerKind::default())
    }

    pub fn with_options(
        config: PoolConfig,
        heartbeat: HeartbeatConfig,
        serializer: SerializerKind,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                heartbeat,
                serializer,
                idle: Mutex::new(HashMap::new()),
                slots: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Checks out a connection to `endpoint`, reusing an idle one if possible.
    ///
    /// # Errors
    ///
    /// - `Timeout` if every slot for the endpoint stays busy for
    ///   `acquire_timeout_ms`, or the TCP connect exceeds `connect_timeout_ms`
    /// - `Transport` if the connection cannot be established
    pub async fn acquire(&self, endpoint: &Endpoint) -> Result<PooledConnection> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(KrpcError::Transport("connection pool is shut down".to_string()));
        }
        let config = &self.shared.config;
        let slots = self.shared.slots_for(endpoint);

        let permit = tokio::time::timeout(
            Duration::from_millis(config.acquire_timeout_ms),
            slots.acquire_owned(),
        )
        .await
        .map_err(|_| KrpcError::Timeout(config.acquire_timeout_ms))?
        .map_err(|_| KrpcError::Transport("connection pool is shut down".to_string()))?;

        let connection = match self.shared.take_idle(endpoint) {
            Some(connection) => connection,
            None => {
                let connection = Arc::new(
                    Connection::open(
                        endpoint,
                        self.shared.serializer,
                        Duration::from_millis(config.connect_timeout_ms),
                    )
                    .await?,
                );
                spawn_heartbeat(&connection, &self.shared.heartbeat);
                connection
            }
        };

        Ok(PooledConnection {
            connection,
            pool: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    /// Number of idle connections held for `endpoint`.
    pub fn idle_count(&self, endpoint: &Endpoint) -> usize {
        self.shared
            .idle
            .lock()
            .get(endpoint)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Closes every idle connection and refuses further checkouts.
    ///
    /// Connections currently checked out are closed as they come back.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        for entry in self.shared.slots.iter() {
            entry.value().close();
        }
        let drained: Vec<_> = self.shared.idle.lock().drain().collect();
        for (_, connections) in drained {
            for connection in connections {
                connection.close();
            }
        }
    }
}
