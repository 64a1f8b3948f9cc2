//! Bounded per-source connection pool
//!
//! The pool keeps one slot group per configured source node. A semaphore per
//! source bounds how many connections may be checked out concurrently, and a
//! lock-free queue holds idle connections for reuse. Connections are created
//! lazily, probed before reuse, and discarded when a caller releases them
//! unhealthy; the next acquire recreates them.
//!
//! `acquire` walks the caller-supplied preference order: an idle healthy
//! connection wins, then a fresh connection if the source still has slots,
//! then the next candidate. Only when every candidate is saturated does the
//! caller block, bounded by its own timeout, on the first preference.

mod connection;

pub use connection::SourceConnection;

use crate::config::SourceConfig;
use crate::connection_error::ConnectionError;
use crate::types::SourceId;
use anyhow::Result;
use crossbeam::queue::SegQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Pool accounting for one source, for monitoring and tests
#[derive(Debug, Clone)]
pub struct PoolStatus {
    /// Slots not currently checked out
    pub available: usize,
    /// Configured maximum concurrent connections
    pub max_size: usize,
    /// Live connections (checked out + idle)
    pub created: usize,
}

/// A checked-out connection; return it with [`ConnectionPool::release`]
///
/// Dropping the guard without releasing discards the connection and frees
/// its slot.
#[derive(Debug)]
pub struct PooledConnection {
    conn: SourceConnection,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = SourceConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// Per-source slot group
#[derive(Debug)]
struct SourceSlots {
    semaphore: Arc<Semaphore>,
    idle: SegQueue<SourceConnection>,
    created: AtomicUsize,
    max: usize,
}

impl SourceSlots {
    fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            idle: SegQueue::new(),
            created: AtomicUsize::new(0),
            max,
        }
    }
}

/// Pool of RPC connections to the configured source nodes
#[derive(Debug)]
pub struct ConnectionPool {
    sources: Vec<SourceConfig>,
    slots: Vec<SourceSlots>,
}

impl ConnectionPool {
    /// Build a pool over the configured sources, in configured order
    pub fn new(sources: Vec<SourceConfig>) -> Result<Self> {
        if sources.is_empty() {
            anyhow::bail!("no sources configured");
        }
        let slots = sources
            .iter()
            .map(|s| SourceSlots::new(s.max_connections as usize))
            .collect();
        Ok(Self { sources, slots })
    }

    /// Number of configured sources
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Configuration of one source
    #[must_use]
    pub fn source_config(&self, id: SourceId) -> &SourceConfig {
        &self.sources[id.as_index()]
    }

    /// All source IDs in configured (preference) order
    #[must_use]
    pub fn source_ids(&self) -> Vec<SourceId> {
        (0..self.sources.len()).map(SourceId::from_index).collect()
    }

    /// Acquire a connection to the first available candidate source
    ///
    /// Candidates are tried in the supplied order. If every candidate is
    /// saturated, waits up to `wait_timeout` for a slot on the first
    /// preference.
    pub async fn acquire(
        &self,
        preference: &[SourceId],
        wait_timeout: Duration,
    ) -> Result<PooledConnection, ConnectionError> {
        let mut last_error: Option<ConnectionError> = None;

        for &id in preference {
            let slots = &self.slots[id.as_index()];
            let Ok(permit) = slots.semaphore.clone().try_acquire_owned() else {
                debug!(
                    "source '{}' saturated, trying next candidate",
                    self.sources[id.as_index()].name
                );
                continue;
            };

            match self.checkout(id, permit).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!(
                        "could not open connection to source '{}': {}",
                        self.sources[id.as_index()].name, e
                    );
                    last_error = Some(e);
                }
            }
        }

        // Every candidate saturated or unreachable. If one failed to open,
        // surface that; otherwise block on the first preference for a slot.
        if let Some(e) = last_error {
            return Err(e);
        }

        let Some(&first) = preference.first() else {
            return Err(ConnectionError::PoolSaturated {
                source: "<no candidates>".to_string(),
                max_size: 0,
            });
        };
        let slots = &self.slots[first.as_index()];
        let config = &self.sources[first.as_index()];

        match tokio::time::timeout(wait_timeout, slots.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => self.checkout(first, permit).await,
            Ok(Err(_)) | Err(_) => Err(ConnectionError::PoolSaturated {
                source: config.name.clone(),
                max_size: slots.max,
            }),
        }
    }

    /// Reuse an idle connection or open a fresh one, under a held permit
    async fn checkout(
        &self,
        id: SourceId,
        permit: OwnedSemaphorePermit,
    ) -> Result<PooledConnection, ConnectionError> {
        let slots = &self.slots[id.as_index()];
        let config = &self.sources[id.as_index()];

        while let Some(conn) = slots.idle.pop() {
            if conn.is_idle_alive() {
                debug!("reusing idle connection to source '{}'", config.name);
                return Ok(PooledConnection {
                    conn,
                    _permit: permit,
                });
            }
            debug!(
                "idle connection to source '{}' went stale, discarding",
                config.name
            );
            slots.created.fetch_sub(1, Ordering::Relaxed);
        }

        let conn = SourceConnection::connect(id, config).await?;
        slots.created.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            conn,
            _permit: permit,
        })
    }

    /// Return a connection to the pool
    ///
    /// A healthy connection goes back to its source's idle queue for reuse;
    /// an unhealthy one is discarded and its slot recreated lazily on the
    /// next acquire.
    pub fn release(&self, pooled: PooledConnection, healthy: bool) {
        let id = pooled.conn.source_id();
        let slots = &self.slots[id.as_index()];

        if healthy {
            slots.idle.push(pooled.conn);
        } else {
            debug!(
                "discarding unhealthy connection to source '{}'",
                self.sources[id.as_index()].name
            );
            slots.created.fetch_sub(1, Ordering::Relaxed);
        }
        // The permit drops here, freeing the slot either way
    }

    /// Pool accounting for one source
    #[must_use]
    pub fn status(&self, id: SourceId) -> PoolStatus {
        let slots = &self.slots[id.as_index()];
        PoolStatus {
            available: slots.semaphore.available_permits(),
            max_size: slots.max,
            created: slots.created.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, Response, read_frame, write_frame};
    use tokio::net::TcpListener;

    async fn spawn_pong_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    while let Ok(Some(Request::Ping)) =
                        read_frame::<_, Request>(&mut stream).await
                    {
                        if write_frame(&mut stream, &Response::Pong).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    fn source(port: u16, name: &str, max_connections: u32) -> SourceConfig {
        SourceConfig {
            host: "127.0.0.1".to_string(),
            port,
            name: name.to_string(),
            max_connections,
        }
    }

    #[test]
    fn test_pool_rejects_empty_sources() {
        assert!(ConnectionPool::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_connection() {
        let port = spawn_pong_server().await;
        let pool = ConnectionPool::new(vec![source(port, "s0", 2)]).unwrap();
        let ids = pool.source_ids();

        let conn = pool.acquire(&ids, Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.status(ids[0]).created, 1);
        pool.release(conn, true);

        let conn = pool.acquire(&ids, Duration::from_secs(1)).await.unwrap();
        // Reused, not recreated
        assert_eq!(pool.status(ids[0]).created, 1);
        pool.release(conn, true);
    }

    #[tokio::test]
    async fn test_unhealthy_release_discards_connection() {
        let port = spawn_pong_server().await;
        let pool = ConnectionPool::new(vec![source(port, "s0", 2)]).unwrap();
        let ids = pool.source_ids();

        let conn = pool.acquire(&ids, Duration::from_secs(1)).await.unwrap();
        pool.release(conn, false);
        assert_eq!(pool.status(ids[0]).created, 0);

        // Lazily recreated on next acquire
        let conn = pool.acquire(&ids, Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.status(ids[0]).created, 1);
        pool.release(conn, true);
    }

    #[tokio::test]
    async fn test_saturated_source_times_out() {
        let port = spawn_pong_server().await;
        let pool = ConnectionPool::new(vec![source(port, "s0", 1)]).unwrap();
        let ids = pool.source_ids();

        let held = pool.acquire(&ids, Duration::from_secs(1)).await.unwrap();
        let result = pool.acquire(&ids, Duration::from_millis(50)).await;
        assert!(matches!(
            result,
            Err(ConnectionError::PoolSaturated { .. })
        ));
        pool.release(held, true);
    }

    #[tokio::test]
    async fn test_saturated_source_falls_over_to_next_candidate() {
        let port0 = spawn_pong_server().await;
        let port1 = spawn_pong_server().await;
        let pool =
            ConnectionPool::new(vec![source(port0, "s0", 1), source(port1, "s1", 1)]).unwrap();
        let ids = pool.source_ids();

        let held = pool.acquire(&ids, Duration::from_secs(1)).await.unwrap();
        assert_eq!(held.source_id(), ids[0]);

        let second = pool.acquire(&ids, Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.source_id(), ids[1]);

        pool.release(held, true);
        pool.release(second, true);
    }

    #[tokio::test]
    async fn test_waiting_acquire_proceeds_after_release() {
        let port = spawn_pong_server().await;
        let pool = Arc::new(ConnectionPool::new(vec![source(port, "s0", 1)]).unwrap());
        let ids = pool.source_ids();

        let held = pool.acquire(&ids, Duration::from_secs(1)).await.unwrap();

        let pool_clone = Arc::clone(&pool);
        let ids_clone = ids.clone();
        let waiter = tokio::spawn(async move {
            pool_clone
                .acquire(&ids_clone, Duration::from_secs(2))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(held, true);

        let conn = waiter.await.unwrap().unwrap();
        pool.release(conn, true);
    }

    #[tokio::test]
    async fn test_unreachable_source_surfaces_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = ConnectionPool::new(vec![source(port, "dead", 1)]).unwrap();
        let ids = pool.source_ids();

        let result = pool.acquire(&ids, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ConnectionError::Connect { .. })));
    }
}
