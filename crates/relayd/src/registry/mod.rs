//! Connection registry.
//!
//! The registry is the set of live listener connections. Every operation
//! takes the same exclusive lock, and a broadcast pass holds it from the
//! first write to the last, so membership never changes mid-pass.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  add    ┌────────────────────────────┐  for_each  ┌─────────────┐
//! │  Admission   │────────▶│     ConnectionRegistry     │◀───────────│ Broadcaster │
//! └──────────────┘         │ Mutex<HashMap<Id, Conn>>   │            └─────────────┘
//!                          └────────────────────────────┘
//!                            ▲ remove            ▲ size
//!                  ┌─────────┴────────┐   ┌──────┴────────────┐
//!                  │ Liveness tasks   │   │ Telemetry reporter│
//!                  └──────────────────┘   └───────────────────┘
//! ```
//!
//! Removal is the only place a connection is closed: whoever takes the
//! entry out of the map performs the close handshake, so a connection is
//! never closed twice even when several tasks race to remove it.
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - Failures on individual connections are logged, never propagated

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

mod connection;

pub use connection::{
    Connection, ConnectionError, ConnectionId, Frame, FrameSink, FrameStream, SharedSink,
    CLOSE_GOING_AWAY,
};

/// Default bound on the close handshake of a removed connection.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// A broadcast write failed or timed out
    WriteFailed,
    /// A heartbeat ping could not be written
    HeartbeatFailed,
    /// The peer sent a close frame or ended its stream
    PeerClosed,
    /// Reading from the peer failed
    ReadError,
    /// Nothing was received within the read deadline
    LivenessTimeout,
    /// The server is shutting down
    Shutdown,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WriteFailed => "write_failed",
            Self::HeartbeatFailed => "heartbeat_failed",
            Self::PeerClosed => "peer_closed",
            Self::ReadError => "read_error",
            Self::LivenessTimeout => "liveness_timeout",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Verdict returned for each member visited by `for_each`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Keep,
    Remove(RemovalReason),
}

/// Result of one `for_each` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Members visited
    pub visited: usize,
    /// Members removed after the pass
    pub removed: usize,
}

/// Thread-safe set of live listener connections.
///
/// Cheap to clone; clones share the same set.
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<Mutex<HashMap<ConnectionId, Connection>>>,
    next_id: Arc<AtomicU64>,
    close_timeout: Duration,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    ///
    /// # Arguments
    ///
    /// * `close_timeout` - Bound on the close frame and close of a removed connection
    pub fn new(close_timeout: Duration) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            close_timeout,
        }
    }

    /// Allocates a fresh connection id.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Inserts a connection.
    pub async fn add(&self, connection: Connection) {
        let id = connection.id();
        let peer = connection.peer().map(str::to_string);

        let size = {
            let mut connections = self.connections.lock().await;
            connections.insert(id, connection);
            connections.len()
        };

        info!(connection = %id, peer = ?peer, listeners = size, "Listener registered");
    }

    /// Removes a connection and closes it.
    ///
    /// Returns `false` (and does nothing) if the connection is not
    /// registered, which makes removal safe to request from several tasks.
    pub async fn remove(&self, id: ConnectionId, reason: RemovalReason) -> bool {
        let (removed, remaining) = {
            let mut connections = self.connections.lock().await;
            let removed = connections.remove(&id);
            (removed, connections.len())
        };

        match removed {
            Some(connection) => {
                self.close(&connection, reason, remaining).await;
                true
            }
            None => {
                debug!(connection = %id, reason = %reason, "Removal of unregistered listener ignored");
                false
            }
        }
    }

    /// Returns the current number of connections.
    pub async fn size(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Returns true if the connection is registered.
    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().await.contains_key(&id)
    }

    /// Visits every connection while holding the registry lock.
    ///
    /// `visit` is awaited once per member; members for which it returns
    /// `Visit::Remove` are taken out after the whole pass. They are marked
    /// closed before this returns, and their close handshakes run on a
    /// separate task so the caller never waits on a dead listener.
    pub async fn for_each<F, Fut>(&self, mut visit: F) -> PassSummary
    where
        F: FnMut(Connection) -> Fut,
        Fut: Future<Output = Visit>,
    {
        let mut summary = PassSummary::default();

        let (doomed, remaining) = {
            let mut connections = self.connections.lock().await;
            let mut marked = Vec::new();

            for connection in connections.values() {
                summary.visited += 1;
                if let Visit::Remove(reason) = visit(connection.clone()).await {
                    marked.push((connection.id(), reason));
                }
            }

            let doomed: Vec<(Connection, RemovalReason)> = marked
                .into_iter()
                .filter_map(|(id, reason)| connections.remove(&id).map(|c| (c, reason)))
                .collect();
            (doomed, connections.len())
        };

        summary.removed = doomed.len();
        for (connection, reason) in doomed {
            self.close_detached(connection, reason, remaining);
        }

        summary
    }

    /// Removes and closes every connection.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Connection> = {
            let mut connections = self.connections.lock().await;
            connections.drain().map(|(_, c)| c).collect()
        };

        let count = drained.len();
        for connection in drained {
            self.close(&connection, RemovalReason::Shutdown, 0).await;
        }
        count
    }

    async fn close(&self, connection: &Connection, reason: RemovalReason, remaining: usize) {
        connection.shutdown(self.close_timeout).await;
        log_removed(connection, reason, remaining);
    }

    fn close_detached(&self, connection: Connection, reason: RemovalReason, remaining: usize) {
        if !connection.begin_close() {
            return;
        }
        let close_timeout = self.close_timeout;
        tokio::spawn(async move {
            connection.close_handshake(close_timeout).await;
            log_removed(&connection, reason, remaining);
        });
    }
}

fn log_removed(connection: &Connection, reason: RemovalReason, remaining: usize) {
    info!(
        connection = %connection.id(),
        peer = ?connection.peer(),
        reason = %reason,
        last_activity = %connection.last_activity(),
        listeners = remaining,
        "Listener removed"
    );
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CLOSE_TIMEOUT)
    }
}
