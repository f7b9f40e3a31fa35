//! A single listener connection.
//!
//! A `Connection` wraps the write half of a listener's message channel
//! behind a per-connection lock, so the heartbeat sender and the
//! broadcaster never interleave frames. The read half is handed to the
//! liveness reader separately (see `supervisor`).
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Transport failures are mapped to `ConnectionError`

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Close code sent by a peer that is navigating away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Unique identifier for a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates an id from a raw number.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport-neutral message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Application text (event payloads)
    Text(String),
    /// Application binary data (never sent by the relay)
    Binary(Vec<u8>),
    /// Zero-payload liveness check
    Ping,
    /// Acknowledgement of a ping
    Pong,
    /// Close handshake, with the peer's close code if any
    Close(Option<u16>),
}

/// Write half of a listener channel.
#[async_trait]
pub trait FrameSink: Send {
    /// Sends one frame.
    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError>;

    /// Closes the underlying channel.
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Read half of a listener channel.
#[async_trait]
pub trait FrameStream: Send {
    /// Receives the next frame.
    ///
    /// Returns `None` once the peer's stream has ended.
    async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>>;
}

/// Shared, lock-protected writer for one connection.
pub type SharedSink = Arc<Mutex<Box<dyn FrameSink>>>;

/// A registered listener connection.
///
/// Cheap to clone; all clones refer to the same channel. The
/// cancellation token is the signal for this connection's supervisor
/// tasks to stop.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    peer: Option<String>,
    writer: SharedSink,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
    opened_at: DateTime<Utc>,
    /// Milliseconds since the epoch of the last inbound frame
    last_activity: Arc<AtomicI64>,
}

impl Connection {
    /// Creates a connection around the given writer.
    ///
    /// # Arguments
    ///
    /// * `id` - Identity within the registry
    /// * `sink` - Write half of the listener's channel
    /// * `cancel` - Token cancelled when the connection is removed
    pub fn new(id: ConnectionId, sink: impl FrameSink + 'static, cancel: CancellationToken) -> Self {
        let now = Utc::now();
        Self {
            id,
            peer: None,
            writer: Arc::new(Mutex::new(Box::new(sink))),
            cancel,
            closed: Arc::new(AtomicBool::new(false)),
            opened_at: now,
            last_activity: Arc::new(AtomicI64::new(now.timestamp_millis())),
        }
    }

    /// Attaches the peer address used in log output.
    #[must_use]
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Returns the token cancelled when this connection is removed.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns true once the connection has been shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Records inbound activity (any frame, including pongs).
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Returns the time of the last inbound frame (or admission).
    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::Relaxed))
            .unwrap_or(self.opened_at)
    }

    /// Writes one frame, bounded by `deadline`.
    ///
    /// The deadline covers both the wait for the per-connection write lock
    /// and the write itself, so a writer stalled on another task costs at
    /// most one deadline.
    pub async fn send(&self, frame: Frame, deadline: Duration) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let write = async {
            let mut writer = self.writer.lock().await;
            writer.send(frame).await
        };
        match timeout(deadline, write).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }

    /// Marks the connection closed and cancels its supervisor tasks.
    ///
    /// Returns `false` if it was already closed.
    pub(crate) fn begin_close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Sends a close frame and closes the channel, best-effort.
    ///
    /// Lock wait, close frame and close together are bounded by `deadline`.
    pub(crate) async fn close_handshake(&self, deadline: Duration) {
        let handshake = async {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.send(Frame::Close(None)).await {
                debug!(connection = %self.id, error = %e, "Close frame not delivered");
            }
            writer.close().await
        };

        match timeout(deadline, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(connection = %self.id, error = %e, "Channel close failed"),
            Err(_) => debug!(connection = %self.id, "Close handshake timed out"),
        }
    }

    /// Cancels the supervisor tasks, sends a close frame and closes the
    /// channel. Only the first call has any effect.
    pub(crate) async fn shutdown(&self, deadline: Duration) {
        if self.begin_close() {
            self.close_handshake(deadline).await;
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .field("opened_at", &self.opened_at)
            .finish()
    }
}

/// Errors on a single listener connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Closed,

    #[error("Write timeout")]
    WriteTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default, Clone)]
    struct CountingSink {
        sent: Arc<std::sync::Mutex<Vec<Frame>>>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameSink for CountingSink {
        async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ConnectionError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StalledSink;

    #[async_trait]
    impl FrameSink for StalledSink {
        async fn send(&mut self, _frame: Frame) -> Result<(), ConnectionError> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(7).to_string(), "conn-7");
    }

    #[tokio::test]
    async fn test_send_writes_frame() {
        let sink = CountingSink::default();
        let conn = Connection::new(ConnectionId::new(1), sink.clone(), CancellationToken::new());

        conn.send(Frame::Text("hello".into()), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(*sink.sent.lock().unwrap(), vec![Frame::Text("hello".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_on_stalled_writer() {
        let conn = Connection::new(ConnectionId::new(1), StalledSink, CancellationToken::new());

        let err = conn
            .send(Frame::Ping, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err, ConnectionError::WriteTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_wait_counts_against_deadline() {
        let conn = Connection::new(ConnectionId::new(1), StalledSink, CancellationToken::new());
        let deadline = Duration::from_secs(10);

        let holder = conn.clone();
        let first = tokio::spawn(async move { holder.send(Frame::Ping, deadline).await });
        tokio::task::yield_now().await;

        let start = tokio::time::Instant::now();
        let err = conn
            .send(Frame::Text("event".into()), deadline)
            .await
            .unwrap_err();

        assert_eq!(err, ConnectionError::WriteTimeout);
        assert!(start.elapsed() <= deadline, "took {:?}", start.elapsed());
        assert_eq!(first.await.unwrap(), Err(ConnectionError::WriteTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_handshake_bounded_by_one_deadline() {
        let conn = Connection::new(ConnectionId::new(1), StalledSink, CancellationToken::new());
        let deadline = Duration::from_secs(10);

        let start = tokio::time::Instant::now();
        conn.shutdown(deadline).await;

        assert!(start.elapsed() <= deadline);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let sink = CountingSink::default();
        let token = CancellationToken::new();
        let conn = Connection::new(ConnectionId::new(1), sink.clone(), token.clone());

        conn.shutdown(Duration::from_secs(1)).await;
        conn.shutdown(Duration::from_secs(1)).await;

        assert!(conn.is_closed());
        assert!(token.is_cancelled());
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
        assert_eq!(*sink.sent.lock().unwrap(), vec![Frame::Close(None)]);
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let conn = Connection::new(
            ConnectionId::new(1),
            CountingSink::default(),
            CancellationToken::new(),
        );
        conn.shutdown(Duration::from_secs(1)).await;

        let err = conn
            .send(Frame::Text("late".into()), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, ConnectionError::Closed);
    }

    #[test]
    fn test_touch_updates_last_activity() {
        let conn = Connection::new(
            ConnectionId::new(1),
            CountingSink::default(),
            CancellationToken::new(),
        );
        let before = conn.last_activity();
        conn.touch();
        assert!(conn.last_activity() >= before);
    }
}
