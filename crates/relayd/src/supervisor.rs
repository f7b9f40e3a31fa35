//! Per-connection liveness supervision.
//!
//! Every admitted connection gets two tasks:
//! - a heartbeat sender that writes a ping every `ping_period`
//! - a liveness reader that waits for inbound frames with a deadline of
//!   `read_deadline`, refreshed by every frame (pongs included)
//!
//! Either task may remove the connection from the registry; removal is
//! idempotent and cancels the connection's token, which stops the other
//! task. A connection therefore goes `OPEN -> CLOSING -> REMOVED` exactly
//! once, whichever side notices the failure first.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Every failure ends in a registry removal and a log line

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::registry::{
    Connection, ConnectionRegistry, Frame, FrameStream, RemovalReason, CLOSE_GOING_AWAY,
};

/// Default interval between heartbeat pings.
pub const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(30);

/// Default time allowed between inbound frames.
pub const DEFAULT_READ_DEADLINE: Duration = Duration::from_secs(60);

/// Default bound on a single write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timing of the liveness supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Interval between heartbeat pings
    pub ping_period: Duration,
    /// Time allowed between inbound frames
    pub read_deadline: Duration,
    /// Bound on each heartbeat write
    pub write_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_period: DEFAULT_PING_PERIOD,
            read_deadline: DEFAULT_READ_DEADLINE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Join handles for one connection's supervisor tasks.
pub struct SupervisorHandles {
    pub heartbeat: JoinHandle<()>,
    pub reader: JoinHandle<()>,
}

impl SupervisorHandles {
    /// Waits for both tasks to finish.
    pub async fn join(self) {
        let _ = self.heartbeat.await;
        let _ = self.reader.await;
    }
}

/// Spawns the heartbeat sender and liveness reader for a connection.
///
/// The connection should already be registered; both tasks stop when its
/// cancellation token fires.
pub fn spawn_supervisor(
    registry: ConnectionRegistry,
    connection: Connection,
    stream: Box<dyn FrameStream>,
    config: LivenessConfig,
) -> SupervisorHandles {
    let heartbeat = tokio::spawn(run_heartbeat(
        registry.clone(),
        connection.clone(),
        config,
    ));
    let reader = tokio::spawn(run_liveness_reader(registry, connection, stream, config));

    SupervisorHandles { heartbeat, reader }
}

/// Sends a ping every `ping_period` until the connection is cancelled or
/// a write fails.
async fn run_heartbeat(registry: ConnectionRegistry, connection: Connection, config: LivenessConfig) {
    let cancel = connection.cancel_token().clone();
    let mut ticker = interval_at(Instant::now() + config.ping_period, config.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {
                if let Err(e) = connection.send(Frame::Ping, config.write_timeout).await {
                    debug!(
                        connection = %connection.id(),
                        error = %e,
                        "Heartbeat failed"
                    );
                    registry.remove(connection.id(), RemovalReason::HeartbeatFailed).await;
                    break;
                }
                trace!(connection = %connection.id(), "Heartbeat sent");
            }
        }
    }

    debug!(connection = %connection.id(), "Heartbeat task stopped");
}

/// Reads inbound frames until the peer goes away, a read fails, the read
/// deadline passes, or the connection is cancelled.
async fn run_liveness_reader(
    registry: ConnectionRegistry,
    connection: Connection,
    mut stream: Box<dyn FrameStream>,
    config: LivenessConfig,
) {
    let cancel = connection.cancel_token().clone();

    let reason = loop {
        let next = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(connection = %connection.id(), "Liveness reader stopped");
                return;
            }

            next = timeout(config.read_deadline, stream.recv()) => next,
        };

        match next {
            Err(_) => {
                debug!(
                    connection = %connection.id(),
                    deadline_secs = config.read_deadline.as_secs_f64(),
                    "No frames within read deadline"
                );
                break RemovalReason::LivenessTimeout;
            }
            Ok(None) => break RemovalReason::PeerClosed,
            Ok(Some(Err(e))) => {
                debug!(connection = %connection.id(), error = %e, "Read failed");
                break RemovalReason::ReadError;
            }
            Ok(Some(Ok(frame))) => {
                connection.touch();
                match frame {
                    Frame::Close(code) => {
                        if code == Some(CLOSE_GOING_AWAY) {
                            info!(connection = %connection.id(), "Listener going away");
                        } else {
                            debug!(connection = %connection.id(), code = ?code, "Listener closed");
                        }
                        break RemovalReason::PeerClosed;
                    }
                    Frame::Text(text) => {
                        info!(connection = %connection.id(), message = %text, "Received message from listener");
                    }
                    Frame::Binary(data) => {
                        debug!(connection = %connection.id(), bytes = data.len(), "Ignoring binary message");
                    }
                    Frame::Ping | Frame::Pong => {
                        trace!(connection = %connection.id(), "Liveness frame received");
                    }
                }
            }
        }
    };

    registry.remove(connection.id(), reason).await;
}
