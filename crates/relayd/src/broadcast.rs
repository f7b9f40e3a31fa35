//! Event fan-out to listeners.
//!
//! For every inbound event the broadcaster:
//! 1. Drops it unless its key is in the allow-set
//! 2. Encodes the wire payload once
//! 3. Writes it to every registered connection, each write bounded by
//!    the write timeout
//! 4. Removes (and closes) every connection whose write failed
//!
//! A failing listener never stops delivery to the others; it only costs
//! the pass its own write deadline.

use std::sync::Arc;
use std::time::Duration;

use relay_core::{Event, KeyFilter};
use relay_protocol::encode_event;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::{ConnectionRegistry, Frame, RemovalReason, Visit};
use crate::supervisor::DEFAULT_WRITE_TIMEOUT;

/// Outcome of one broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections a write was attempted on
    pub attempted: usize,
    /// Connections that accepted the write
    pub delivered: usize,
    /// Connections removed because the write failed
    pub removed: usize,
}

/// Forwards allowed events to every registered connection.
#[derive(Clone)]
pub struct Broadcaster {
    registry: ConnectionRegistry,
    filter: Arc<KeyFilter>,
    write_timeout: Duration,
}

impl Broadcaster {
    /// Creates a broadcaster over the given registry.
    pub fn new(registry: ConnectionRegistry, filter: KeyFilter) -> Self {
        Self {
            registry,
            filter: Arc::new(filter),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Sets the bound on each per-connection write.
    #[must_use]
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn filter(&self) -> &KeyFilter {
        &self.filter
    }

    /// Handles one inbound event.
    ///
    /// Returns `None` if the event was filtered out (or could not be
    /// encoded); otherwise reports the pass.
    pub async fn on_event(&self, event: &Event) -> Option<BroadcastReport> {
        if !self.filter.matches(event) {
            return None;
        }

        let payload = match encode_event(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(key = %event.key, error = %e, "Failed to encode event");
                return None;
            }
        };

        let write_timeout = self.write_timeout;
        let summary = self
            .registry
            .for_each(|connection| {
                let frame = Frame::Text(payload.clone());
                async move {
                    match connection.send(frame, write_timeout).await {
                        Ok(()) => Visit::Keep,
                        Err(e) => {
                            warn!(
                                connection = %connection.id(),
                                error = %e,
                                "Failed to forward event to listener"
                            );
                            Visit::Remove(RemovalReason::WriteFailed)
                        }
                    }
                }
            })
            .await;

        let report = BroadcastReport {
            attempted: summary.visited,
            delivered: summary.visited - summary.removed,
            removed: summary.removed,
        };

        debug!(
            key = %event.key,
            attempted = report.attempted,
            delivered = report.delivered,
            removed = report.removed,
            "Event forwarded"
        );

        Some(report)
    }

    /// Consumes events until the channel closes or `cancel` fires.
    ///
    /// Events are handled one at a time, so broadcast passes never overlap.
    pub async fn run(self, mut events: mpsc::Receiver<Event>, cancel: CancellationToken) {
        info!(keys = ?self.filter.keys(), "Broadcaster started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Broadcaster shutting down");
                    break;
                }

                event = events.recv() => {
                    match event {
                        Some(event) => {
                            self.on_event(&event).await;
                        }
                        None => {
                            debug!("Event source closed");
                            break;
                        }
                    }
                }
            }
        }

        info!("Broadcaster stopped");
    }

    /// Spawns `run` on a new task.
    pub fn spawn(self, events: mpsc::Receiver<Event>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(events, cancel))
    }
}
