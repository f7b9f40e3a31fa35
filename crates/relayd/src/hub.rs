//! Client for the central event hub.
//!
//! The hub client owns the single WebSocket connection to the hub:
//! - inbound text frames are decoded into events and pushed onto the
//!   broadcaster's channel
//! - events handed to `publish` are buffered and written to the hub
//! - a dropped connection is re-established with linear backoff
//!
//! The relay core never talks to the hub directly; it only sees the event
//! channel and the `EventPublisher` trait.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection failures are logged and retried, never propagated

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use relay_core::Event;
use relay_protocol::{decode_event, encode_event, ProtocolError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default path of the hub's messenger endpoint.
pub const DEFAULT_HUB_PATH: &str = "/connect/messenger";

/// Default number of outbound events buffered while the hub is slow or down.
pub const DEFAULT_PUBLISH_BUFFER: usize = 1000;

/// Step added to the reconnect delay after each failed attempt.
const RECONNECT_STEP: Duration = Duration::from_millis(500);

/// Upper bound on the reconnect delay.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Sink for events published back to the hub.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Queues an event for delivery to the hub.
    async fn publish(&self, event: Event) -> Result<(), HubError>;
}

/// Errors talking to the hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Failed to connect to hub at {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Hub connection lost: {0}")]
    Transport(String),

    #[error("Hub publish buffer is full")]
    BufferFull,

    #[error("Hub client has stopped")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Hub connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// `host:port` of the hub
    pub address: String,
    /// Path of the messenger endpoint
    pub path: String,
    /// Outbound event buffer size
    pub publish_buffer: usize,
}

impl HubConfig {
    /// Creates settings for the hub at `address` with default path and buffer.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            path: DEFAULT_HUB_PATH.to_string(),
            publish_buffer: DEFAULT_PUBLISH_BUFFER,
        }
    }

    /// Returns the WebSocket URL of the messenger endpoint.
    ///
    /// An address that already carries a `ws://` or `wss://` scheme is
    /// used as-is.
    pub fn url(&self) -> String {
        let address = self.address.trim_end_matches('/');
        if address.starts_with("ws://") || address.starts_with("wss://") {
            format!("{address}{}", self.path)
        } else {
            format!("ws://{address}{}", self.path)
        }
    }
}

/// Handle for publishing events to the hub.
#[derive(Clone)]
pub struct HubClient {
    outbound: mpsc::Sender<Event>,
}

impl HubClient {
    /// Spawns the hub connection task.
    ///
    /// Decoded hub events are sent on `inbound`. The task runs until
    /// `cancel` fires or `inbound` is closed.
    pub fn spawn(
        config: HubConfig,
        inbound: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.publish_buffer.max(1));
        let handle = tokio::spawn(run_hub(config.url(), outbound_rx, inbound, cancel));
        (
            Self {
                outbound: outbound_tx,
            },
            handle,
        )
    }
}

#[async_trait]
impl EventPublisher for HubClient {
    async fn publish(&self, event: Event) -> Result<(), HubError> {
        self.outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HubError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => HubError::Closed,
        })
    }
}

/// How a hub session ended.
enum SessionEnd {
    /// Stop for good (cancelled, or nobody consumes inbound events)
    Shutdown,
    /// Connection dropped; reconnect
    Disconnected,
}

async fn run_hub(
    url: String,
    mut outbound: mpsc::Receiver<Event>,
    inbound: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    let mut failures: u32 = 0;

    loop {
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = connect_async(url.as_str()) => result,
        };

        match connected {
            Ok((socket, _response)) => {
                info!(url = %url, "Connected to hub");
                failures = 0;

                match run_session(socket, &mut outbound, &inbound, &cancel).await {
                    Ok(SessionEnd::Shutdown) => break,
                    Ok(SessionEnd::Disconnected) => {
                        warn!(url = %url, "Hub closed the connection");
                    }
                    Err(e) => {
                        warn!(url = %url, error = %e, "Hub connection failed");
                    }
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let err = HubError::Connect {
                    url: url.clone(),
                    reason: e.to_string(),
                };
                warn!(error = %err, attempt = failures, "Hub unavailable");
            }
        }

        let delay = reconnect_delay(failures);
        debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to hub");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("Hub client stopped");
}

async fn run_session<S>(
    socket: S,
    outbound: &mut mpsc::Receiver<Event>,
    inbound: &mpsc::Sender<Event>,
    cancel: &CancellationToken,
) -> Result<SessionEnd, HubError>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(SessionEnd::Shutdown);
            }

            Some(event) = outbound.recv() => {
                let payload = encode_event(&event)?;
                sink.send(Message::Text(payload.into()))
                    .await
                    .map_err(|e| HubError::Transport(e.to_string()))?;
                debug!(key = %event.key, "Published event to hub");
            }

            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => match decode_event(text.as_str()) {
                        Ok(event) => {
                            if inbound.send(event).await.is_err() {
                                debug!("Inbound event channel closed");
                                return Ok(SessionEnd::Shutdown);
                            }
                        }
                        Err(e) => warn!(error = %e, "Dropping undecodable hub message"),
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Disconnected),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(HubError::Transport(e.to_string())),
                }
            }
        }
    }
}

/// Linear backoff capped at `MAX_RECONNECT_DELAY`.
fn reconnect_delay(failures: u32) -> Duration {
    RECONNECT_STEP
        .saturating_mul(failures.max(1))
        .min(MAX_RECONNECT_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_url() {
        let config = HubConfig::new("hub.local:7100");
        assert_eq!(config.url(), "ws://hub.local:7100/connect/messenger");

        let config = HubConfig::new("wss://hub.local/");
        assert_eq!(config.url(), "wss://hub.local/connect/messenger");
    }

    #[test]
    fn test_reconnect_delay_is_linear_and_capped() {
        assert_eq!(reconnect_delay(0), RECONNECT_STEP);
        assert_eq!(reconnect_delay(1), RECONNECT_STEP);
        assert_eq!(reconnect_delay(3), RECONNECT_STEP * 3);
        assert_eq!(reconnect_delay(1000), MAX_RECONNECT_DELAY);
    }

    #[tokio::test]
    async fn test_publish_reports_full_buffer() {
        let (tx, _rx) = mpsc::channel(1);
        let client = HubClient { outbound: tx };

        client.publish(Event::new("websocket-count", "0")).await.unwrap();
        let err = client
            .publish(Event::new("websocket-count", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::BufferFull));
    }

    #[tokio::test]
    async fn test_publish_reports_closed_client() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let client = HubClient { outbound: tx };

        let err = client.publish(Event::new("websocket-count", "0")).await.unwrap_err();
        assert!(matches!(err, HubError::Closed));
    }
}
