//! HTTP/WebSocket server for listeners.
//!
//! The server:
//! - Accepts `GET /websocket` upgrade requests
//! - Registers each upgraded socket in the `ConnectionRegistry`
//! - Starts the heartbeat and liveness tasks for it
//! - Closes every connection on graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   RelayServer   │
//! │  TcpListener    │
//! └───────┬─────────┘
//!         │ upgrade
//!         ▼
//! ┌─────────────────┐     ┌──────────────────────┐
//! │   admission     │────▶│  ConnectionRegistry  │◀── Broadcaster
//! └───────┬─────────┘     └──────────────────────┘
//!         │ spawn
//!         ▼
//! ┌─────────────────┐
//! │ heartbeat +     │
//! │ liveness reader │
//! └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Admission errors are logged and allow continued operation

mod transport;

pub use transport::{split, WebSocketSink, WebSocketSource};

use std::net::SocketAddr;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::registry::{Connection, ConnectionRegistry, FrameStream};
use crate::supervisor::{spawn_supervisor, LivenessConfig};

/// Path listeners connect to.
pub const WEBSOCKET_PATH: &str = "/websocket";

/// State shared by the admission handler.
#[derive(Clone)]
struct AdmissionState {
    registry: ConnectionRegistry,
    liveness: LivenessConfig,
    max_message_size: usize,
    cancel: CancellationToken,
}

/// WebSocket server admitting listeners into the registry.
pub struct RelayServer {
    listen_addr: SocketAddr,
    state: AdmissionState,
}

impl RelayServer {
    /// Creates a new relay server.
    ///
    /// # Arguments
    ///
    /// * `config` - Listen address, liveness timing and message size limit
    /// * `registry` - Registry that admitted connections are added to
    /// * `cancel_token` - Token for graceful shutdown
    pub fn new(
        config: &RelayConfig,
        registry: ConnectionRegistry,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            listen_addr: config.listen_addr,
            state: AdmissionState {
                registry,
                liveness: config.liveness,
                max_message_size: config.max_message_size,
                cancel: cancel_token,
            },
        }
    }

    /// Returns the configured listen address.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Builds the router serving the listener endpoint.
    pub fn router(&self) -> Router {
        Router::new()
            .route(WEBSOCKET_PATH, get(websocket_handler))
            .with_state(self.state.clone())
    }

    /// Binds the configured address and serves until cancelled.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: self.listen_addr,
                error: e.to_string(),
            })?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener until cancelled.
    ///
    /// On shutdown every registered connection is sent a close frame
    /// before the server stops accepting.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Serve(e.to_string()))?;
        info!(addr = %local_addr, path = WEBSOCKET_PATH, "Relay server listening");

        let cancel = self.state.cancel.clone();
        let registry = self.state.registry.clone();
        let result = axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            let closed = registry.close_all().await;
            info!(closed, "Closed all listeners");
        })
        .await
        .map_err(|e| ServerError::Serve(e.to_string()));

        // Upgrades completing during the drain
        let stragglers = self.state.registry.close_all().await;
        info!(stragglers, "Server shutdown complete");

        result
    }
}

async fn websocket_handler(
    State(state): State<AdmissionState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            warn!(peer = %peer, error = %rejection, "Rejected listener upgrade");
            return rejection.into_response();
        }
    };

    upgrade
        .max_message_size(state.max_message_size)
        .on_failed_upgrade(move |e| {
            error!(peer = %peer, error = %e, "Error while upgrading listener connection");
        })
        .on_upgrade(move |socket| admit(state, socket, peer))
}

/// Registers an upgraded socket and starts its supervisor tasks.
async fn admit(state: AdmissionState, socket: WebSocket, peer: SocketAddr) {
    let (sink, source) = split(socket);
    let connection = Connection::new(state.registry.next_id(), sink, state.cancel.child_token())
        .with_peer(peer.to_string());

    admit_connection(&state, connection, Box::new(source)).await;
}

/// Adds a connection to the registry, or closes it if the server is
/// shutting down. Returns true if the connection was registered.
async fn admit_connection(
    state: &AdmissionState,
    connection: Connection,
    source: Box<dyn FrameStream>,
) -> bool {
    if state.cancel.is_cancelled() {
        debug!(connection = %connection.id(), "Server shutting down, closing new listener");
        connection.shutdown(state.liveness.write_timeout).await;
        return false;
    }

    state.registry.add(connection.clone()).await;
    spawn_supervisor(state.registry.clone(), connection, source, state.liveness);
    true
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("Server error: {0}")]
    Serve(String),
}
