//! Integration tests for the hub client.
//!
//! A fake hub is served with axum on a loopback port. It pushes a scripted
//! list of events to every session and records what the relay publishes.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use relay_core::{Event, KeyFilter, SystemIdentity};
use relay_protocol::encode_event;
use relayd::broadcast::Broadcaster;
use relayd::config::RelayConfig;
use relayd::hub::{EventPublisher, HubClient, HubConfig, DEFAULT_HUB_PATH};
use relayd::registry::ConnectionRegistry;
use relayd::server::{RelayServer, WEBSOCKET_PATH};
use relayd::telemetry::TelemetryReporter;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for a message on either side
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Fake Hub
// ============================================================================

#[derive(Clone)]
struct HubState {
    /// Events pushed to each new session
    script: Arc<Vec<Event>>,
    /// Close each session after the script has been sent
    hang_up: bool,
    sessions: Arc<AtomicUsize>,
    received: mpsc::UnboundedSender<String>,
}

struct FakeHub {
    addr: SocketAddr,
    sessions: Arc<AtomicUsize>,
    received: mpsc::UnboundedReceiver<String>,
}

impl FakeHub {
    async fn spawn(script: Vec<Event>, hang_up: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind hub");
        let addr = listener.local_addr().expect("hub addr");
        let (received_tx, received) = mpsc::unbounded_channel();
        let sessions = Arc::new(AtomicUsize::new(0));

        let state = HubState {
            script: Arc::new(script),
            hang_up,
            sessions: sessions.clone(),
            received: received_tx,
        };
        let app = Router::new()
            .route(DEFAULT_HUB_PATH, get(hub_handler))
            .with_state(state);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            sessions,
            received,
        }
    }

    fn config(&self) -> HubConfig {
        HubConfig::new(self.addr.to_string())
    }

    /// Waits for the next text frame the relay sent to the hub.
    async fn next_published(&mut self) -> serde_json::Value {
        let text = timeout(RECV_TIMEOUT, self.received.recv())
            .await
            .expect("publish in time")
            .expect("hub running");
        serde_json::from_str(&text).expect("published payload is JSON")
    }
}

async fn hub_handler(State(state): State<HubState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| hub_session(state, socket))
}

async fn hub_session(state: HubState, socket: WebSocket) {
    state.sessions.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut stream) = socket.split();

    for event in state.script.iter() {
        let payload = encode_event(event).expect("encode scripted event");
        if sink.send(Message::Text(payload.into())).await.is_err() {
            return;
        }
    }

    if state.hang_up {
        let _ = sink.send(Message::Close(None)).await;
        return;
    }

    while let Some(Ok(message)) = stream.next().await {
        if let Message::Text(text) = message {
            let _ = state.received.send(text.to_string());
        }
    }
}

async fn recv_event(rx: &mut mpsc::Receiver<Event>) -> Event {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("event in time")
        .expect("hub client running")
}

// ============================================================================
// Hub Client
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hub_events_are_decoded_onto_channel() {
    let hub = FakeHub::spawn(
        vec![
            Event::new("login", "userX"),
            Event::new("heartbeat-data", "ignored-downstream"),
        ],
        false,
    )
    .await;
    let (tx, mut rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let (_client, handle) = HubClient::spawn(hub.config(), tx, cancel.clone());

    let first = recv_event(&mut rx).await;
    assert_eq!(first.key, "login");
    assert_eq!(first.value, "userX");

    // The hub client forwards everything; filtering happens in the broadcaster
    let second = recv_event(&mut rx).await;
    assert_eq!(second.key, "heartbeat-data");

    cancel.cancel();
    timeout(RECV_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_published_events_reach_hub() {
    let mut hub = FakeHub::spawn(Vec::new(), false).await;
    let (tx, _rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let (client, _handle) = HubClient::spawn(hub.config(), tx, cancel.clone());

    client
        .publish(Event::new("websocket-count", "4"))
        .await
        .unwrap();

    let json = hub.next_published().await;
    assert_eq!(json["key"], "websocket-count");
    assert_eq!(json["value"], "4");
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_reconnects_after_hub_hangs_up() {
    let hub = FakeHub::spawn(vec![Event::new("login", "again")], true).await;
    let (tx, mut rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let (_client, _handle) = HubClient::spawn(hub.config(), tx, cancel.clone());

    assert_eq!(recv_event(&mut rx).await.value, "again");
    assert_eq!(recv_event(&mut rx).await.value, "again");
    assert!(hub.sessions.load(Ordering::SeqCst) >= 2);
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_retries_until_hub_appears() {
    // Reserve a port, then free it so the first attempts are refused
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let (tx, mut rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let (_client, _handle) = HubClient::spawn(HubConfig::new(addr.to_string()), tx, cancel.clone());

    sleep(Duration::from_millis(300)).await;

    let listener = TcpListener::bind(addr).await.expect("rebind hub port");
    let (received_tx, _received) = mpsc::unbounded_channel();
    let state = HubState {
        script: Arc::new(vec![Event::new("login", "late hub")]),
        hang_up: false,
        sessions: Arc::new(AtomicUsize::new(0)),
        received: received_tx,
    };
    let app = Router::new()
        .route(DEFAULT_HUB_PATH, get(hub_handler))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    assert_eq!(recv_event(&mut rx).await.value, "late hub");
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_stops_on_cancel_while_disconnected() {
    let (tx, _rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let (client, handle) = HubClient::spawn(HubConfig::new("127.0.0.1:1"), tx, cancel.clone());

    sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    timeout(RECV_TIMEOUT, handle).await.unwrap().unwrap();

    assert!(client.publish(Event::new("websocket-count", "0")).await.is_err());
}

// ============================================================================
// End to End
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hub_event_reaches_listener_and_count_reaches_hub() {
    let mut hub = FakeHub::spawn(Vec::new(), false).await;
    let cancel = CancellationToken::new();

    // Relay
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = listener.local_addr().unwrap();
    let config = RelayConfig {
        listen_addr: relay_addr,
        ..RelayConfig::default()
    };
    let registry = ConnectionRegistry::default();
    let (event_tx, event_rx) = mpsc::channel(16);
    Broadcaster::new(registry.clone(), KeyFilter::default()).spawn(event_rx, cancel.clone());
    let (hub_client, _hub_handle) = HubClient::spawn(hub.config(), event_tx, cancel.clone());
    let server = RelayServer::new(&config, registry.clone(), cancel.clone());
    tokio::spawn(async move { server.serve(listener).await });

    // Listener
    let url = format!("ws://{relay_addr}{WEBSOCKET_PATH}");
    let (mut client, _) = connect_async(url).await.expect("listener connect");
    let start = Instant::now();
    while registry.size().await != 1 {
        assert!(start.elapsed() < RECV_TIMEOUT, "listener not registered");
        sleep(Duration::from_millis(10)).await;
    }

    // Count report travels relay -> hub
    let identity = Arc::new(SystemIdentity::parse("ITB-1101-CP1").unwrap());
    let mut reporter = TelemetryReporter::new(registry.clone(), Arc::new(hub_client), identity);
    reporter.report_once().await;

    let report = hub.next_published().await;
    assert_eq!(report["key"], "websocket-count");
    assert_eq!(report["value"], "1");
    assert_eq!(report["generating-system"], "ITB-1101-CP1");
    assert_eq!(report["target-device"]["deviceID"], "ITB-1101-CP1");
    assert_eq!(report["affected-room"]["roomID"], "ITB-1101");

    cancel.cancel();
    let _ = client.close(None).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scripted_hub_event_delivered_to_listener() {
    let hub_events = vec![
        Event::new("heartbeat-data", "filtered"),
        Event::new("login", "from hub"),
    ];
    let cancel = CancellationToken::new();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = listener.local_addr().unwrap();
    let config = RelayConfig {
        listen_addr: relay_addr,
        ..RelayConfig::default()
    };
    let registry = ConnectionRegistry::default();
    let server = RelayServer::new(&config, registry.clone(), cancel.clone());
    tokio::spawn(async move { server.serve(listener).await });

    let url = format!("ws://{relay_addr}{WEBSOCKET_PATH}");
    let (mut client, _) = connect_async(url).await.expect("listener connect");
    let start = Instant::now();
    while registry.size().await != 1 {
        assert!(start.elapsed() < RECV_TIMEOUT, "listener not registered");
        sleep(Duration::from_millis(10)).await;
    }

    // Connect the hub only once the listener is in place
    let hub = FakeHub::spawn(hub_events, false).await;
    let (event_tx, event_rx) = mpsc::channel(16);
    Broadcaster::new(registry.clone(), KeyFilter::default()).spawn(event_rx, cancel.clone());
    let (_hub_client, _hub_handle) = HubClient::spawn(hub.config(), event_tx, cancel.clone());

    let text = loop {
        let message = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("event in time")
            .expect("stream open")
            .expect("valid frame");
        if let tokio_tungstenite::tungstenite::Message::Text(text) = message {
            break text.to_string();
        }
    };
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["key"], "login");
    assert_eq!(json["value"], "from hub");

    cancel.cancel();
}
