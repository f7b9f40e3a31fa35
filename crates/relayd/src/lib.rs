//! Relay Daemon - Connection registry and WebSocket fan-out server
//!
//! This crate provides the core infrastructure for the relay daemon:
//! - `registry` - the synchronized set of live listener connections
//! - `broadcast` - filtered fan-out of hub events to every listener
//! - `supervisor` - per-connection heartbeat and liveness deadline
//! - `server` - WebSocket admission of listeners
//! - `hub` - client for the upstream event hub
//! - `telemetry` - periodic listener count report
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        relayd daemon                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐  events  ┌─────────────────────────┐   │
//! │  │   HubClient     │─────────▶│      Broadcaster        │   │
//! │  │ (hub WebSocket) │          │ (filter + fan-out)      │   │
//! │  └────────▲────────┘          └────────────┬────────────┘   │
//! │           │ publish                        │ for_each       │
//! │  ┌────────┴────────┐   size   ┌────────────▼────────────┐   │
//! │  │TelemetryReporter│─────────▶│   ConnectionRegistry    │   │
//! │  └─────────────────┘          └────────────▲────────────┘   │
//! │                                            │ add / remove   │
//! │  ┌─────────────────┐  admit   ┌────────────┴────────────┐   │
//! │  │  RelayServer    │─────────▶│ heartbeat + liveness    │   │
//! │  │ (GET /websocket)│          │ (per connection)        │   │
//! │  └─────────────────┘          └─────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod broadcast;
pub mod config;
pub mod hub;
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod telemetry;
