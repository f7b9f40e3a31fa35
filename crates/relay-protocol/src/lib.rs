//! Relay Protocol - Wire payloads for the event relay
//!
//! Listeners and the hub both exchange events as self-describing JSON
//! text frames. This crate owns that encoding so the daemon never
//! serializes events by hand.

pub mod message;

pub use message::{
    decode_event, encode_event, ProtocolError, MAX_HUB_MESSAGE_SIZE, MAX_LISTENER_MESSAGE_SIZE,
};
