//! Event payload encoding.
//!
//! An event travels as a single JSON object using the hub's field names
//! (`key`, `value`, `timestamp`, `target-device`, ...), so a browser
//! listener can decode it without any schema negotiation.

use relay_core::Event;
use thiserror::Error;

/// Maximum size of a frame accepted from a listener (bytes).
///
/// Listeners are receive-only; anything they send is informational.
pub const MAX_LISTENER_MESSAGE_SIZE: usize = 512;

/// Maximum size of an event frame accepted from the hub (1 MB).
pub const MAX_HUB_MESSAGE_SIZE: usize = 1_048_576;

/// Errors encoding or decoding event payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to encode event '{key}': {reason}")]
    Encode { key: String, reason: String },

    #[error("Failed to decode event: {0}")]
    Decode(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Serializes an event into its wire payload.
pub fn encode_event(event: &Event) -> Result<String, ProtocolError> {
    serde_json::to_string(event).map_err(|e| ProtocolError::Encode {
        key: event.key.clone(),
        reason: e.to_string(),
    })
}

/// Parses a wire payload received from the hub.
///
/// Missing fields take their defaults; payloads larger than
/// `MAX_HUB_MESSAGE_SIZE` are rejected before parsing.
pub fn decode_event(payload: &str) -> Result<Event, ProtocolError> {
    if payload.len() > MAX_HUB_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len(),
            max: MAX_HUB_MESSAGE_SIZE,
        });
    }

    serde_json::from_str(payload).map_err(|e| ProtocolError::Decode(e.to_string()))
}
