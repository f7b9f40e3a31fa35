//! Relay Core - Shared types for the event relay
//!
//! This crate provides the domain types shared between the wire
//! protocol (relay-protocol) and the daemon (relayd):
//! - `event` - the hub event record and its routing metadata
//! - `filter` - the allow-set deciding which events reach listeners
//! - `identity` - the system identity used to stamp outbound events
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod event;
pub mod filter;
pub mod identity;

// Re-exports for convenience
pub use error::{DomainError, DomainResult, IdentityError};
pub use event::{BasicDeviceInfo, BasicRoomInfo, Event, DETAIL_STATE_TAG, WEBSOCKET_COUNT_KEY};
pub use filter::{KeyFilter, DEFAULT_FORWARDED_KEYS};
pub use identity::{EnvIdentity, IdentityProvider, SystemIdentity, SYSTEM_ID_ENV};
