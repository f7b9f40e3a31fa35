//! System identity lookup.
//!
//! The relay stamps outbound telemetry with the identity of the system it
//! runs on. Identities have the shape `BUILDING-ROOM-DEVICE`.

use std::env;
use std::fmt;

use crate::error::IdentityError;
use crate::event::{BasicDeviceInfo, BasicRoomInfo};

/// Environment variable holding the system identity.
pub const SYSTEM_ID_ENV: &str = "SYSTEM_ID";

/// Validated identity of the running system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIdentity {
    id: String,
    device: BasicDeviceInfo,
}

impl SystemIdentity {
    /// Parses an identity of the form `BUILDING-ROOM-DEVICE`.
    ///
    /// # Errors
    ///
    /// Returns `IdentityError::Malformed` if the value does not have exactly
    /// three non-empty segments.
    pub fn parse(value: &str) -> Result<Self, IdentityError> {
        let value = value.trim();
        let segments = value.split('-').count();
        if segments != 3 {
            return Err(IdentityError::Malformed {
                value: value.to_string(),
                reason: format!("expected 3 '-' separated segments, found {segments}"),
            });
        }

        let device = BasicDeviceInfo::from_device_id(value);
        if device.device_id.is_empty() {
            return Err(IdentityError::Malformed {
                value: value.to_string(),
                reason: "segments must not be empty".to_string(),
            });
        }

        Ok(Self {
            id: value.to_string(),
            device,
        })
    }

    /// Returns the full system id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the device info derived from the id.
    pub fn device(&self) -> &BasicDeviceInfo {
        &self.device
    }

    /// Returns the room info derived from the id.
    pub fn room(&self) -> BasicRoomInfo {
        BasicRoomInfo::from_room_id(&self.device.room.room_id)
    }
}

impl fmt::Display for SystemIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Source of the system identity.
///
/// Lookups may be repeated; a provider can start failing or succeeding
/// at any time.
pub trait IdentityProvider: Send + Sync {
    /// Resolves the current system identity.
    fn system_identity(&self) -> Result<SystemIdentity, IdentityError>;
}

/// A fixed identity always resolves to itself.
impl IdentityProvider for SystemIdentity {
    fn system_identity(&self) -> Result<SystemIdentity, IdentityError> {
        Ok(self.clone())
    }
}

/// Reads the identity from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvIdentity {
    variable: String,
}

impl EnvIdentity {
    /// Creates a provider reading the given variable.
    pub fn new(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
        }
    }
}

impl Default for EnvIdentity {
    fn default() -> Self {
        Self::new(SYSTEM_ID_ENV)
    }
}

impl IdentityProvider for EnvIdentity {
    fn system_identity(&self) -> Result<SystemIdentity, IdentityError> {
        match env::var(&self.variable) {
            Ok(value) if !value.trim().is_empty() => SystemIdentity::parse(&value),
            _ => Err(IdentityError::Missing {
                variable: self.variable.clone(),
            }),
        }
    }
}
