//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

/// Errors resolving the identity of the running system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The identity variable is not set (or empty)
    #[error("System identity is not set ({variable})")]
    Missing { variable: String },

    /// The identity does not have the `BUILDING-ROOM-DEVICE` shape
    #[error("Malformed system identity '{value}': {reason}")]
    Malformed { value: String, reason: String },
}
