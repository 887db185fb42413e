//! Common error types for the relay and its collaborators

use thiserror::Error;

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Result type for ownership lookups
pub type LookupResult<T> = Result<T, LookupError>;

/// Errors surfaced by relay components
#[derive(Debug, Error)]
pub enum RelayError {
    /// Binding or accepting on the downstream listener failed
    #[error("Listener error: {0}")]
    Listener(#[from] std::io::Error),

    /// Relay was asked to start twice, or used after stop
    #[error("Invalid lifecycle transition: {0}")]
    Lifecycle(String),

    /// Configuration rejected before start
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The relay hub task is gone
    #[error("Relay hub unavailable")]
    HubClosed,
}

/// Errors from the external device/vehicle registry
#[derive(Debug, Error, Clone)]
pub enum LookupError {
    /// Registry could not be reached
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    /// Registry answered with something we could not interpret
    #[error("Unexpected registry response: {0}")]
    InvalidResponse(String),
}

/// Errors from downstream token verification
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No token was supplied
    #[error("Missing token")]
    Missing,

    /// Token failed signature or structural checks
    #[error("Invalid token: {0}")]
    Invalid(String),

    /// Token was valid once but has expired
    #[error("Token expired")]
    Expired,
}

impl AuthError {
    /// HTTP status used when rejecting an upgrade for this error
    pub fn status_code(&self) -> u16 {
        401
    }
}
