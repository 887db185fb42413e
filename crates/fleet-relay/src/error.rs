//! Error types for the relay's network edges

use std::io;

use fleet_core::AuthError;
use thiserror::Error;

/// Reasons a downstream upgrade request is refused
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Request head did not fit in the configured buffer
    #[error("Request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    /// Request line or headers could not be parsed
    #[error("Malformed request: {0}")]
    Malformed(String),

    /// Path other than the relay's socket path
    #[error("No socket at path: {0}")]
    NotFound(String),

    /// Method other than GET
    #[error("Method not allowed: {0}")]
    Method(String),

    /// Missing `Upgrade: websocket`
    #[error("Not a websocket upgrade request")]
    NotUpgrade,

    /// Token missing or rejected by the verifier
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    /// Missing `Sec-WebSocket-Key`
    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,

    /// Peer went away or the socket failed during the handshake
    #[error("I/O error during handshake: {0}")]
    Io(#[from] io::Error),
}

impl HandshakeError {
    /// Status line sent back before the connection is closed.
    ///
    /// `None` when the socket is already unusable.
    pub fn status_line(&self) -> Option<&'static str> {
        match self {
            HandshakeError::HeadTooLarge(_) => Some("431 Request Header Fields Too Large"),
            HandshakeError::NotFound(_) => Some("404 Not Found"),
            HandshakeError::Unauthorized(_) => Some("401 Unauthorized"),
            HandshakeError::Malformed(_)
            | HandshakeError::Method(_)
            | HandshakeError::NotUpgrade
            | HandshakeError::MissingKey => Some("400 Bad Request"),
            HandshakeError::Io(_) => None,
        }
    }
}

/// Errors from the upstream connector
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Base URL cannot be turned into a streaming endpoint
    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),

    /// Credential could not be attached to the request
    #[error("Invalid credential header: {0}")]
    InvalidCredential(String),

    /// Transport-level failure while connecting
    #[error("Connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connect attempt exceeded the configured timeout
    #[error("Connection timed out after {0:?}")]
    Timeout(std::time::Duration),
}
