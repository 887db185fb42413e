//! Error types for tracker adapters

use fleet_core::LookupError;
use thiserror::Error;

/// Result type alias for tracker operations
pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Errors that can occur talking to the tracking backend or registry
#[derive(Error, Debug)]
pub enum TrackerError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Server answered with an unexpected status
    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

impl TrackerError {
    pub fn server_error(status: u16, message: impl Into<String>) -> Self {
        Self::ServerError {
            status,
            message: message.into(),
        }
    }
}

impl From<TrackerError> for LookupError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::ServerError { .. } | TrackerError::ParseError(_) => {
                LookupError::InvalidResponse(err.to_string())
            }
            other => LookupError::Unavailable(other.to_string()),
        }
    }
}
