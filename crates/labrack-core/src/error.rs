//! Error types for labrack.
//!
//! One enum covers the whole crate. Server handlers map every error onto one
//! of the wire error kinds via [`LabrackError::wire_kind`]; the client
//! rebuilds typed errors from the wire via [`LabrackError::from_wire`],
//! preserving the server message verbatim.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::wire::ErrorKind;

/// Main error type for labrack.
#[derive(Debug, Error)]
pub enum LabrackError {
    // Wire-visible errors
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("instrument failure: {0}")]
    InstrumentFailure(String),

    #[error("internal error: {0}")]
    Internal(String),

    // Client-side errors, never serialized onto the wire
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("disconnected: {0}")]
    Disconnected(String),

    // Ambient errors
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for labrack operations.
pub type Result<T> = std::result::Result<T, LabrackError>;

impl From<std::io::Error> for LabrackError {
    fn from(err: std::io::Error) -> Self {
        LabrackError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for LabrackError {
    fn from(err: serde_json::Error) -> Self {
        LabrackError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl LabrackError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        LabrackError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// The wire kind under which this error is reported to clients.
    ///
    /// Ambient errors (IO, JSON, config) surface as `Internal`. Driver
    /// faults travel as `InstrumentFailure`: drivers report them directly,
    /// and the dispatcher's handler boundary classifies a panicking driver
    /// the same way.
    pub fn wire_kind(&self) -> ErrorKind {
        match self {
            LabrackError::Protocol(_) => ErrorKind::ProtocolError,
            LabrackError::NotFound(_) => ErrorKind::NotFound,
            LabrackError::Validation(_) => ErrorKind::Validation,
            LabrackError::Unsupported(_) => ErrorKind::Unsupported,
            LabrackError::InstrumentFailure(_) => ErrorKind::InstrumentFailure,
            _ => ErrorKind::Internal,
        }
    }

    /// Rebuild a typed error from a wire error kind and message.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::ProtocolError => LabrackError::Protocol(message),
            ErrorKind::NotFound => LabrackError::NotFound(message),
            ErrorKind::Validation => LabrackError::Validation(message),
            ErrorKind::Unsupported => LabrackError::Unsupported(message),
            ErrorKind::InstrumentFailure => LabrackError::InstrumentFailure(message),
            ErrorKind::Internal => LabrackError::Internal(message),
        }
    }

    /// Whether a fresh attempt against a new socket can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LabrackError::Timeout(_) | LabrackError::Disconnected(_)
        )
    }
}
