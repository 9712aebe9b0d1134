//! Error types
//!
//! Each subsystem has its own error enum; all of them convert into the
//! crate-level [`Error`]. Errors that reach a client are mapped onto the wire
//! [`ErrorCode`] enumeration by the request handler.

use std::io;

use serde::{Deserialize, Serialize};

use crate::registry::RegistryError;

/// Crate-level result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Resend(#[from] ResendError),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("connection {0} is closed")]
    ConnectionClosed(String),
}

/// Failures while decoding inbound control frames
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The frame is not a JSON object at all
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The frame parsed but a field is missing or has the wrong shape
    #[error("invalid {request_type} request: {reason}")]
    InvalidField {
        request_id: String,
        request_type: String,
        reason: String,
    },

    /// The `type` tag names no known request
    #[error("Unknown request type: {request_type}")]
    UnknownType {
        request_id: String,
        request_type: String,
    },

    /// A stream id was empty
    #[error("stream id must not be empty")]
    EmptyStreamId,
}

impl ProtocolError {
    /// Request id that can be echoed back, if one was recovered from the frame
    pub fn request_id(&self) -> &str {
        match self {
            ProtocolError::InvalidField { request_id, .. }
            | ProtocolError::UnknownType { request_id, .. } => request_id,
            ProtocolError::Malformed(_) | ProtocolError::EmptyStreamId => "",
        }
    }
}

/// Protocol version negotiation failures at connection setup
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("Missing version negotiation! Must give {0} as query parameter")]
    Missing(&'static str),

    #[error("Version parameter {0} given more than once")]
    Duplicated(&'static str),

    #[error("Invalid {param} value: {value}")]
    NotANumber { param: &'static str, value: String },

    #[error("Unsupported {param} {version}. Supported: {supported:?}")]
    Unsupported {
        param: &'static str,
        version: u32,
        supported: &'static [u32],
    },
}

/// Failures reported by the underlying network node
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("network subscribe failed: {0}")]
    Subscribe(String),

    #[error("network publish failed: {0}")]
    Publish(String),

    #[error("network node is stopped")]
    Stopped,
}

/// Outcome categories of a permission check
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermissionError {
    /// Credential missing or not recognised (HTTP 401)
    #[error("authentication failed")]
    Unauthenticated,

    /// Credential valid but lacks the operation (HTTP 403)
    #[error("permission denied")]
    Forbidden,

    /// Stream does not exist (HTTP 404)
    #[error("stream not found")]
    NotFound,

    /// Permission service unreachable or returned garbage
    #[error("permission check failed: {0}")]
    Unavailable(String),
}

/// Failures of publish hand-off
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error("{0}")]
    FutureTimestamp(String),

    #[error("invalid message: {0}")]
    Validation(String),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Failures of historical data retrieval
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResendError {
    #[error("no storage nodes assigned to stream {0}")]
    NoStorageNodes(String),

    #[error("all {attempted} storage node(s) failed, last error: {last_error}")]
    StorageUnavailable { attempted: usize, last_error: String },

    #[error("invalid storage node url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to decode historical message: {0}")]
    Decode(String),

    #[error("historical data stream failed: {0}")]
    Source(String),
}

/// Error codes carried by `ErrorResponse` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthenticationFailed,
    PermissionDenied,
    NotFound,
    InvalidRequest,
    FutureTimestamp,
    RequestFailed,
    ResendFailed,
}

impl ErrorCode {
    /// Map a permission failure onto its wire code
    ///
    /// `fallback` is used for failures that are not authorization outcomes.
    pub fn from_permission(err: &PermissionError, fallback: ErrorCode) -> ErrorCode {
        match err {
            PermissionError::Unauthenticated => ErrorCode::AuthenticationFailed,
            PermissionError::Forbidden => ErrorCode::PermissionDenied,
            PermissionError::NotFound => ErrorCode::NotFound,
            PermissionError::Unavailable(_) => fallback,
        }
    }
}
