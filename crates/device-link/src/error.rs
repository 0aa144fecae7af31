//! Error types for the device link.

use tokio_tungstenite::tungstenite;

/// Failure to establish a session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("connect timed out")]
    Timeout,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("gave up after {attempts} attempts: {last}")]
    MaxAttemptsExceeded { attempts: u32, last: String },

    #[error("connect cancelled")]
    Cancelled,
}

/// Failure of an emit or a correlated request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("not connected")]
    NotConnected,

    #[error("send buffer full")]
    SendBufferFull,

    #[error("correlation key is empty")]
    EmptyKey,

    #[error("request already pending for key {0}")]
    DuplicateRequest(String),

    #[error("request {0} timed out")]
    Timeout(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request {key} failed: {message}")]
    Remote { key: String, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame error: {0}")]
    Frame(#[from] sorthub_protocol::FrameError),
}
