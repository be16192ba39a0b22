//! Crate-level error type.
//!
//! Every failure that reaches a user is rendered through `Display`, so each
//! variant carries a readable message rather than a code.

use thiserror::Error;

/// Errors produced by the chat pipeline, the relay and the local stores.
#[derive(Debug, Error)]
pub enum NexusError {
    /// No credential is configured and today's free requests are used up.
    #[error("daily quota exhausted ({used}/{limit}); set an access password or your own LLM config")]
    QuotaExceeded { used: u32, limit: u32 },

    /// The server or upstream provider answered with a non-2xx status.
    #[error("AI request failed ({status}): {body}")]
    RequestFailed { status: u16, body: String },

    /// The access password was rejected (HTTP 401).
    #[error("access password rejected: {0}")]
    AuthRejected(String),

    /// The response carried no body to stream from.
    #[error("failed to get response reader")]
    StreamUnavailable,

    /// The byte stream broke off mid-response.
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    /// The request never made it onto the wire.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// A peer sent something that is not a usable HTTP request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Not an absolute http(s) URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// A page was fetched but could not be used.
    #[error("page unavailable: {0}")]
    Page(String),
}

impl NexusError {
    /// HTTP status the server should answer with when this error escapes a
    /// handler.
    pub fn status_code(&self) -> u16 {
        match self {
            NexusError::AuthRejected(_) => 401,
            NexusError::QuotaExceeded { .. } => 429,
            NexusError::RequestFailed { status, .. } => *status,
            NexusError::Protocol(_) | NexusError::Json(_) | NexusError::InvalidUrl(_) => 400,
            NexusError::Page(_) => 502,
            _ => 500,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NexusError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        NexusError::WebSocket(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, NexusError>;
