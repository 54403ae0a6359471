// Error types for the transport, request API, and reconciler layers.

use thiserror::Error;

use crate::message::MessageId;

/// Failures of the live transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    Disconnected,

    #[error("transport has shut down")]
    Closed,

    #[error("failed to encode client event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("websocket handshake rejected: {0}")]
    Handshake(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("local store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Failures of the request/response conversation API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    Forbidden(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("server responded with {status}: {message}")]
    Status { status: u16, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Failures surfaced by reconciler operations. None of these leave the view
/// in a partially applied state.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message was not accepted by the transport")]
    SendRejected,

    #[error("message {0} is not part of this conversation")]
    UnknownMessage(MessageId),

    #[error("only the sender may edit message {0}")]
    NotAuthor(MessageId),

    #[error("message content must not be empty")]
    EmptyContent,

    #[error("message content exceeds {max} characters")]
    ContentTooLong { max: usize },

    #[error("a previous {0} is still in progress")]
    Busy(&'static str),

    #[error("no conversation is open")]
    NoConversation,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Api(#[from] ApiError),
}
