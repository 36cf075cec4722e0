//! Error types for the jrpc server.

use jrpc_proto::RpcError;

use crate::transport::CodecError;

/// Errors that can occur in the server
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Command registry or codec error
    #[error("Command error: {0}")]
    Command(#[from] jrpc_proto::Error),

    /// HTTP request framing error
    #[error("HTTP error: {0}")]
    Codec(#[from] CodecError),

    /// The peer broke the session protocol
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),
}

impl ServerError {
    /// The session a message was meant for has already disconnected.
    #[must_use]
    pub fn client_quit() -> Self {
        Self::Command(jrpc_proto::Error::client_quit())
    }
}

impl From<ServerError> for RpcError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Command(e) => e.into(),
            other => RpcError::internal_error(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
