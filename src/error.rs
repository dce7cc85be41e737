//! Error types for storelink.

use thiserror::Error;

use crate::protocol::RpcError;

/// Main error type for all storelink operations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (text envelope).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error (binary envelope).
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error (binary envelope).
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Transport-level failure while dialing or talking to the socket.
    #[error("transport error: {0}")]
    Transport(String),

    /// Protocol error (malformed envelope, unexpected control frame, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Structured error envelope on a response; rejects only that call.
    #[error("rpc error: {0}")]
    Rpc(RpcError),

    /// The server refused the handshake. Terminal, never retried.
    #[error("unauthorized")]
    Unauthorized,

    /// The session id is still attached to a live server-side connection.
    /// Transient: the session id is regenerated and the attempt retried.
    #[error("session already connected")]
    AlreadyConnected,

    /// No handshake ack within the dial timeout.
    #[error("dial timeout")]
    DialTimeout,

    /// The connection was explicitly closed; no further calls are accepted.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias using LinkError.
pub type Result<T> = std::result::Result<T, LinkError>;
