//! Error types for muxwire.

use thiserror::Error;

/// Main error type for all session and stream operations.
#[derive(Debug, Error)]
pub enum MuxError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (text codec).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error (binary codec).
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error (binary codec).
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol violation (unexpected control message, misuse of a handshake).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A message carried a kind byte outside the known control taxonomy.
    #[error("Unknown meta message type: {0}")]
    UnknownMeta(u8),

    /// A frame exceeded the configured maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Operation requires an authenticated session.
    #[error("client not yet authenticated")]
    NotAuthenticated,

    /// `authenticate` was called on a session that already authenticated.
    #[error("client has already authenticated")]
    AlreadyAuthenticated,

    /// The peer rejected the submitted credentials.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The peer has no handler for the requested protocol.
    #[error("unknown protocol {0}")]
    UnknownProtocol(String),

    /// The stream is closed and its buffer drained.
    #[error("end of stream")]
    EndOfStream,

    /// The writer task is gone; nothing more can be sent.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The session was closed while the operation was waiting.
    #[error("session closed")]
    SessionClosed,
}

/// Result type alias using MuxError.
pub type Result<T> = std::result::Result<T, MuxError>;
