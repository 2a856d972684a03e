//! Error types for callwire.

use thiserror::Error;
use uuid::Uuid;

use crate::failure::CallFailure;

/// Main error type for all callwire operations.
#[derive(Debug, Error)]
pub enum CallwireError {
    /// I/O error on the underlying connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration documents only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (malformed frame, misuse of a stream, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Peer speaks a newer (or invalid) protocol version.
    #[error("Unsupported protocol version {version} (supported: {supported})")]
    UnsupportedVersion {
        /// Version byte found on the wire.
        version: u8,
        /// Highest version this build understands.
        supported: u8,
    },

    /// Frame length exceeds the configured or encodable maximum.
    #[error("Frame length {length} exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared or computed frame length.
        length: usize,
        /// Effective maximum.
        max: u32,
    },

    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The service binding was closed; no new calls are accepted.
    #[error("Binding for service {0} is closed")]
    BindingClosed(Uuid),

    /// The stream was closed by either side.
    #[error("Stream closed")]
    StreamClosed,

    /// A remote call reached a terminal failure.
    #[error(transparent)]
    Call(#[from] CallFailure),

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

/// Result type alias using CallwireError.
pub type Result<T> = std::result::Result<T, CallwireError>;
