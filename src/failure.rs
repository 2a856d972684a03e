//! Failure taxonomy and response encoding.
//!
//! Two directions meet here:
//! - [`Reply`] is what a service method produces on the serving side. It
//!   owns the fallback rules: a success or failure value that cannot be
//!   serialized is replaced by a protocol failure carrying only a
//!   diagnostic string.
//! - [`CallFailure`] is what a caller observes. Every peer-reported code,
//!   local timeout, cancellation and connection loss maps to one variant,
//!   and all of them reach the caller through the same exactly-once
//!   resolution path.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::MsgPackCodec;
use crate::error::{CallwireError, Result};
use crate::protocol::{Command, FrameEncoder, InvocationKey};

/// Protocol-level failure codes sent by the serving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCode {
    /// Service id not exported on the connection.
    NoService,
    /// Method id not part of the service.
    NoMethod,
    /// Request envelope or arguments could not be decoded.
    ToDeserialize,
    /// Success value could not be serialized.
    ToSerializeSuccess,
    /// Failure value could not be serialized.
    ToSerializeFailure,
    /// Anything else.
    Unknown,
}

impl FailureCode {
    /// Command byte carrying this code.
    pub fn command(self) -> Command {
        match self {
            Self::NoService => Command::FailureNoService,
            Self::NoMethod => Command::FailureNoMethod,
            Self::ToDeserialize => Command::FailureToDeserialize,
            Self::ToSerializeSuccess => Command::FailureToSerializeSuccess,
            Self::ToSerializeFailure => Command::FailureToSerializeFailure,
            Self::Unknown => Command::FailureUnknown,
        }
    }

    /// Map a response command back to its failure code.
    pub fn from_command(command: Command) -> Option<Self> {
        let code = match command {
            Command::FailureNoService => Self::NoService,
            Command::FailureNoMethod => Self::NoMethod,
            Command::FailureToDeserialize => Self::ToDeserialize,
            Command::FailureToSerializeSuccess => Self::ToSerializeSuccess,
            Command::FailureToSerializeFailure => Self::ToSerializeFailure,
            Command::FailureUnknown => Self::Unknown,
            _ => return None,
        };
        Some(code)
    }
}

/// Application-level failure value.
///
/// The default failure type carried by `FAILURE_RESPONSE`,
/// `ASYNC_ARG_FAILURE` and `STREAM_ERROR_EVENT` payloads. Methods may fail
/// with any serializable type; this one is what the engine itself produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct ServiceError {
    /// Short machine-readable category.
    pub kind: String,
    /// Human-readable detail.
    pub message: String,
}

impl ServiceError {
    /// Create a new service error.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<CallwireError> for ServiceError {
    fn from(err: CallwireError) -> Self {
        Self::new("internal", err.to_string())
    }
}

/// Serialized failure value reported by the peer.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    payload: Bytes,
}

impl RemoteFailure {
    /// Wrap a serialized failure payload.
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Decode the payload as the method's failure type.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E> {
        MsgPackCodec::decode(&self.payload)
    }

    /// Decode the payload as the engine's default [`ServiceError`].
    pub fn service_error(&self) -> Option<ServiceError> {
        self.decode().ok()
    }
}

impl fmt::Debug for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFailure")
            .field("len", &self.payload.len())
            .field("service_error", &self.service_error())
            .finish()
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.service_error() {
            Some(err) => write!(f, "{}", err),
            None => write!(f, "{} byte failure payload", self.payload.len()),
        }
    }
}

/// Terminal failure of a remote call, as seen by the caller.
#[derive(Debug, Clone, Error)]
pub enum CallFailure {
    /// The request could not be written or the connection failed.
    #[error("Communication failure: {0}")]
    Comms(String),

    /// No response within the call timeout.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// Cancelled locally.
    #[error("Call cancelled")]
    Cancelled,

    /// The owning connection closed before the call completed.
    #[error("Connection lost")]
    ConnectionLost,

    /// Peer does not export the service.
    #[error("Missing service: {0}")]
    MissingService(String),

    /// Peer service has no such method.
    #[error("Missing method: {0}")]
    MissingMethod(String),

    /// Peer could not decode the request.
    #[error("Peer failed to deserialize the request: {0}")]
    PeerDeserialize(String),

    /// Peer could not serialize its success value.
    #[error("Peer failed to serialize the result: {0}")]
    PeerSerializeSuccess(String),

    /// Peer could not serialize its failure value.
    #[error("Peer failed to serialize the failure: {0}")]
    PeerSerializeFailure(String),

    /// Peer reported an unclassified failure.
    #[error("Peer failure: {0}")]
    PeerUnknown(String),

    /// Response carried a command byte this build does not know.
    #[error("Unrecognized protocol code 0x{0:02X}")]
    UnrecognizedCode(u8),

    /// Application failure returned by the remote method.
    #[error("Remote failure: {0}")]
    Remote(RemoteFailure),

    /// Response payload could not be decoded locally.
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl CallFailure {
    /// Build the caller-side failure for a peer-reported protocol code.
    pub fn from_protocol(code: FailureCode, diagnostic: String) -> Self {
        match code {
            FailureCode::NoService => Self::MissingService(diagnostic),
            FailureCode::NoMethod => Self::MissingMethod(diagnostic),
            FailureCode::ToDeserialize => Self::PeerDeserialize(diagnostic),
            FailureCode::ToSerializeSuccess => Self::PeerSerializeSuccess(diagnostic),
            FailureCode::ToSerializeFailure => Self::PeerSerializeFailure(diagnostic),
            FailureCode::Unknown => Self::PeerUnknown(diagnostic),
        }
    }

    /// Whether this failure means the binding can never succeed again.
    ///
    /// Missing services and methods are API mismatches, not transient faults.
    pub fn is_binding_fatal(&self) -> bool {
        matches!(self, Self::MissingService(_) | Self::MissingMethod(_))
    }

    /// Decode a remote application failure, if that is what this is.
    pub fn remote<E: DeserializeOwned>(&self) -> Option<E> {
        match self {
            Self::Remote(failure) => failure.decode().ok(),
            _ => None,
        }
    }
}

/// Outcome of one server-side invocation, ready to be framed.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Serialized success value.
    Success(Bytes),
    /// Serialized failure value.
    Failure(Bytes),
    /// Protocol failure with a diagnostic string.
    Protocol(FailureCode, String),
}

impl Reply {
    /// Serialize a success value.
    ///
    /// Falls back to `FAILURE_TO_SERIALIZE_SUCCESS` with a diagnostic; the
    /// unserializable value itself is never sent.
    pub fn success<R: Serialize + ?Sized>(value: &R) -> Self {
        match MsgPackCodec::encode(value) {
            Ok(bytes) => Self::Success(Bytes::from(bytes)),
            Err(e) => Self::Protocol(
                FailureCode::ToSerializeSuccess,
                format!("Failed to serialize result: {}", e),
            ),
        }
    }

    /// Serialize a failure value.
    ///
    /// Falls back to `FAILURE_TO_SERIALIZE_FAILURE`; the diagnostic keeps the
    /// failure's display text.
    pub fn failure<E: Serialize + fmt::Display + ?Sized>(error: &E) -> Self {
        match MsgPackCodec::encode(error) {
            Ok(bytes) => Self::Failure(Bytes::from(bytes)),
            Err(e) => Self::Protocol(
                FailureCode::ToSerializeFailure,
                format!("Failed to serialize failure ({}): {}", error, e),
            ),
        }
    }

    /// Protocol failure with a diagnostic.
    pub fn protocol(code: FailureCode, diagnostic: impl Into<String>) -> Self {
        Self::Protocol(code, diagnostic.into())
    }

    /// Command byte this reply is sent with.
    pub fn command(&self) -> Command {
        match self {
            Self::Success(_) => Command::SuccessResponse,
            Self::Failure(_) => Command::FailureResponse,
            Self::Protocol(code, _) => code.command(),
        }
    }

    /// Encode as a response frame for `key`.
    ///
    /// A value that does not fit in one frame is replaced by the matching
    /// serialization failure.
    pub fn into_frame(self, key: InvocationKey, max_frame_length: u32) -> Result<Bytes> {
        let command = self.command();
        let encoded = match &self {
            Self::Success(bytes) | Self::Failure(bytes) => {
                FrameEncoder::with_max_length(command, key, max_frame_length)
                    .raw(bytes)
                    .finish()
            }
            Self::Protocol(_, diagnostic) => {
                FrameEncoder::with_max_length(command, key, max_frame_length)
                    .payload(diagnostic)?
                    .finish()
            }
        };

        match (encoded, self) {
            (Err(CallwireError::FrameTooLarge { length, max }), Self::Success(_)) => {
                Self::Protocol(
                    FailureCode::ToSerializeSuccess,
                    format!("Result of {} bytes exceeds frame limit {}", length, max),
                )
                .into_frame(key, max_frame_length)
            }
            (Err(CallwireError::FrameTooLarge { length, max }), Self::Failure(_)) => {
                Self::Protocol(
                    FailureCode::ToSerializeFailure,
                    format!("Failure of {} bytes exceeds frame limit {}", length, max),
                )
                .into_frame(key, max_frame_length)
            }
            (encoded, _) => encoded,
        }
    }
}
