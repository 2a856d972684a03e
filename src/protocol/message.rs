//! Typed payloads and the role-split inbound message unions.
//!
//! Frames are decoded once, in the connection's reader, into either a
//! [`ServerInbound`] message (consumed by the dispatch engine) or a
//! [`ClientInbound`] message (consumed by the invocation registry and the
//! client stream table). Both unions are closed: every command byte maps to
//! exactly one variant and consumers match them exhaustively.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use uuid::Uuid;

use super::command::Command;
use super::frame::{Frame, FrameEncoder};
use super::wire_format::InvocationKey;
use crate::codec::MsgPackCodec;
use crate::error::Result;
use crate::failure::{CallFailure, FailureCode, RemoteFailure, ServiceError};

/// Payload of `CALL_WITH_RETURN` / `CALL_WITHOUT_RETURN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    /// Method within the target service.
    pub method_id: u32,
    /// One slot per declared parameter.
    pub args: Vec<ArgSlot>,
}

/// One argument position inside a [`CallRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgSlot {
    /// Plain serialized value.
    Value(ByteBuf),
    /// Asynchronous argument that was already resolved at send time.
    Async(AsyncArgState),
    /// Asynchronous argument still pending; a completion frame follows.
    Deferred,
}

/// Resolution state of an inlined asynchronous argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AsyncState {
    /// Resolved with a value.
    Succeeded,
    /// Resolved with a failure.
    Failed,
}

/// Tagged `{state, value}` wrapper for an inlined asynchronous argument.
///
/// For `FAILED`, `value` holds a serialized [`ServiceError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncArgState {
    /// Outcome tag.
    pub state: AsyncState,
    /// Serialized value or failure.
    pub value: ByteBuf,
}

/// Payload of `CANCEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Fire the execution's cancellation token, not just mark it.
    pub interrupt: bool,
}

/// Payload of `ASYNC_ARG_DATA` / `ASYNC_ARG_FAILURE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncArgCompletion {
    /// Position of the deferred argument.
    pub parameter_index: u32,
    /// Serialized value, or serialized [`ServiceError`] for failures.
    pub value: ByteBuf,
}

/// Payload of `STREAM_BACK_PRESSURE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditGrant {
    /// `0` no-op, `> 0` demand, `< 0` cancel.
    pub credit: i64,
}

/// Success value of a streaming call: identity of the stream, no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHandle {
    /// Service hosting the stream.
    pub service_id: Uuid,
    /// Call id of the originating call.
    pub call_id: i32,
}

impl StreamHandle {
    /// Key addressing the stream's frames.
    pub fn key(&self) -> InvocationKey {
        InvocationKey::new(self.service_id, self.call_id)
    }
}

impl From<InvocationKey> for StreamHandle {
    fn from(key: InvocationKey) -> Self {
        Self {
            service_id: key.service_id,
            call_id: key.call_id,
        }
    }
}

/// Messages consumed by the serving side.
#[derive(Debug)]
pub enum ServerInbound {
    /// Method invocation.
    Call {
        /// Invocation identity.
        key: InvocationKey,
        /// `CALL_WITH_RETURN` vs `CALL_WITHOUT_RETURN`.
        expects_response: bool,
        /// Decoded envelope.
        request: CallRequest,
    },
    /// Best-effort abort.
    Cancel {
        /// Target invocation.
        key: InvocationKey,
        /// Interrupt the running execution.
        interrupt: bool,
    },
    /// Deferred argument resolved.
    AsyncArg {
        /// Target invocation.
        key: InvocationKey,
        /// Parameter position.
        index: u32,
        /// Serialized value or failure.
        outcome: std::result::Result<Bytes, ServiceError>,
    },
    /// Consumer starts delivery.
    StreamOpen {
        /// Stream identity.
        key: InvocationKey,
    },
    /// Consumer grants credit.
    StreamBackPressure {
        /// Stream identity.
        key: InvocationKey,
        /// Credit delta.
        credit: i64,
    },
    /// Consumer cancels.
    StreamClose {
        /// Stream identity.
        key: InvocationKey,
    },
}

/// Messages consumed by the calling side.
#[derive(Debug)]
pub enum ClientInbound {
    /// `SUCCESS_RESPONSE`.
    Success {
        /// Invocation identity.
        key: InvocationKey,
        /// Serialized return value.
        payload: Bytes,
    },
    /// Any failure response.
    Failure {
        /// Invocation identity.
        key: InvocationKey,
        /// Caller-side failure.
        failure: CallFailure,
    },
    /// One stream item.
    StreamData {
        /// Stream identity.
        key: InvocationKey,
        /// Serialized item.
        payload: Bytes,
    },
    /// Producer finished normally.
    StreamClosed {
        /// Stream identity.
        key: InvocationKey,
    },
    /// Producer failed.
    StreamFailed {
        /// Stream identity.
        key: InvocationKey,
        /// Remote failure.
        failure: CallFailure,
    },
}

/// Result of decoding one frame.
#[derive(Debug)]
pub enum Inbound {
    /// For the dispatch engine.
    Server(ServerInbound),
    /// For the invocation registry / client streams.
    Client(ClientInbound),
    /// Known command, undecodable payload.
    Malformed {
        /// Frame identity.
        key: InvocationKey,
        /// Frame command.
        command: Command,
        /// Decoder diagnostic.
        reason: String,
    },
    /// Unknown command byte.
    Unrecognized {
        /// Frame identity.
        key: InvocationKey,
        /// Raw command byte.
        code: u8,
    },
}

impl Inbound {
    /// Decode a frame into its role-specific message.
    ///
    /// Never fails: payload problems become [`Inbound::Malformed`], unknown
    /// command bytes become [`Inbound::Unrecognized`].
    pub fn decode(frame: &Frame) -> Self {
        let key = frame.key();
        let Some(command) = frame.command() else {
            return Self::Unrecognized {
                key,
                code: frame.command_code(),
            };
        };

        match Self::decode_known(command, key, frame) {
            Ok(inbound) => inbound,
            Err(e) => Self::Malformed {
                key,
                command,
                reason: e.to_string(),
            },
        }
    }

    fn decode_known(command: Command, key: InvocationKey, frame: &Frame) -> Result<Self> {
        let payload = frame.payload();
        let inbound = match command {
            Command::CallWithReturn | Command::CallWithoutReturn => {
                Self::Server(ServerInbound::Call {
                    key,
                    expects_response: command.expects_response(),
                    request: MsgPackCodec::decode(payload)?,
                })
            }
            Command::Cancel => {
                let cancel: CancelRequest = MsgPackCodec::decode(payload)?;
                Self::Server(ServerInbound::Cancel {
                    key,
                    interrupt: cancel.interrupt,
                })
            }
            Command::AsyncArgData => {
                let completion: AsyncArgCompletion = MsgPackCodec::decode(payload)?;
                Self::Server(ServerInbound::AsyncArg {
                    key,
                    index: completion.parameter_index,
                    outcome: Ok(Bytes::from(completion.value.into_vec())),
                })
            }
            Command::AsyncArgFailure => {
                let completion: AsyncArgCompletion = MsgPackCodec::decode(payload)?;
                Self::Server(ServerInbound::AsyncArg {
                    key,
                    index: completion.parameter_index,
                    outcome: Err(decode_service_error(&completion.value)),
                })
            }
            Command::StreamOpen => Self::Server(ServerInbound::StreamOpen { key }),
            Command::StreamBackPressure => {
                let grant: CreditGrant = MsgPackCodec::decode(payload)?;
                Self::Server(ServerInbound::StreamBackPressure {
                    key,
                    credit: grant.credit,
                })
            }
            Command::StreamClose => Self::Server(ServerInbound::StreamClose { key }),
            Command::SuccessResponse => Self::Client(ClientInbound::Success {
                key,
                payload: frame.payload.clone(),
            }),
            Command::FailureResponse => Self::Client(ClientInbound::Failure {
                key,
                failure: CallFailure::Remote(RemoteFailure::new(frame.payload.clone())),
            }),
            Command::FailureNoService
            | Command::FailureNoMethod
            | Command::FailureToDeserialize
            | Command::FailureToSerializeSuccess
            | Command::FailureToSerializeFailure
            | Command::FailureUnknown => {
                let code = FailureCode::from_command(command).unwrap_or(FailureCode::Unknown);
                Self::Client(ClientInbound::Failure {
                    key,
                    failure: CallFailure::from_protocol(code, decode_diagnostic(payload)),
                })
            }
            Command::StreamData => Self::Client(ClientInbound::StreamData {
                key,
                payload: frame.payload.clone(),
            }),
            Command::StreamCloseEvent => Self::Client(ClientInbound::StreamClosed { key }),
            Command::StreamErrorEvent => Self::Client(ClientInbound::StreamFailed {
                key,
                failure: CallFailure::Remote(RemoteFailure::new(frame.payload.clone())),
            }),
        };
        Ok(inbound)
    }
}

/// Diagnostic strings are informational; an undecodable one is kept lossily.
fn decode_diagnostic(payload: &[u8]) -> String {
    MsgPackCodec::decode::<String>(payload)
        .unwrap_or_else(|_| String::from_utf8_lossy(payload).into_owned())
}

fn decode_service_error(payload: &[u8]) -> ServiceError {
    MsgPackCodec::decode(payload).unwrap_or_else(|e| {
        ServiceError::new("undecodable", format!("Failed to decode argument failure: {}", e))
    })
}

/// `CALL_WITH_RETURN` or `CALL_WITHOUT_RETURN` frame.
pub fn call_frame(
    key: InvocationKey,
    expects_response: bool,
    request: &CallRequest,
    max_frame_length: u32,
) -> Result<Bytes> {
    let command = if expects_response {
        Command::CallWithReturn
    } else {
        Command::CallWithoutReturn
    };
    FrameEncoder::with_max_length(command, key, max_frame_length)
        .payload(request)?
        .finish()
}

/// `CANCEL` frame.
pub fn cancel_frame(key: InvocationKey, interrupt: bool) -> Result<Bytes> {
    FrameEncoder::new(Command::Cancel, key)
        .payload(&CancelRequest { interrupt })?
        .finish()
}

/// `ASYNC_ARG_DATA` or `ASYNC_ARG_FAILURE` frame for one deferred argument.
pub fn async_arg_frame(
    key: InvocationKey,
    parameter_index: u32,
    outcome: &std::result::Result<Bytes, ServiceError>,
    max_frame_length: u32,
) -> Result<Bytes> {
    let (command, value) = match outcome {
        Ok(bytes) => (Command::AsyncArgData, bytes.to_vec()),
        Err(err) => (Command::AsyncArgFailure, MsgPackCodec::encode(err)?),
    };
    FrameEncoder::with_max_length(command, key, max_frame_length)
        .payload(&AsyncArgCompletion {
            parameter_index,
            value: ByteBuf::from(value),
        })?
        .finish()
}

/// `STREAM_OPEN` frame.
pub fn stream_open_frame(key: InvocationKey) -> Result<Bytes> {
    FrameEncoder::new(Command::StreamOpen, key).finish()
}

/// `STREAM_BACK_PRESSURE` frame.
pub fn back_pressure_frame(key: InvocationKey, credit: i64) -> Result<Bytes> {
    FrameEncoder::new(Command::StreamBackPressure, key)
        .payload(&CreditGrant { credit })?
        .finish()
}

/// `STREAM_CLOSE` frame.
pub fn stream_close_frame(key: InvocationKey) -> Result<Bytes> {
    FrameEncoder::new(Command::StreamClose, key).finish()
}

/// `STREAM_DATA` frame with `item` serialized in place.
pub fn stream_data_frame<T: Serialize + ?Sized>(
    key: InvocationKey,
    item: &T,
    max_frame_length: u32,
) -> Result<Bytes> {
    FrameEncoder::with_max_length(Command::StreamData, key, max_frame_length)
        .payload(item)?
        .finish()
}

/// `STREAM_CLOSE_EVENT` frame.
pub fn stream_close_event_frame(key: InvocationKey) -> Result<Bytes> {
    FrameEncoder::new(Command::StreamCloseEvent, key).finish()
}

/// `STREAM_ERROR_EVENT` frame carrying a serialized failure value.
pub fn stream_error_event_frame(key: InvocationKey, failure: &[u8]) -> Result<Bytes> {
    FrameEncoder::new(Command::StreamErrorEvent, key)
        .raw(failure)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, FrameBuffer, DEFAULT_MAX_FRAME_LENGTH};

    fn key() -> InvocationKey {
        InvocationKey::new(Uuid::from_u128(0xABCD), 5)
    }

    fn decode(bytes: &[u8]) -> Inbound {
        let frame = FrameBuffer::new().push(bytes).unwrap().remove(0);
        Inbound::decode(&frame)
    }

    #[test]
    fn test_call_request_roundtrip() {
        let request = CallRequest {
            method_id: 7,
            args: vec![
                ArgSlot::Value(ByteBuf::from(MsgPackCodec::encode(&"hi").unwrap())),
                ArgSlot::Async(AsyncArgState {
                    state: AsyncState::Succeeded,
                    value: ByteBuf::from(vec![0x01]),
                }),
                ArgSlot::Deferred,
            ],
        };
        let bytes = call_frame(key(), true, &request, DEFAULT_MAX_FRAME_LENGTH).unwrap();

        match decode(&bytes) {
            Inbound::Server(ServerInbound::Call {
                key: k,
                expects_response,
                request: decoded,
            }) => {
                assert_eq!(k, key());
                assert!(expects_response);
                assert_eq!(decoded, request);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_async_state_tags_are_screaming_case() {
        let encoded = MsgPackCodec::encode(&AsyncState::Succeeded).unwrap();
        let tag: String = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(tag, "SUCCEEDED");
    }

    #[test]
    fn test_fire_and_forget_call_does_not_expect_response() {
        let request = CallRequest {
            method_id: 1,
            args: vec![],
        };
        let bytes = call_frame(key(), false, &request, DEFAULT_MAX_FRAME_LENGTH).unwrap();
        assert!(matches!(
            decode(&bytes),
            Inbound::Server(ServerInbound::Call {
                expects_response: false,
                ..
            })
        ));
    }

    #[test]
    fn test_async_arg_failure_carries_service_error() {
        let err = ServiceError::new("io", "disk gone");
        let bytes =
            async_arg_frame(key(), 2, &Err(err.clone()), DEFAULT_MAX_FRAME_LENGTH).unwrap();

        match decode(&bytes) {
            Inbound::Server(ServerInbound::AsyncArg { index, outcome, .. }) => {
                assert_eq!(index, 2);
                assert_eq!(outcome.unwrap_err(), err);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_back_pressure_credit_sign_is_preserved() {
        let bytes = back_pressure_frame(key(), -1).unwrap();
        assert!(matches!(
            decode(&bytes),
            Inbound::Server(ServerInbound::StreamBackPressure { credit: -1, .. })
        ));
    }

    #[test]
    fn test_protocol_failure_maps_to_call_failure() {
        let payload = MsgPackCodec::encode(&"no such service").unwrap();
        let bytes = build_frame(Command::FailureNoService, key(), &payload).unwrap();

        match decode(&bytes) {
            Inbound::Client(ClientInbound::Failure { failure, .. }) => {
                assert!(matches!(failure, CallFailure::MissingService(ref d) if d == "no such service"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stream_terminal_events_are_distinct() {
        let closed = stream_close_event_frame(key()).unwrap();
        let failed = stream_error_event_frame(
            key(),
            &MsgPackCodec::encode(&ServiceError::new("boom", "x")).unwrap(),
        )
        .unwrap();

        assert!(matches!(
            decode(&closed),
            Inbound::Client(ClientInbound::StreamClosed { .. })
        ));
        assert!(matches!(
            decode(&failed),
            Inbound::Client(ClientInbound::StreamFailed { .. })
        ));
    }

    #[test]
    fn test_malformed_call_payload() {
        let bytes = build_frame(Command::CallWithReturn, key(), b"\xc1garbage").unwrap();
        match decode(&bytes) {
            Inbound::Malformed { command, key: k, .. } => {
                assert_eq!(command, Command::CallWithReturn);
                assert_eq!(k, key());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_command() {
        let bytes = FrameEncoder::with_raw_command(0x55, key(), DEFAULT_MAX_FRAME_LENGTH)
            .finish()
            .unwrap();
        assert!(matches!(
            decode(&bytes),
            Inbound::Unrecognized { code: 0x55, .. }
        ));
    }

    #[test]
    fn test_stream_handle_key() {
        let handle = StreamHandle::from(key());
        assert_eq!(handle.key(), key());
        let encoded = MsgPackCodec::encode(&handle).unwrap();
        let decoded: StreamHandle = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, handle);
    }
}
