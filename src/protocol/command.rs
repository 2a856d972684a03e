//! Command byte definitions.
//!
//! Every frame carries one command byte selecting the message variant.
//! Commands below `0x40` travel from the calling side to the serving side;
//! commands from `0x40` upward travel back.

use std::fmt;

/// Closed set of wire commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Invoke a method and expect a response.
    CallWithReturn = 0x01,
    /// Invoke a method, no response.
    CallWithoutReturn = 0x02,
    /// Best-effort abort of an in-flight call.
    Cancel = 0x03,
    /// Deferred argument resolved with a value.
    AsyncArgData = 0x04,
    /// Deferred argument resolved with a failure.
    AsyncArgFailure = 0x05,
    /// Consumer starts stream delivery.
    StreamOpen = 0x06,
    /// Consumer grants (or revokes) stream credit.
    StreamBackPressure = 0x07,
    /// Consumer cancels a stream.
    StreamClose = 0x08,
    /// Call completed with a value.
    SuccessResponse = 0x40,
    /// Call completed with an application failure.
    FailureResponse = 0x41,
    /// Target service is not exported on the connection.
    FailureNoService = 0x42,
    /// Target method id is not part of the service.
    FailureNoMethod = 0x43,
    /// Request could not be deserialized.
    FailureToDeserialize = 0x44,
    /// Success value could not be serialized.
    FailureToSerializeSuccess = 0x45,
    /// Failure value could not be serialized.
    FailureToSerializeFailure = 0x46,
    /// Anything else the serving side could not classify.
    FailureUnknown = 0x47,
    /// One stream item.
    StreamData = 0x48,
    /// Producer finished normally.
    StreamCloseEvent = 0x49,
    /// Producer failed.
    StreamErrorEvent = 0x4A,
}

/// Which side of a connection consumes a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Handled by the dispatch engine (service host).
    Server,
    /// Handled by the invocation registry / client streams.
    Client,
}

impl Command {
    /// Command as it appears on the wire.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a command byte. Returns `None` for unrecognized codes.
    pub fn from_code(code: u8) -> Option<Self> {
        let command = match code {
            0x01 => Self::CallWithReturn,
            0x02 => Self::CallWithoutReturn,
            0x03 => Self::Cancel,
            0x04 => Self::AsyncArgData,
            0x05 => Self::AsyncArgFailure,
            0x06 => Self::StreamOpen,
            0x07 => Self::StreamBackPressure,
            0x08 => Self::StreamClose,
            0x40 => Self::SuccessResponse,
            0x41 => Self::FailureResponse,
            0x42 => Self::FailureNoService,
            0x43 => Self::FailureNoMethod,
            0x44 => Self::FailureToDeserialize,
            0x45 => Self::FailureToSerializeSuccess,
            0x46 => Self::FailureToSerializeFailure,
            0x47 => Self::FailureUnknown,
            0x48 => Self::StreamData,
            0x49 => Self::StreamCloseEvent,
            0x4A => Self::StreamErrorEvent,
            _ => return None,
        };
        Some(command)
    }

    /// Side of the connection that consumes this command.
    pub fn role(self) -> Role {
        if self.code() < 0x40 {
            Role::Server
        } else {
            Role::Client
        }
    }

    /// Whether the sender waits for a response frame.
    #[inline]
    pub fn expects_response(self) -> bool {
        matches!(self, Self::CallWithReturn)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, self.code())
    }
}
