//! Frame struct and the two-pass frame encoder.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use callwire::protocol::{Command, FrameBuffer, FrameEncoder, InvocationKey};
//! use uuid::Uuid;
//!
//! let key = InvocationKey::new(Uuid::new_v4(), 1);
//! let bytes = FrameEncoder::new(Command::SuccessResponse, key)
//!     .payload(&true)
//!     .unwrap()
//!     .finish()
//!     .unwrap();
//!
//! let frames = FrameBuffer::new().push(&bytes).unwrap();
//! assert_eq!(frames[0].key(), key);
//! assert_eq!(frames[0].command(), Some(Command::SuccessResponse));
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use uuid::Uuid;

use super::command::Command;
use super::wire_format::{
    effective_max_length, Header, InvocationKey, DEFAULT_MAX_FRAME_LENGTH, HEADER_SIZE,
    PREFIX_SIZE, PROTOCOL_VERSION,
};
use crate::codec::MsgPackCodec;
use crate::error::{CallwireError, Result};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Parsed command, or `None` for an unrecognized command byte.
    #[inline]
    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.header.command)
    }

    /// Raw command byte.
    #[inline]
    pub fn command_code(&self) -> u8 {
        self.header.command
    }

    /// Invocation key addressed by this frame.
    #[inline]
    pub fn key(&self) -> InvocationKey {
        self.header.key()
    }

    /// Target service id.
    #[inline]
    pub fn service_id(&self) -> Uuid {
        self.header.service_id
    }

    /// Call id.
    #[inline]
    pub fn call_id(&self) -> i32 {
        self.header.call_id
    }
}

/// Builds one frame in a single buffer.
///
/// The header is written first with a placeholder length; the payload is
/// serialized straight into the same buffer, and [`finish`](Self::finish)
/// patches the length field once the payload size is known.
pub struct FrameEncoder {
    buf: BytesMut,
    max_frame_length: u32,
}

impl FrameEncoder {
    /// Start a frame with the default maximum length.
    pub fn new(command: Command, key: InvocationKey) -> Self {
        Self::with_max_length(command, key, DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Start a frame that must not exceed `max_frame_length`.
    pub fn with_max_length(command: Command, key: InvocationKey, max_frame_length: u32) -> Self {
        Self::with_raw_command(command.code(), key, max_frame_length)
    }

    /// Start a frame with an arbitrary command byte.
    ///
    /// Only useful for exercising peers with unrecognized commands.
    pub fn with_raw_command(command: u8, key: InvocationKey, max_frame_length: u32) -> Self {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);
        buf.put_u8(PROTOCOL_VERSION);
        // Length placeholder, patched in finish()
        buf.put_slice(&[0, 0, 0]);
        buf.put_u8(command);
        buf.put_u128(key.service_id.as_u128());
        buf.put_i32(key.call_id);
        Self {
            buf,
            max_frame_length,
        }
    }

    /// Serialize `value` as the payload (MsgPack).
    pub fn payload<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        MsgPackCodec::encode_into(&mut self.buf, value)?;
        Ok(self)
    }

    /// Append already-serialized payload bytes.
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Patch the length field and return the finished frame.
    pub fn finish(mut self) -> Result<Bytes> {
        let length = self.buf.len() - PREFIX_SIZE;
        let max = effective_max_length(self.max_frame_length);
        if length > max as usize {
            return Err(CallwireError::FrameTooLarge { length, max });
        }
        let be = (length as u32).to_be_bytes();
        self.buf[1..4].copy_from_slice(&be[1..4]);
        Ok(self.buf.freeze())
    }
}

/// Build a complete frame from a command, key and raw payload.
pub fn build_frame(command: Command, key: InvocationKey, payload: &[u8]) -> Result<Bytes> {
    FrameEncoder::new(command, key).raw(payload).finish()
}
