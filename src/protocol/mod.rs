//! Protocol module - wire format, framing, commands and typed messages.
//!
//! This module implements the binary protocol shared by both roles:
//! - 25-byte versioned header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Two-pass frame encoder
//! - Closed command set and role-split inbound unions

mod command;
mod frame;
mod frame_buffer;
mod message;
mod wire_format;

pub use command::{Command, Role};
pub use frame::{build_frame, Frame, FrameEncoder};
pub use frame_buffer::FrameBuffer;
pub use message::{
    async_arg_frame, back_pressure_frame, call_frame, cancel_frame, stream_close_event_frame,
    stream_close_frame, stream_data_frame, stream_error_event_frame, stream_open_frame, ArgSlot,
    AsyncArgCompletion, AsyncArgState, AsyncState, CallRequest, CancelRequest, ClientInbound,
    CreditGrant, Inbound, ServerInbound, StreamHandle,
};
pub use wire_format::{
    effective_max_length, Header, InvocationKey, DEFAULT_MAX_FRAME_LENGTH, HEADER_SIZE,
    LENGTH_COVERED_HEADER, MAX_LENGTH_FIELD, PREFIX_SIZE, PROTOCOL_VERSION,
};
