//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForPrefix`: Need the 4-byte version + length prefix
//! - `WaitingForBody`: Prefix validated, need `length` more bytes
//!
//! The prefix is validated as soon as it arrives, so an oversized or
//! future-version frame is rejected before its body is buffered.

use bytes::BytesMut;

use super::wire_format::{Header, DEFAULT_MAX_FRAME_LENGTH, PREFIX_SIZE};
use super::Frame;
use crate::error::{CallwireError, Result};

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for version + length.
    WaitingForPrefix,
    /// Prefix parsed, waiting for `length` bytes after it.
    WaitingForBody { length: u32 },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed frame length.
    max_frame_length: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max frame length: 16 MiB.
    pub fn new() -> Self {
        Self::with_capacity_and_max_length(64 * 1024, DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Create a new frame buffer with a custom max frame length.
    pub fn with_max_length(max_frame_length: u32) -> Self {
        Self::with_capacity_and_max_length(64 * 1024, max_frame_length)
    }

    /// Create a new frame buffer with custom capacity and max frame length.
    pub fn with_capacity_and_max_length(capacity: usize, max_frame_length: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForPrefix,
            max_frame_length,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns error on an unsupported version, a length below the header
    /// size or above the maximum. The connection must be closed afterwards;
    /// the buffer is no longer aligned on a frame boundary.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();

        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Try to extract a single frame from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                State::WaitingForPrefix => {
                    let Some((version, length)) = Header::decode_prefix(&self.buffer) else {
                        return Ok(None);
                    };

                    Header::validate_prefix(version, length, self.max_frame_length)?;

                    self.state = State::WaitingForBody { length };
                }

                State::WaitingForBody { length } => {
                    let total = PREFIX_SIZE + length as usize;
                    if self.buffer.len() < total {
                        return Ok(None);
                    }

                    let mut frame_bytes = self.buffer.split_to(total);
                    let header = Header::decode(&frame_bytes).ok_or_else(|| {
                        CallwireError::Protocol("Frame shorter than header".to_string())
                    })?;
                    let payload = frame_bytes.split_off(super::HEADER_SIZE).freeze();

                    self.state = State::WaitingForPrefix;

                    return Ok(Some(Frame::new(header, payload)));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForPrefix;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForPrefix => "WaitingForPrefix",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
