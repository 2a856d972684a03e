//! Wire format encoding and decoding.
//!
//! Implements the 25-byte frame header:
//! ```text
//! ┌─────────┬──────────┬─────────┬────────────┬──────────┐
//! │ Version │ Length   │ Command │ Service ID │ Call ID  │
//! │ 1 byte  │ 3 bytes  │ 1 byte  │ 16 bytes   │ 4 bytes  │
//! │ u8      │ u24 BE   │ u8      │ u128 BE    │ i32 BE   │
//! └─────────┴──────────┴─────────┴────────────┴──────────┘
//! ```
//!
//! `Length` counts every byte after the length field itself: the command,
//! service id, call id and payload. All multi-byte integers are Big Endian.

use std::fmt;

use uuid::Uuid;

use crate::error::{CallwireError, Result};

/// Protocol version written by this build. Frames with a higher version are
/// rejected.
pub const PROTOCOL_VERSION: u8 = 1;

/// Version byte plus 24-bit length.
pub const PREFIX_SIZE: usize = 4;

/// Bytes covered by the length field before the payload starts
/// (command + service id + call id).
pub const LENGTH_COVERED_HEADER: usize = 1 + 16 + 4;

/// Full header size in bytes (fixed, exactly 25).
pub const HEADER_SIZE: usize = PREFIX_SIZE + LENGTH_COVERED_HEADER;

/// Largest value the 24-bit length field can carry.
pub const MAX_LENGTH_FIELD: u32 = 0x00FF_FFFF;

/// Default maximum frame length (16 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: u32 = 16 * 1024 * 1024;

/// Effective length limit: the configured maximum clamped to what the
/// length field can express.
#[inline]
pub fn effective_max_length(max_frame_length: u32) -> u32 {
    max_frame_length.min(MAX_LENGTH_FIELD)
}

/// Identity of one pending call or one stream on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvocationKey {
    /// Target service.
    pub service_id: Uuid,
    /// Per-connection, per-service call counter value.
    pub call_id: i32,
}

impl InvocationKey {
    /// Create a new key.
    pub fn new(service_id: Uuid, call_id: i32) -> Self {
        Self {
            service_id,
            call_id,
        }
    }
}

impl fmt::Display for InvocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.service_id, self.call_id)
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version.
    pub version: u8,
    /// Length of command + ids + payload.
    pub length: u32,
    /// Raw command byte (see [`Command`](super::Command)).
    pub command: u8,
    /// Target service.
    pub service_id: Uuid,
    /// Call identifier.
    pub call_id: i32,
}

impl Header {
    /// Create a header for a payload of `payload_length` bytes.
    pub fn new(command: u8, key: InvocationKey, payload_length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            length: LENGTH_COVERED_HEADER as u32 + payload_length,
            command,
            service_id: key.service_id,
            call_id: key.call_id,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use callwire::protocol::{Header, InvocationKey, HEADER_SIZE};
    /// use uuid::Uuid;
    ///
    /// let header = Header::new(0x01, InvocationKey::new(Uuid::nil(), 7), 10);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), HEADER_SIZE);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (25 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.version;
        buf[1..4].copy_from_slice(&self.length.to_be_bytes()[1..4]);
        buf[4] = self.command;
        buf[5..21].copy_from_slice(&self.service_id.as_u128().to_be_bytes());
        buf[21..25].copy_from_slice(&self.call_id.to_be_bytes());
    }

    /// Decode the version byte and 24-bit length from the frame prefix.
    ///
    /// Returns `None` if fewer than 4 bytes are available.
    pub fn decode_prefix(buf: &[u8]) -> Option<(u8, u32)> {
        if buf.len() < PREFIX_SIZE {
            return None;
        }
        let length = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]);
        Some((buf[0], length))
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let (version, length) = Self::decode_prefix(buf)?;
        let mut service = [0u8; 16];
        service.copy_from_slice(&buf[5..21]);
        Some(Self {
            version,
            length,
            command: buf[4],
            service_id: Uuid::from_u128(u128::from_be_bytes(service)),
            call_id: i32::from_be_bytes([buf[21], buf[22], buf[23], buf[24]]),
        })
    }

    /// Validate the version and length of a frame prefix.
    ///
    /// Checks:
    /// - Version is between 1 and [`PROTOCOL_VERSION`]
    /// - Length covers at least the fixed header fields
    /// - Length doesn't exceed the maximum
    pub fn validate_prefix(version: u8, length: u32, max_frame_length: u32) -> Result<()> {
        if version == 0 || version > PROTOCOL_VERSION {
            return Err(CallwireError::UnsupportedVersion {
                version,
                supported: PROTOCOL_VERSION,
            });
        }

        if (length as usize) < LENGTH_COVERED_HEADER {
            return Err(CallwireError::Protocol(format!(
                "Frame length {} is shorter than the {}-byte header",
                length, LENGTH_COVERED_HEADER
            )));
        }

        let max = effective_max_length(max_frame_length);
        if length > max {
            return Err(CallwireError::FrameTooLarge {
                length: length as usize,
                max,
            });
        }

        Ok(())
    }

    /// Validate the header for protocol compliance.
    pub fn validate(&self, max_frame_length: u32) -> Result<()> {
        Self::validate_prefix(self.version, self.length, max_frame_length)
    }

    /// Payload length implied by the length field.
    #[inline]
    pub fn payload_length(&self) -> usize {
        (self.length as usize).saturating_sub(LENGTH_COVERED_HEADER)
    }

    /// Invocation key addressed by this frame.
    #[inline]
    pub fn key(&self) -> InvocationKey {
        InvocationKey::new(self.service_id, self.call_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> InvocationKey {
        InvocationKey::new(Uuid::from_u128(0x0102_0304_0506_0708_090A_0B0C_0D0E_0F10), -2)
    }

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(0x40, key(), 100);
        let decoded = Header::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
        assert_eq!(decoded.payload_length(), 100);
        assert_eq!(decoded.key(), key());
    }

    #[test]
    fn test_header_byte_layout() {
        let header = Header::new(0x07, key(), 0x0A0B);
        let bytes = header.encode();

        assert_eq!(bytes[0], PROTOCOL_VERSION);

        // Length: 21 + 0x0A0B = 0x0A20 as u24 BE
        assert_eq!(&bytes[1..4], &[0x00, 0x0A, 0x20]);

        assert_eq!(bytes[4], 0x07);

        assert_eq!(bytes[5], 0x01);
        assert_eq!(bytes[20], 0x10);

        // -2 as i32 BE
        assert_eq!(&bytes[21..25], &[0xFF, 0xFF, 0xFF, 0xFE]);
    }

    #[test]
    fn test_header_size_is_exactly_25() {
        assert_eq!(HEADER_SIZE, 25);
        assert_eq!(Header::new(1, key(), 0).length, 21);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; HEADER_SIZE - 1];
        assert!(Header::decode(&buf).is_none());
        assert!(Header::decode_prefix(&buf[..3]).is_none());
    }

    #[test]
    fn test_validate_rejects_newer_version() {
        let result = Header::validate_prefix(PROTOCOL_VERSION + 1, 21, DEFAULT_MAX_FRAME_LENGTH);
        assert!(matches!(
            result,
            Err(CallwireError::UnsupportedVersion { version: 2, supported: 1 })
        ));
    }

    #[test]
    fn test_validate_rejects_version_zero() {
        let result = Header::validate_prefix(0, 21, DEFAULT_MAX_FRAME_LENGTH);
        assert!(matches!(result, Err(CallwireError::UnsupportedVersion { .. })));
    }

    #[test]
    fn test_validate_length_too_large() {
        let result = Header::validate_prefix(PROTOCOL_VERSION, 1000, 100);
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_length_shorter_than_header() {
        let result = Header::validate_prefix(PROTOCOL_VERSION, 20, DEFAULT_MAX_FRAME_LENGTH);
        assert!(matches!(result, Err(CallwireError::Protocol(_))));
    }

    #[test]
    fn test_default_max_is_clamped_to_length_field() {
        assert_eq!(effective_max_length(DEFAULT_MAX_FRAME_LENGTH), MAX_LENGTH_FIELD);
        assert!(Header::validate_prefix(PROTOCOL_VERSION, MAX_LENGTH_FIELD, DEFAULT_MAX_FRAME_LENGTH).is_ok());
    }

    #[test]
    fn test_key_display() {
        let key = InvocationKey::new(Uuid::nil(), 9);
        assert_eq!(key.to_string(), "00000000-0000-0000-0000-000000000000#9");
    }
}
