//! MsgPack codec using `rmp-serde`.
//!
//! Structs are always written with field names (`to_vec_named` /
//! `write_named`), so peers decode payloads by name rather than position and
//! adding a field does not silently shift the others.
//!
//! # Example
//!
//! ```
//! use callwire::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Message = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use bytes::{BufMut, BytesMut};

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Encode a value directly into the tail of `buf`.
    ///
    /// Used by the frame encoder so payloads of unknown size are written
    /// in place after the header. On error, `buf` is truncated back to its
    /// original length.
    pub fn encode_into<T: serde::Serialize + ?Sized>(buf: &mut BytesMut, value: &T) -> Result<()> {
        let start = buf.len();
        let mut writer = buf.writer();
        match rmp_serde::encode::write_named(&mut writer, value) {
            Ok(()) => Ok(()),
            Err(e) => {
                writer.into_inner().truncate(start);
                Err(e.into())
            }
        }
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
