//! Codec module - the serialization collaborator for frame payloads.
//!
//! The engine treats serialization as an opaque component: every payload
//! (call envelopes, argument values, results, failures, stream items) goes
//! through [`MsgPackCodec`]. Codecs are marker structs with static methods
//! rather than trait objects, which keeps codec selection at compile time.
//!
//! # Example
//!
//! ```
//! use callwire::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
