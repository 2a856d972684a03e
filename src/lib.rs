//! # callwire
//!
//! Multiplexed remote invocation over a single byte stream.
//!
//! Both ends of a [`Connection`] can export services and call the peer's.
//! Every frame carries a 25-byte header (version, length, command, service
//! id, call id), so any number of calls and streams share one stream:
//!
//! - **Calls**: request/response with per-call timeout and cancel, resolved
//!   exactly once.
//! - **Async arguments**: values not yet available at call time are sent
//!   later in their own frames.
//! - **Streams**: the consumer opens the stream and paces the producer with
//!   credit; the producer ends it with one terminal event.
//!
//! ## Example
//!
//! ```ignore
//! use callwire::{Argument, Connection, ServiceDefinition, ServiceError};
//! use uuid::Uuid;
//!
//! const GREETER: Uuid = Uuid::from_u128(0x6e7e);
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (a, b) = tokio::io::duplex(64 * 1024);
//!
//!     let _server = Connection::builder()
//!         .service(ServiceDefinition::new(GREETER).method(1, |(name,): (String,), _ctx| async move {
//!             Ok::<_, ServiceError>(format!("hello {name}"))
//!         }))
//!         .start(a)?;
//!
//!     let client = Connection::builder().start(b)?;
//!     let greeting: String = client
//!         .bind(GREETER)
//!         .call(1, vec![Argument::value(&"world")?])
//!         .await?
//!         .result()
//!         .await?;
//!     assert_eq!(greeting, "hello world");
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod failure;
pub mod protocol;
pub mod server;

mod backpressure;
mod connection;
mod timer;
mod writer;

pub use client::{
    Argument, AsyncArgument, AsyncArgumentCompleter, BindingCloseReason, PendingCall,
    RemoteStream, ServiceBinding, StreamEvent, StreamState,
};
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionBuilder};
pub use error::{CallwireError, Result};
pub use failure::{CallFailure, FailureCode, RemoteFailure, Reply, ServiceError};
pub use protocol::InvocationKey;
pub use server::{CallArgs, CallContext, ServiceDefinition, StreamSink};
