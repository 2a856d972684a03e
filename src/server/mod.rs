//! Serving side of a connection.
//!
//! Services are described with [`ServiceDefinition`] and exported on a
//! connection. Inbound calls are decoded, admitted against the connection's
//! handler limit, run on their own tasks, and answered with exactly one
//! response frame (or, for streaming methods, a stream handle followed by
//! credit-paced items and one terminal event).

mod context;
mod dispatch;
mod service;
mod stream;

pub use context::{ArgumentError, AsyncValue, CallArgs, CallContext};
pub use service::{
    BoxFuture, FromArgs, Method, ServiceDefinition, StreamMethod, StreamProducer,
    StreamTermination, TypedMethod, TypedStreamMethod,
};
pub use stream::StreamSink;

pub(crate) use dispatch::Dispatcher;
