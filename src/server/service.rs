//! Service definitions: typed methods registered under numeric ids.
//!
//! A [`ServiceDefinition`] maps method ids to either a unary [`Method`] or a
//! [`StreamMethod`]. Closures are wrapped so that argument decoding and
//! result serialization happen in one place:
//!
//! - arguments that fail to decode reply `FAILURE_TO_DESERIALIZE`;
//! - a failed async argument is reported as the method's own failure;
//! - `Ok` / `Err` become `SUCCESS_RESPONSE` / `FAILURE_RESPONSE`, with the
//!   serialization fallbacks of [`Reply`].
//!
//! # Example
//!
//! ```
//! use callwire::server::ServiceDefinition;
//! use callwire::ServiceError;
//! use uuid::Uuid;
//!
//! let calculator = ServiceDefinition::new(Uuid::from_u128(1))
//!     .method(1, |(a, b): (i64, i64), _ctx| async move {
//!         Ok::<_, ServiceError>(a + b)
//!     })
//!     .stream_method(2, |(n,): (u32,), sink, _ctx| async move {
//!         for i in 0..n {
//!             sink.send(&i).await?;
//!         }
//!         Ok::<_, ServiceError>(())
//!     });
//!
//! assert!(calculator.has_method(1));
//! assert!(calculator.has_method(2));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::context::{ArgumentError, CallArgs, CallContext};
use super::stream::StreamSink;
use crate::codec::MsgPackCodec;
use crate::failure::{FailureCode, Reply, ServiceError};

/// Boxed future used at the method seam.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Build a method's parameters from the received arguments.
pub trait FromArgs: Sized + Send + 'static {
    /// Decode, waiting for deferred arguments as needed.
    fn from_args(args: CallArgs) -> BoxFuture<'static, Result<Self, ArgumentError>>;
}

impl FromArgs for CallArgs {
    fn from_args(args: CallArgs) -> BoxFuture<'static, Result<Self, ArgumentError>> {
        Box::pin(async move { Ok(args) })
    }
}

impl FromArgs for () {
    fn from_args(args: CallArgs) -> BoxFuture<'static, Result<Self, ArgumentError>> {
        Box::pin(async move { args.expect_arity(0) })
    }
}

macro_rules! impl_from_args {
    ($len:expr; $($ty:ident => $idx:tt),+) => {
        impl<$($ty),+> FromArgs for ($($ty,)+)
        where
            $($ty: DeserializeOwned + Send + 'static),+
        {
            fn from_args(mut args: CallArgs) -> BoxFuture<'static, Result<Self, ArgumentError>> {
                Box::pin(async move {
                    args.expect_arity($len)?;
                    Ok(($(args.resolve::<$ty>($idx).await?,)+))
                })
            }
        }
    };
}

impl_from_args!(1; A => 0);
impl_from_args!(2; A => 0, B => 1);
impl_from_args!(3; A => 0, B => 1, C => 2);
impl_from_args!(4; A => 0, B => 1, C => 2, D => 3);

/// Reply for arguments that could not be produced.
fn argument_reply(err: ArgumentError) -> Reply {
    match err {
        ArgumentError::Failed { error, .. } => Reply::failure(&error),
        other => Reply::protocol(FailureCode::ToDeserialize, other.to_string()),
    }
}

/// A unary service method.
pub trait Method: Send + Sync + 'static {
    /// Run the method to completion.
    fn call(&self, args: CallArgs, ctx: CallContext) -> BoxFuture<'static, Reply>;
}

/// Adapter from an async closure to [`Method`].
pub struct TypedMethod<F, A, Fut> {
    handler: Arc<F>,
    _phantom: PhantomData<fn(A) -> Fut>,
}

impl<F, A, Fut> TypedMethod<F, A, Fut> {
    /// Wrap a closure.
    pub fn new(handler: F) -> Self {
        Self {
            handler: Arc::new(handler),
            _phantom: PhantomData,
        }
    }
}

impl<F, A, Fut, R, E> Method for TypedMethod<F, A, Fut>
where
    F: Fn(A, CallContext) -> Fut + Send + Sync + 'static,
    A: FromArgs,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Serialize + Send + 'static,
    E: Serialize + fmt::Display + Send + 'static,
{
    fn call(&self, args: CallArgs, ctx: CallContext) -> BoxFuture<'static, Reply> {
        let handler = self.handler.clone();
        Box::pin(async move {
            let params = match A::from_args(args).await {
                Ok(params) => params,
                Err(e) => return argument_reply(e),
            };
            match handler(params, ctx).await {
                Ok(value) => Reply::success(&value),
                Err(error) => Reply::failure(&error),
            }
        })
    }
}

/// How a stream producer ended.
#[derive(Debug, Clone)]
pub enum StreamTermination {
    /// Normal end: `STREAM_CLOSE_EVENT`.
    Completed,
    /// Failure: `STREAM_ERROR_EVENT` with this serialized failure.
    Failed(Bytes),
}

impl StreamTermination {
    /// Serialize a producer failure.
    ///
    /// A failure that cannot be serialized is replaced by a [`ServiceError`]
    /// carrying its display text.
    pub fn failed<E: Serialize + fmt::Display + ?Sized>(error: &E) -> Self {
        let bytes = MsgPackCodec::encode(error).or_else(|e| {
            MsgPackCodec::encode(&ServiceError::new(
                "serialization",
                format!("Failed to serialize stream failure ({}): {}", error, e),
            ))
        });
        Self::Failed(Bytes::from(bytes.unwrap_or_default()))
    }
}

/// Started producer, run once the stream handle has been sent.
pub type StreamProducer = Box<dyn FnOnce(StreamSink) -> BoxFuture<'static, StreamTermination> + Send>;

/// A streaming service method.
pub trait StreamMethod: Send + Sync + 'static {
    /// Prepare the producer.
    ///
    /// `Err` is sent as the call's response instead of a stream handle.
    fn start(
        &self,
        args: CallArgs,
        ctx: CallContext,
    ) -> BoxFuture<'static, Result<StreamProducer, Reply>>;
}

/// Adapter from an async closure to [`StreamMethod`].
pub struct TypedStreamMethod<F, A, Fut> {
    handler: Arc<F>,
    _phantom: PhantomData<fn(A) -> Fut>,
}

impl<F, A, Fut> TypedStreamMethod<F, A, Fut> {
    /// Wrap a closure.
    pub fn new(handler: F) -> Self {
        Self {
            handler: Arc::new(handler),
            _phantom: PhantomData,
        }
    }
}

impl<F, A, Fut, E> StreamMethod for TypedStreamMethod<F, A, Fut>
where
    F: Fn(A, StreamSink, CallContext) -> Fut + Send + Sync + 'static,
    A: FromArgs,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Serialize + fmt::Display + Send + 'static,
{
    fn start(
        &self,
        args: CallArgs,
        ctx: CallContext,
    ) -> BoxFuture<'static, Result<StreamProducer, Reply>> {
        let handler = self.handler.clone();
        Box::pin(async move {
            let params = A::from_args(args).await.map_err(argument_reply)?;
            let producer: StreamProducer = Box::new(move |sink: StreamSink| {
                Box::pin(async move {
                    match handler(params, sink, ctx).await {
                        Ok(()) => StreamTermination::Completed,
                        Err(error) => StreamTermination::failed(&error),
                    }
                })
            });
            Ok(producer)
        })
    }
}

#[derive(Clone)]
pub(crate) enum MethodKind {
    Unary(Arc<dyn Method>),
    Stream(Arc<dyn StreamMethod>),
}

/// A service: an id plus its methods.
#[derive(Clone)]
pub struct ServiceDefinition {
    id: Uuid,
    methods: HashMap<u32, MethodKind>,
}

impl ServiceDefinition {
    /// Create an empty service.
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            methods: HashMap::new(),
        }
    }

    /// Service id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Register a unary method. Replaces any method with the same id.
    pub fn method<F, A, Fut, R, E>(self, method_id: u32, handler: F) -> Self
    where
        F: Fn(A, CallContext) -> Fut + Send + Sync + 'static,
        A: FromArgs,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Serialize + fmt::Display + Send + 'static,
    {
        self.raw_method(method_id, TypedMethod::new(handler))
    }

    /// Register a [`Method`] implementation directly.
    pub fn raw_method<M: Method>(mut self, method_id: u32, method: M) -> Self {
        if self
            .methods
            .insert(method_id, MethodKind::Unary(Arc::new(method)))
            .is_some()
        {
            tracing::warn!(service_id = %self.id, method_id, "Replacing method");
        }
        self
    }

    /// Register a streaming method. Replaces any method with the same id.
    pub fn stream_method<F, A, Fut, E>(mut self, method_id: u32, handler: F) -> Self
    where
        F: Fn(A, StreamSink, CallContext) -> Fut + Send + Sync + 'static,
        A: FromArgs,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Serialize + fmt::Display + Send + 'static,
    {
        let method = MethodKind::Stream(Arc::new(TypedStreamMethod::new(handler)));
        if self.methods.insert(method_id, method).is_some() {
            tracing::warn!(service_id = %self.id, method_id, "Replacing method");
        }
        self
    }

    /// Whether `method_id` is defined.
    pub fn has_method(&self, method_id: u32) -> bool {
        self.methods.contains_key(&method_id)
    }

    /// Number of methods.
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub(crate) fn lookup(&self, method_id: u32) -> Option<&MethodKind> {
        self.methods.get(&method_id)
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.methods.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("ServiceDefinition")
            .field("id", &self.id)
            .field("methods", &ids)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::InvocationKey;
    use std::sync::atomic::AtomicBool;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> CallContext {
        CallContext::new(
            InvocationKey::new(Uuid::nil(), 1),
            1,
            CancellationToken::new(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn args<T: Serialize>(values: &[T]) -> CallArgs {
        CallArgs::from_values(
            values
                .iter()
                .map(|v| Bytes::from(MsgPackCodec::encode(v).unwrap()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_typed_method_success() {
        let method = TypedMethod::new(|(a, b): (i32, i32), _ctx| async move {
            Ok::<_, ServiceError>(a * b)
        });
        match method.call(args(&[6, 7]), ctx()).await {
            Reply::Success(bytes) => assert_eq!(MsgPackCodec::decode::<i32>(&bytes).unwrap(), 42),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_typed_method_failure() {
        let method = TypedMethod::new(|(): (), _ctx| async move {
            Err::<u8, _>(ServiceError::new("denied", "no"))
        });
        match method.call(CallArgs::from_values(vec![]), ctx()).await {
            Reply::Failure(bytes) => {
                let err: ServiceError = MsgPackCodec::decode(&bytes).unwrap();
                assert_eq!(err.kind, "denied");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_arguments_reply_to_deserialize() {
        let method = TypedMethod::new(|(s,): (String,), _ctx| async move {
            Ok::<_, ServiceError>(s)
        });

        let wrong_type = method.call(args(&[1u8]), ctx()).await;
        assert!(matches!(
            wrong_type,
            Reply::Protocol(FailureCode::ToDeserialize, _)
        ));

        let wrong_arity = method.call(args(&["a", "b"]), ctx()).await;
        assert!(matches!(
            wrong_arity,
            Reply::Protocol(FailureCode::ToDeserialize, _)
        ));
    }

    #[test]
    fn test_definition_lookup() {
        let def = ServiceDefinition::new(Uuid::from_u128(4))
            .method(1, |(): (), _ctx| async { Ok::<_, ServiceError>(()) })
            .stream_method(2, |(): (), _sink, _ctx| async { Ok::<_, ServiceError>(()) });

        assert_eq!(def.id(), Uuid::from_u128(4));
        assert_eq!(def.method_count(), 2);
        assert!(matches!(def.lookup(1), Some(MethodKind::Unary(_))));
        assert!(matches!(def.lookup(2), Some(MethodKind::Stream(_))));
        assert!(def.lookup(3).is_none());
    }

    #[test]
    fn test_stream_termination_failed() {
        match StreamTermination::failed(&ServiceError::new("x", "y")) {
            StreamTermination::Failed(bytes) => {
                let err: ServiceError = MsgPackCodec::decode(&bytes).unwrap();
                assert_eq!(err, ServiceError::new("x", "y"));
            }
            StreamTermination::Completed => panic!("expected failure"),
        }
    }
}
