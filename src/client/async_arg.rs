//! Call arguments, including asynchronous ones.
//!
//! An [`AsyncArgument`] is a two-state value: already resolved, or pending
//! on a channel that some other task (on any thread) will complete. At send
//! time each one is checked without waiting:
//!
//! - resolved: inlined into the request as `{state, value}` (fast path, no
//!   follow-up frame);
//! - pending: sent as a `Deferred` placeholder, and a listener delivers one
//!   `ASYNC_ARG_DATA` / `ASYNC_ARG_FAILURE` frame once it resolves.
//!
//! # Example
//!
//! ```
//! use callwire::client::{Argument, AsyncArgument};
//!
//! let (pending, completer) = AsyncArgument::pending();
//! let args = vec![Argument::value(&"header").unwrap(), pending.into()];
//!
//! // Later, from any task or thread:
//! completer.complete(&42u32);
//! # drop(args);
//! ```

use std::future::Future;

use bytes::Bytes;
use serde::Serialize;
use serde_bytes::ByteBuf;
use tokio::sync::oneshot;

use crate::codec::MsgPackCodec;
use crate::error::Result;
use crate::failure::ServiceError;
use crate::protocol::{ArgSlot, AsyncArgState, AsyncState};

type ArgOutcome = std::result::Result<Bytes, ServiceError>;

/// One positional call argument.
#[derive(Debug)]
pub enum Argument {
    /// Serialized value.
    Value(Bytes),
    /// Value that may not be available yet.
    Async(AsyncArgument),
}

impl Argument {
    /// Serialize a plain value.
    pub fn value<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::Value(Bytes::from(MsgPackCodec::encode(value)?)))
    }

    /// Use already-serialized bytes.
    pub fn raw(bytes: impl Into<Bytes>) -> Self {
        Self::Value(bytes.into())
    }
}

impl From<AsyncArgument> for Argument {
    fn from(arg: AsyncArgument) -> Self {
        Self::Async(arg)
    }
}

#[derive(Debug)]
enum AsyncArgumentState {
    Resolved(ArgOutcome),
    Pending(oneshot::Receiver<ArgOutcome>),
}

/// Argument whose value arrives asynchronously.
#[derive(Debug)]
pub struct AsyncArgument {
    state: AsyncArgumentState,
}

impl AsyncArgument {
    /// An argument that is already resolved with `value`.
    pub fn ready<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self {
            state: AsyncArgumentState::Resolved(Ok(Bytes::from(MsgPackCodec::encode(value)?))),
        })
    }

    /// An argument that is already resolved with a failure.
    pub fn failed(error: ServiceError) -> Self {
        Self {
            state: AsyncArgumentState::Resolved(Err(error)),
        }
    }

    /// An unresolved argument and the handle that resolves it.
    pub fn pending() -> (Self, AsyncArgumentCompleter) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                state: AsyncArgumentState::Pending(rx),
            },
            AsyncArgumentCompleter { tx },
        )
    }

    /// An argument resolved by a future running on its own task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_future<F, T>(future: F) -> Self
    where
        F: Future<Output = std::result::Result<T, ServiceError>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let (arg, completer) = Self::pending();
        tokio::spawn(async move {
            match future.await {
                Ok(value) => completer.complete(&value),
                Err(error) => completer.fail(error),
            }
        });
        arg
    }

    /// Whether the value is available without waiting.
    pub fn is_resolved(&self) -> bool {
        matches!(self.state, AsyncArgumentState::Resolved(_))
    }
}

/// Resolves one pending [`AsyncArgument`].
///
/// Dropping it without completing resolves the argument with a failure.
#[derive(Debug)]
pub struct AsyncArgumentCompleter {
    tx: oneshot::Sender<ArgOutcome>,
}

impl AsyncArgumentCompleter {
    /// Resolve with a value.
    ///
    /// A value that cannot be serialized resolves the argument as failed.
    pub fn complete<T: Serialize + ?Sized>(self, value: &T) {
        let outcome = MsgPackCodec::encode(value)
            .map(Bytes::from)
            .map_err(|e| ServiceError::new("serialization", e.to_string()));
        let _ = self.tx.send(outcome);
    }

    /// Resolve with already-serialized bytes.
    pub fn complete_raw(self, bytes: impl Into<Bytes>) {
        let _ = self.tx.send(Ok(bytes.into()));
    }

    /// Resolve with a failure.
    pub fn fail(self, error: ServiceError) {
        let _ = self.tx.send(Err(error));
    }
}

/// Argument that was still pending when the request was encoded.
#[derive(Debug)]
pub(crate) struct DeferredArgument {
    pub(crate) index: u32,
    receiver: oneshot::Receiver<ArgOutcome>,
}

impl DeferredArgument {
    /// Wait for the value.
    pub(crate) async fn resolve(self) -> ArgOutcome {
        self.receiver.await.unwrap_or_else(|_| Err(abandoned()))
    }
}

fn abandoned() -> ServiceError {
    ServiceError::new(
        "abandoned",
        "Async argument was dropped before it was completed",
    )
}

/// Turn arguments into request slots, splitting off the deferred ones.
pub(crate) fn prepare_arguments(args: Vec<Argument>) -> (Vec<ArgSlot>, Vec<DeferredArgument>) {
    let mut slots = Vec::with_capacity(args.len());
    let mut deferred = Vec::new();

    for (index, arg) in args.into_iter().enumerate() {
        let slot = match arg {
            Argument::Value(bytes) => ArgSlot::Value(ByteBuf::from(bytes.to_vec())),
            Argument::Async(AsyncArgument {
                state: AsyncArgumentState::Resolved(outcome),
            }) => inline_slot(outcome),
            Argument::Async(AsyncArgument {
                state: AsyncArgumentState::Pending(mut receiver),
            }) => match receiver.try_recv() {
                Ok(outcome) => inline_slot(outcome),
                Err(oneshot::error::TryRecvError::Closed) => inline_slot(Err(abandoned())),
                Err(oneshot::error::TryRecvError::Empty) => {
                    deferred.push(DeferredArgument {
                        index: index as u32,
                        receiver,
                    });
                    ArgSlot::Deferred
                }
            },
        };
        slots.push(slot);
    }

    (slots, deferred)
}

fn inline_slot(outcome: ArgOutcome) -> ArgSlot {
    let (state, value) = match outcome {
        Ok(bytes) => (AsyncState::Succeeded, bytes.to_vec()),
        Err(error) => (
            AsyncState::Failed,
            MsgPackCodec::encode(&error).unwrap_or_default(),
        ),
    };
    ArgSlot::Async(AsyncArgState {
        state,
        value: ByteBuf::from(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_inline(slot: &ArgSlot) -> (AsyncState, Vec<u8>) {
        match slot {
            ArgSlot::Async(state) => (state.state, state.value.to_vec()),
            other => panic!("expected inline async slot, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_values_pass_through() {
        let (slots, deferred) = prepare_arguments(vec![Argument::value(&5u8).unwrap()]);
        assert_eq!(slots, vec![ArgSlot::Value(ByteBuf::from(vec![0x05]))]);
        assert!(deferred.is_empty());
    }

    #[test]
    fn test_ready_argument_is_inlined() {
        let arg = AsyncArgument::ready(&true).unwrap();
        assert!(arg.is_resolved());

        let (slots, deferred) = prepare_arguments(vec![arg.into()]);
        assert!(deferred.is_empty());
        assert_eq!(decode_inline(&slots[0]), (AsyncState::Succeeded, vec![0xc3]));
    }

    #[test]
    fn test_pending_completed_before_send_takes_fast_path() {
        let (arg, completer) = AsyncArgument::pending();
        completer.complete(&"done");

        let (slots, deferred) = prepare_arguments(vec![arg.into()]);
        assert!(deferred.is_empty());
        let (state, value) = decode_inline(&slots[0]);
        assert_eq!(state, AsyncState::Succeeded);
        assert_eq!(MsgPackCodec::decode::<String>(&value).unwrap(), "done");
    }

    #[test]
    fn test_failed_argument_is_inlined_as_failed() {
        let err = ServiceError::new("io", "nope");
        let (slots, _) = prepare_arguments(vec![AsyncArgument::failed(err.clone()).into()]);
        let (state, value) = decode_inline(&slots[0]);
        assert_eq!(state, AsyncState::Failed);
        assert_eq!(MsgPackCodec::decode::<ServiceError>(&value).unwrap(), err);
    }

    #[tokio::test]
    async fn test_unresolved_argument_is_deferred_with_index() {
        let (arg, completer) = AsyncArgument::pending();
        let (slots, mut deferred) = prepare_arguments(vec![
            Argument::value(&1u8).unwrap(),
            Argument::value(&2u8).unwrap(),
            arg.into(),
        ]);

        assert_eq!(slots[2], ArgSlot::Deferred);
        assert_eq!(deferred.len(), 1);
        let deferred = deferred.remove(0);
        assert_eq!(deferred.index, 2);

        completer.complete(&9u8);
        assert_eq!(&deferred.resolve().await.unwrap()[..], &[0x09]);
    }

    #[tokio::test]
    async fn test_dropped_completer_resolves_as_failure() {
        let (arg, completer) = AsyncArgument::pending();
        let (_, mut deferred) = prepare_arguments(vec![arg.into()]);
        drop(completer);

        let outcome = deferred.remove(0).resolve().await;
        assert_eq!(outcome.unwrap_err().kind, "abandoned");
    }

    #[tokio::test]
    async fn test_from_future() {
        let arg = AsyncArgument::from_future(async {
            tokio::task::yield_now().await;
            Ok::<_, ServiceError>(17u32)
        });
        let (slots, deferred) = prepare_arguments(vec![arg.into()]);

        let outcome = match deferred.into_iter().next() {
            Some(d) => d.resolve().await.unwrap(),
            None => Bytes::from(decode_inline(&slots[0]).1),
        };
        assert_eq!(MsgPackCodec::decode::<u32>(&outcome).unwrap(), 17);
    }
}
