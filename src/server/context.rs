//! Per-invocation context and argument access for service methods.
//!
//! Arguments arrive in three shapes: plain values, inlined async values
//! (already resolved on the calling side), and deferred slots whose value
//! comes later in an `ASYNC_ARG_DATA` / `ASYNC_ARG_FAILURE` frame. Methods
//! read them positionally through [`CallArgs`]; deferred slots are awaited
//! with [`CallArgs::resolve`] or handed off with [`CallArgs::take_async`].

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::codec::MsgPackCodec;
use crate::failure::ServiceError;
use crate::protocol::{ArgSlot, AsyncState, InvocationKey};

type ArgOutcome = std::result::Result<Bytes, ServiceError>;

/// Context handed to each service method invocation.
#[derive(Debug, Clone)]
pub struct CallContext {
    key: InvocationKey,
    method_id: u32,
    interrupt: CancellationToken,
    cancel_requested: Arc<AtomicBool>,
}

impl CallContext {
    pub(crate) fn new(
        key: InvocationKey,
        method_id: u32,
        interrupt: CancellationToken,
        cancel_requested: Arc<AtomicBool>,
    ) -> Self {
        Self {
            key,
            method_id,
            interrupt,
            cancel_requested,
        }
    }

    /// Invocation identity.
    pub fn key(&self) -> InvocationKey {
        self.key
    }

    /// Invoked method.
    pub fn method_id(&self) -> u32 {
        self.method_id
    }

    /// Whether the caller cancelled, with or without interrupt.
    ///
    /// The result of a cancelled invocation is never sent.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Whether the caller asked to interrupt the running method.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Resolves when the caller interrupts the invocation.
    pub async fn interrupted(&self) {
        self.interrupt.cancelled().await
    }
}

/// Why an argument could not be produced.
#[derive(Debug, Clone, Error)]
pub enum ArgumentError {
    /// Fewer arguments than requested.
    #[error("Argument {0} is missing")]
    Missing(usize),

    /// Bytes did not decode as the requested type.
    #[error("Argument {index} could not be decoded: {reason}")]
    Decode {
        /// Parameter position.
        index: usize,
        /// Decoder diagnostic.
        reason: String,
    },

    /// Slot is deferred; use [`CallArgs::resolve`] or [`CallArgs::take_async`].
    #[error("Argument {0} is not resolved yet")]
    Deferred(usize),

    /// Slot was already taken.
    #[error("Argument {0} was already taken")]
    Taken(usize),

    /// The caller's async value failed.
    #[error("Argument {index} failed: {error}")]
    Failed {
        /// Parameter position.
        index: usize,
        /// Failure reported by the caller.
        error: ServiceError,
    },

    /// Wrong number of arguments for the method.
    #[error("Expected {expected} arguments, got {actual}")]
    Arity {
        /// Declared parameter count.
        expected: usize,
        /// Received argument count.
        actual: usize,
    },
}

impl ArgumentError {
    /// Whether this is a failure of the caller's value rather than of the
    /// request itself.
    pub fn is_value_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl From<ArgumentError> for ServiceError {
    fn from(err: ArgumentError) -> Self {
        match err {
            ArgumentError::Failed { error, .. } => error,
            other => ServiceError::new("argument", other.to_string()),
        }
    }
}

#[derive(Debug)]
enum ArgCell {
    Ready(ArgOutcome),
    Awaiting(oneshot::Receiver<ArgOutcome>),
    Taken,
}

/// Positional arguments of one invocation.
#[derive(Debug)]
pub struct CallArgs {
    cells: Vec<ArgCell>,
}

impl CallArgs {
    /// Build from decoded slots.
    ///
    /// Returns the senders for deferred slots, keyed by parameter index.
    pub(crate) fn from_slots(slots: Vec<ArgSlot>) -> (Self, Vec<(u32, oneshot::Sender<ArgOutcome>)>) {
        let mut deferred = Vec::new();
        let cells = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| match slot {
                ArgSlot::Value(bytes) => ArgCell::Ready(Ok(Bytes::from(bytes.into_vec()))),
                ArgSlot::Async(inline) => ArgCell::Ready(match inline.state {
                    AsyncState::Succeeded => Ok(Bytes::from(inline.value.into_vec())),
                    AsyncState::Failed => Err(decode_failure(&inline.value)),
                }),
                ArgSlot::Deferred => {
                    let (tx, rx) = oneshot::channel();
                    deferred.push((index as u32, tx));
                    ArgCell::Awaiting(rx)
                }
            })
            .collect();
        (Self { cells }, deferred)
    }

    /// Arguments with the given ready values, mainly for tests.
    pub fn from_values(values: Vec<Bytes>) -> Self {
        Self {
            cells: values.into_iter().map(|v| ArgCell::Ready(Ok(v))).collect(),
        }
    }

    /// Number of arguments received.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether no arguments were received.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Fail unless exactly `expected` arguments were received.
    pub fn expect_arity(&self, expected: usize) -> Result<(), ArgumentError> {
        if self.cells.len() != expected {
            return Err(ArgumentError::Arity {
                expected,
                actual: self.cells.len(),
            });
        }
        Ok(())
    }

    /// Decode a ready argument.
    pub fn value<T: DeserializeOwned>(&self, index: usize) -> Result<T, ArgumentError> {
        match self.cells.get(index) {
            None => Err(ArgumentError::Missing(index)),
            Some(ArgCell::Ready(Ok(bytes))) => decode_at(index, bytes),
            Some(ArgCell::Ready(Err(error))) => Err(ArgumentError::Failed {
                index,
                error: error.clone(),
            }),
            Some(ArgCell::Awaiting(_)) => Err(ArgumentError::Deferred(index)),
            Some(ArgCell::Taken) => Err(ArgumentError::Taken(index)),
        }
    }

    /// Wait for an argument, deferred or not, and decode it.
    pub async fn resolve<T: DeserializeOwned>(&mut self, index: usize) -> Result<T, ArgumentError> {
        self.take_async(index)?.get().await
    }

    /// Take an argument as a value that may still be in flight.
    pub fn take_async<T: DeserializeOwned>(
        &mut self,
        index: usize,
    ) -> Result<AsyncValue<T>, ArgumentError> {
        let cell = self
            .cells
            .get_mut(index)
            .ok_or(ArgumentError::Missing(index))?;
        let inner = match std::mem::replace(cell, ArgCell::Taken) {
            ArgCell::Taken => return Err(ArgumentError::Taken(index)),
            ArgCell::Ready(outcome) => AsyncValueState::Ready(outcome),
            ArgCell::Awaiting(rx) => AsyncValueState::Awaiting(rx),
        };
        Ok(AsyncValue {
            index,
            inner,
            _marker: PhantomData,
        })
    }
}

#[derive(Debug)]
enum AsyncValueState {
    Ready(ArgOutcome),
    Awaiting(oneshot::Receiver<ArgOutcome>),
}

/// An argument value that may arrive after the method started.
#[derive(Debug)]
pub struct AsyncValue<T> {
    index: usize,
    inner: AsyncValueState,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> AsyncValue<T> {
    /// Whether the value is available without waiting.
    pub fn is_ready(&self) -> bool {
        matches!(self.inner, AsyncValueState::Ready(_))
    }

    /// Wait for the value and decode it.
    pub async fn get(self) -> Result<T, ArgumentError> {
        let index = self.index;
        let outcome = match self.inner {
            AsyncValueState::Ready(outcome) => outcome,
            AsyncValueState::Awaiting(rx) => rx.await.unwrap_or_else(|_| {
                Err(ServiceError::new(
                    "abandoned",
                    "Invocation ended before the argument arrived",
                ))
            }),
        };
        match outcome {
            Ok(bytes) => decode_at(index, &bytes),
            Err(error) => Err(ArgumentError::Failed { index, error }),
        }
    }
}

fn decode_at<T: DeserializeOwned>(index: usize, bytes: &[u8]) -> Result<T, ArgumentError> {
    MsgPackCodec::decode(bytes).map_err(|e| ArgumentError::Decode {
        index,
        reason: e.to_string(),
    })
}

/// Failure payloads from foreign peers may not be a [`ServiceError`].
fn decode_failure(bytes: &[u8]) -> ServiceError {
    MsgPackCodec::decode(bytes).unwrap_or_else(|_| {
        ServiceError::new("remote", format!("{} byte failure payload", bytes.len()))
    })
}
