//! Service bindings: the caller's handle on one remote service.
//!
//! A [`ServiceBinding`] issues calls against one service id over one
//! connection. Call ids come from a counter shared by every binding of the
//! same service on the same connection.
//!
//! A binding is closed explicitly, when the connection goes away, or when
//! the peer reports that the service or method does not exist. Closing is
//! idempotent: listeners registered with [`ServiceBinding::on_close`] run
//! exactly once.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::async_arg::{prepare_arguments, Argument, DeferredArgument};
use super::registry::{CallOutcome, InvocationRegistry};
use super::stream::RemoteStream;
use super::ClientCore;
use crate::codec::MsgPackCodec;
use crate::error::{CallwireError, Result};
use crate::failure::CallFailure;
use crate::protocol::{async_arg_frame, call_frame, CallRequest, InvocationKey, StreamHandle};
use crate::writer::OutboundFrame;

/// Why a binding was closed.
#[derive(Debug, Clone)]
pub enum BindingCloseReason {
    /// [`ServiceBinding::close`] was called.
    Requested,
    /// The peer reported a missing service or method.
    ApiMismatch(CallFailure),
    /// The connection closed.
    ConnectionClosed,
}

type CloseListener = Box<dyn FnOnce(&BindingCloseReason) + Send + 'static>;

/// Shared close state of a binding.
pub(crate) struct BindingState {
    service_id: Uuid,
    closed: AtomicBool,
    reason: Mutex<Option<BindingCloseReason>>,
    listeners: Mutex<Vec<CloseListener>>,
}

impl BindingState {
    pub(crate) fn new(service_id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            service_id,
            closed: AtomicBool::new(false),
            reason: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Close the binding. Returns `true` only for the call that closed it.
    pub(crate) fn close(&self, reason: BindingCloseReason) -> bool {
        let listeners = {
            let mut listeners = self.listeners.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            *self.reason.lock() = Some(reason.clone());
            std::mem::take(&mut *listeners)
        };

        match &reason {
            BindingCloseReason::ApiMismatch(failure) => {
                tracing::warn!(service_id = %self.service_id, "Closing binding: {}", failure);
            }
            other => {
                tracing::debug!(service_id = %self.service_id, reason = ?other, "Closing binding");
            }
        }

        for listener in listeners {
            listener(&reason);
        }
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register a close listener; runs immediately if already closed.
    pub(crate) fn on_close<F>(&self, listener: F)
    where
        F: FnOnce(&BindingCloseReason) + Send + 'static,
    {
        let mut listeners = self.listeners.lock();
        if self.is_closed() {
            drop(listeners);
            if let Some(reason) = self.reason.lock().clone() {
                listener(&reason);
            }
            return;
        }
        listeners.push(Box::new(listener));
    }
}

/// Caller-side handle on one remote service.
#[derive(Clone)]
pub struct ServiceBinding {
    service_id: Uuid,
    core: Arc<ClientCore>,
    state: Arc<BindingState>,
    counter: Arc<AtomicU32>,
}

impl ServiceBinding {
    pub(crate) fn new(
        service_id: Uuid,
        core: Arc<ClientCore>,
        state: Arc<BindingState>,
        counter: Arc<AtomicU32>,
    ) -> Self {
        Self {
            service_id,
            core,
            state,
            counter,
        }
    }

    /// Remote service id.
    pub fn service_id(&self) -> Uuid {
        self.service_id
    }

    /// Call a method with the connection's default timeout.
    pub async fn call<R: DeserializeOwned>(
        &self,
        method_id: u32,
        args: Vec<Argument>,
    ) -> Result<PendingCall<R>> {
        self.call_with_timeout(method_id, args, self.core.default_timeout)
            .await
    }

    /// Call a method with an explicit timeout.
    ///
    /// Returns once the request has been handed to the writer; await
    /// [`PendingCall::result`] for the outcome. Write failures surface there
    /// as [`CallFailure::Comms`].
    pub async fn call_with_timeout<R: DeserializeOwned>(
        &self,
        method_id: u32,
        args: Vec<Argument>,
        timeout: Duration,
    ) -> Result<PendingCall<R>> {
        self.ensure_open()?;
        let key = self.next_key();
        self.issue(key, method_id, args, timeout).await
    }

    async fn issue<R: DeserializeOwned>(
        &self,
        key: InvocationKey,
        method_id: u32,
        args: Vec<Argument>,
        timeout: Duration,
    ) -> Result<PendingCall<R>> {
        let (slots, deferred) = prepare_arguments(args);
        let frame = call_frame(
            key,
            true,
            &CallRequest {
                method_id,
                args: slots,
            },
            self.core.max_frame_length,
        )?;

        let receiver =
            self.core
                .registry
                .register(key, method_id, timeout, self.state.clone())?;

        tracing::trace!(%key, method_id, "Sending call");
        match self.core.writer.send(OutboundFrame::new(frame)).await {
            Ok(()) => self.spawn_deferred(key, deferred),
            Err(e) => {
                self.core
                    .registry
                    .resolve(key, Err(CallFailure::Comms(e.to_string())));
            }
        }

        Ok(PendingCall {
            key,
            receiver,
            registry: self.core.registry.clone(),
            _marker: PhantomData,
        })
    }

    /// Fire-and-forget call. Nothing is registered; no response will come.
    pub async fn call_no_return(&self, method_id: u32, args: Vec<Argument>) -> Result<InvocationKey> {
        self.ensure_open()?;
        let key = self.next_key();
        let (slots, deferred) = prepare_arguments(args);
        let frame = call_frame(
            key,
            false,
            &CallRequest {
                method_id,
                args: slots,
            },
            self.core.max_frame_length,
        )?;

        self.core.writer.send(OutboundFrame::new(frame)).await?;
        self.spawn_deferred(key, deferred);
        Ok(key)
    }

    /// Call a streaming method and wait for the stream's identity.
    ///
    /// The returned stream is not open yet; call [`RemoteStream::open`] to
    /// start delivery. Events the producer sends before that are kept.
    pub async fn call_stream<T: DeserializeOwned>(
        &self,
        method_id: u32,
        args: Vec<Argument>,
    ) -> Result<RemoteStream<T>> {
        self.ensure_open()?;
        let key = self.next_key();
        // The stream shares the call's identity; listen before the peer can send
        let events = self.core.streams.register(key);

        let issued = self
            .issue::<StreamHandle>(key, method_id, args, self.core.default_timeout)
            .await;
        let handle = match issued {
            Ok(pending) => pending.result().await.map_err(CallwireError::from),
            Err(e) => Err(e),
        };

        match handle {
            Ok(handle) if handle.key() == key => {
                Ok(RemoteStream::new(key, self.core.clone(), events))
            }
            Ok(handle) => {
                self.core.streams.remove(&key);
                let events = self.core.streams.register(handle.key());
                Ok(RemoteStream::new(handle.key(), self.core.clone(), events))
            }
            Err(e) => {
                self.core.streams.remove(&key);
                Err(e)
            }
        }
    }

    /// Cancel a call issued through this binding.
    ///
    /// No-op (`false`) if it already completed or was fire-and-forget.
    pub fn cancel(&self, key: InvocationKey, interrupt: bool) -> bool {
        self.core.registry.cancel(key, interrupt)
    }

    /// Close the binding. New calls fail with `BindingClosed`; calls already
    /// in flight are unaffected.
    pub fn close(&self) -> bool {
        self.state.close(BindingCloseReason::Requested)
    }

    /// Run `listener` once when the binding closes.
    pub fn on_close<F>(&self, listener: F)
    where
        F: FnOnce(&BindingCloseReason) + Send + 'static,
    {
        self.state.on_close(listener);
    }

    /// Whether the binding is closed.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.is_closed() {
            return Err(CallwireError::BindingClosed(self.service_id));
        }
        Ok(())
    }

    /// Next call id whose key is not in use.
    fn next_key(&self) -> InvocationKey {
        loop {
            let call_id = self.counter.fetch_add(1, Ordering::Relaxed) as i32;
            let key = InvocationKey::new(self.service_id, call_id);
            if !self.core.registry.contains(&key) && !self.core.streams.contains(&key) {
                return key;
            }
        }
    }

    /// Start one listener per deferred argument.
    fn spawn_deferred(&self, key: InvocationKey, deferred: Vec<DeferredArgument>) {
        for argument in deferred {
            let writer = self.core.writer.clone();
            let max_frame_length = self.core.max_frame_length;
            tokio::spawn(async move {
                let index = argument.index;
                let outcome = argument.resolve().await;
                let sent = async_arg_frame(key, index, &outcome, max_frame_length)
                    .map(OutboundFrame::new);
                match sent {
                    Ok(frame) => {
                        if let Err(e) = writer.send(frame).await {
                            tracing::debug!(%key, index, "Async argument not delivered: {}", e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%key, index, "Failed to encode async argument: {}", e);
                    }
                }
            });
        }
    }
}

/// A call awaiting its outcome.
pub struct PendingCall<R> {
    key: InvocationKey,
    receiver: oneshot::Receiver<CallOutcome>,
    registry: Arc<InvocationRegistry>,
    _marker: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> PendingCall<R> {
    /// Identity of the call.
    pub fn key(&self) -> InvocationKey {
        self.key
    }

    /// Cancel the call. `false` if it already completed.
    pub fn cancel(&self, interrupt: bool) -> bool {
        self.registry.cancel(self.key, interrupt)
    }

    /// Wait for the outcome and decode the return value.
    pub async fn result(self) -> std::result::Result<R, CallFailure> {
        let payload = self
            .receiver
            .await
            .map_err(|_| CallFailure::ConnectionLost)??;
        MsgPackCodec::decode(&payload).map_err(|e| CallFailure::Decode(e.to_string()))
    }
}
