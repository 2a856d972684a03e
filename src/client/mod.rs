//! Calling side of a connection.
//!
//! [`ServiceBinding`]s issue calls, the invocation registry tracks the
//! ones awaiting a response, and [`RemoteStream`]s consume streaming
//! results. All of them share one `ClientCore` per connection, which also
//! routes inbound response frames to the right place.

mod async_arg;
mod binding;
mod registry;
mod stream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

pub use async_arg::{Argument, AsyncArgument, AsyncArgumentCompleter};
pub use binding::{BindingCloseReason, PendingCall, ServiceBinding};
pub use registry::PendingSummary;
pub use stream::{RemoteStream, StreamEvent, StreamState};

use crate::failure::CallFailure;
use crate::protocol::{ClientInbound, InvocationKey};
use crate::timer::TimerWheel;
use crate::writer::WriterHandle;
use binding::BindingState;
use registry::InvocationRegistry;
use stream::ClientStreams;

/// Call ids start at 1 for every service.
const FIRST_CALL_ID: u32 = 1;

/// Per-connection client state.
pub(crate) struct ClientCore {
    pub(crate) writer: WriterHandle,
    pub(crate) registry: Arc<InvocationRegistry>,
    pub(crate) streams: ClientStreams,
    pub(crate) default_timeout: Duration,
    pub(crate) max_frame_length: u32,
    counters: Mutex<HashMap<Uuid, Arc<AtomicU32>>>,
    bindings: Mutex<Vec<Weak<BindingState>>>,
    torn_down: AtomicBool,
}

impl ClientCore {
    pub(crate) fn new(
        writer: WriterHandle,
        timers: Arc<TimerWheel>,
        default_timeout: Duration,
        max_frame_length: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: InvocationRegistry::new(timers, writer.clone()),
            writer,
            streams: ClientStreams::default(),
            default_timeout,
            max_frame_length,
            counters: Mutex::new(HashMap::new()),
            bindings: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
        })
    }

    /// Create a binding for `service_id`.
    pub(crate) fn bind(self: &Arc<Self>, service_id: Uuid) -> ServiceBinding {
        let counter = self
            .counters
            .lock()
            .entry(service_id)
            .or_insert_with(|| Arc::new(AtomicU32::new(FIRST_CALL_ID)))
            .clone();

        let state = BindingState::new(service_id);
        {
            let mut bindings = self.bindings.lock();
            if self.torn_down.load(Ordering::Acquire) {
                state.close(BindingCloseReason::ConnectionClosed);
            } else {
                bindings.retain(|b| b.strong_count() > 0);
                bindings.push(Arc::downgrade(&state));
            }
        }

        ServiceBinding::new(service_id, self.clone(), state, counter)
    }

    /// Route one response-direction message.
    pub(crate) fn handle(&self, message: ClientInbound) {
        match message {
            ClientInbound::Success { key, payload } => {
                self.registry.resolve(key, Ok(payload));
            }
            ClientInbound::Failure { key, failure } => {
                self.registry.resolve(key, Err(failure));
            }
            ClientInbound::StreamData { key, payload } => {
                self.streams.deliver(key, payload);
            }
            ClientInbound::StreamClosed { key } => {
                self.streams.finish(key, StreamEvent::Closed);
            }
            ClientInbound::StreamFailed { key, failure } => {
                self.streams.finish(key, StreamEvent::Failed(failure));
            }
        }
    }

    /// Resolve a pending call hit by an unknown response code.
    ///
    /// Returns `false` if no call is waiting on `key`.
    pub(crate) fn handle_unrecognized(&self, key: InvocationKey, code: u8) -> bool {
        if self.registry.contains(&key) {
            tracing::warn!(%key, code, "Unrecognized response code, failing call");
            self.registry
                .resolve(key, Err(CallFailure::UnrecognizedCode(code)))
        } else {
            tracing::warn!(%key, code, "Dropping frame with unrecognized code");
            false
        }
    }

    /// Fail everything in flight and close every binding.
    pub(crate) fn teardown(&self) {
        let calls = self.registry.fail_all(CallFailure::ConnectionLost);
        let streams = self.streams.fail_all(CallFailure::ConnectionLost);
        let bindings: Vec<_> = {
            let mut bindings = self.bindings.lock();
            self.torn_down.store(true, Ordering::Release);
            bindings.drain(..).collect()
        };
        for binding in bindings.iter().filter_map(Weak::upgrade) {
            binding.close(BindingCloseReason::ConnectionClosed);
        }
        tracing::debug!(calls, streams, "Client side torn down");
    }
}
