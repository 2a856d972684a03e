//! Consumer side of the streaming sub-protocol.
//!
//! A [`RemoteStream`] moves through `AwaitingOpen → Open → Closed`. Nothing
//! is delivered until [`open`](RemoteStream::open) sends `STREAM_OPEN`, and
//! nothing is produced until [`request`](RemoteStream::request) grants
//! credit. The producer ends the stream with exactly one terminal event,
//! surfaced as [`StreamEvent::Closed`] or [`StreamEvent::Failed`].
//!
//! # Example
//!
//! ```ignore
//! let mut stream = binding.call_stream::<u32>(METHOD_COUNT, args).await?;
//! stream.open().await?;
//! stream.request(16).await?;
//! while let Some(event) = stream.next_event().await {
//!     match event {
//!         StreamEvent::Data(n) => println!("{n}"),
//!         StreamEvent::Closed => break,
//!         StreamEvent::Failed(e) => return Err(e.into()),
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use super::ClientCore;
use crate::codec::MsgPackCodec;
use crate::error::{CallwireError, Result};
use crate::failure::CallFailure;
use crate::protocol::{back_pressure_frame, stream_close_frame, stream_open_frame, InvocationKey};
use crate::writer::OutboundFrame;

/// One event delivered on a stream.
#[derive(Debug)]
pub enum StreamEvent<T> {
    /// One item.
    Data(T),
    /// Producer finished normally.
    Closed,
    /// Producer failed, or the stream broke locally.
    Failed(CallFailure),
}

/// Lifecycle state of a [`RemoteStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Handle received, `STREAM_OPEN` not sent yet.
    AwaitingOpen,
    /// Delivering events.
    Open,
    /// Terminal.
    Closed,
}

type RawEvent = StreamEvent<Bytes>;

/// Per-connection table of open client streams.
#[derive(Default)]
pub(crate) struct ClientStreams {
    sessions: Mutex<HashMap<InvocationKey, mpsc::UnboundedSender<RawEvent>>>,
}

impl ClientStreams {
    pub(crate) fn register(&self, key: InvocationKey) -> mpsc::UnboundedReceiver<RawEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().insert(key, tx);
        rx
    }

    /// Deliver one item. `false` if the stream is unknown.
    pub(crate) fn deliver(&self, key: InvocationKey, payload: Bytes) -> bool {
        let sessions = self.sessions.lock();
        match sessions.get(&key) {
            Some(tx) => tx.send(StreamEvent::Data(payload)).is_ok(),
            None => {
                tracing::debug!(%key, "Dropping data for unknown stream");
                false
            }
        }
    }

    /// Deliver a terminal event and forget the stream.
    pub(crate) fn finish(&self, key: InvocationKey, event: RawEvent) -> bool {
        match self.sessions.lock().remove(&key) {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                tracing::debug!(%key, "Dropping terminal event for unknown stream");
                false
            }
        }
    }

    pub(crate) fn remove(&self, key: &InvocationKey) -> bool {
        self.sessions.lock().remove(key).is_some()
    }

    pub(crate) fn contains(&self, key: &InvocationKey) -> bool {
        self.sessions.lock().contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Fail every stream, e.g. on connection loss.
    pub(crate) fn fail_all(&self, failure: CallFailure) -> usize {
        let drained: Vec<_> = self.sessions.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(StreamEvent::Failed(failure.clone()));
        }
        count
    }
}

/// Consumer handle on a remote stream.
///
/// Dropping a stream that is not closed sends `STREAM_CLOSE`.
pub struct RemoteStream<T> {
    key: InvocationKey,
    state: StreamState,
    core: Arc<ClientCore>,
    events: Option<mpsc::UnboundedReceiver<RawEvent>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RemoteStream<T> {
    pub(crate) fn new(
        key: InvocationKey,
        core: Arc<ClientCore>,
        events: mpsc::UnboundedReceiver<RawEvent>,
    ) -> Self {
        Self {
            key,
            state: StreamState::AwaitingOpen,
            core,
            events: Some(events),
            _marker: PhantomData,
        }
    }

    /// Stream identity.
    pub fn key(&self) -> InvocationKey {
        self.key
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Send `STREAM_OPEN` and start receiving events.
    pub async fn open(&mut self) -> Result<()> {
        if self.state != StreamState::AwaitingOpen {
            return Err(CallwireError::Protocol(format!(
                "Stream {} cannot be opened from state {:?}",
                self.key, self.state
            )));
        }

        let sent = self.send(stream_open_frame(self.key)?).await;
        if sent.is_err() {
            self.teardown();
            return sent;
        }
        self.state = StreamState::Open;
        Ok(())
    }

    /// Grant credit to the producer.
    ///
    /// `0` does nothing, a positive value grants that many items, and a
    /// negative value cancels the stream (same as [`close`](Self::close)).
    pub async fn request(&mut self, credit: i64) -> Result<()> {
        if credit < 0 {
            return self.close().await;
        }
        if self.state != StreamState::Open {
            return Err(CallwireError::StreamClosed);
        }
        if credit == 0 {
            return Ok(());
        }
        self.send(back_pressure_frame(self.key, credit)?).await
    }

    /// Cancel the stream: send one `STREAM_CLOSE` and stop delivering.
    ///
    /// Closing an already-closed stream does nothing.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        self.teardown();
        self.send(stream_close_frame(self.key)?).await
    }

    fn teardown(&mut self) {
        self.state = StreamState::Closed;
        self.core.streams.remove(&self.key);
        self.events = None;
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        self.core.writer.send(OutboundFrame::new(frame)).await
    }
}

impl<T: DeserializeOwned> RemoteStream<T> {
    /// Next event, or `None` once the stream is closed.
    ///
    /// Delivers at most one terminal event.
    pub async fn next_event(&mut self) -> Option<StreamEvent<T>> {
        if self.state != StreamState::Open {
            return None;
        }
        let event = match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        };

        match event {
            Some(StreamEvent::Data(payload)) => match MsgPackCodec::decode(&payload) {
                Ok(item) => Some(StreamEvent::Data(item)),
                Err(e) => {
                    let _ = self.close().await;
                    Some(StreamEvent::Failed(CallFailure::Decode(e.to_string())))
                }
            },
            Some(StreamEvent::Closed) => {
                self.teardown();
                Some(StreamEvent::Closed)
            }
            Some(StreamEvent::Failed(failure)) => {
                self.teardown();
                Some(StreamEvent::Failed(failure))
            }
            None => {
                self.teardown();
                Some(StreamEvent::Failed(CallFailure::ConnectionLost))
            }
        }
    }
}

impl<T> Drop for RemoteStream<T> {
    fn drop(&mut self) {
        if self.state == StreamState::Closed {
            return;
        }
        self.core.streams.remove(&self.key);
        let result = stream_close_frame(self.key)
            .and_then(|frame| self.core.writer.try_send(OutboundFrame::new(frame)));
        if let Err(e) = result {
            tracing::debug!(key = %self.key, "Could not send close for dropped stream: {}", e);
        }
    }
}
