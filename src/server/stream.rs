//! Producer side of the streaming sub-protocol.
//!
//! Each streaming invocation owns a `StreamSession`. The session starts
//! awaiting `STREAM_OPEN`; if the consumer does not open it before the
//! open timeout, it fails with `STREAM_ERROR_EVENT` and the producer is
//! stopped. Items go out only while open and only against credit granted
//! by `STREAM_BACK_PRESSURE`. The producer's result becomes exactly one
//! terminal event, held back until the stream is open. A consumer close
//! (or a negative credit grant) stops the producer without a terminal
//! event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::service::StreamTermination;
use crate::backpressure::CreditController;
use crate::codec::MsgPackCodec;
use crate::error::{CallwireError, Result};
use crate::failure::ServiceError;
use crate::protocol::{
    stream_close_event_frame, stream_data_frame, stream_error_event_frame, Command,
    FrameEncoder, InvocationKey,
};
use crate::timer::TimerHandle;
use crate::writer::{OutboundFrame, WriterHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitingOpen,
    Open,
    Cancelled,
}

/// Server-side state of one stream.
pub(crate) struct StreamSession {
    key: InvocationKey,
    state: watch::Sender<SessionState>,
    credits: CreditController,
    cancel: CancellationToken,
    terminated: AtomicBool,
    open_timer: Mutex<Option<TimerHandle>>,
    writer: WriterHandle,
    max_frame_length: u32,
}

impl StreamSession {
    /// The session closes when `interrupt` fires; closing the session
    /// leaves `interrupt` untouched.
    pub(crate) fn new(
        key: InvocationKey,
        writer: WriterHandle,
        max_frame_length: u32,
        interrupt: &CancellationToken,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::AwaitingOpen);
        Arc::new(Self {
            key,
            state,
            credits: CreditController::new(),
            cancel: interrupt.child_token(),
            terminated: AtomicBool::new(false),
            open_timer: Mutex::new(None),
            writer,
            max_frame_length,
        })
    }

    pub(crate) fn set_open_timer(&self, timer: TimerHandle) {
        *self.open_timer.lock() = Some(timer);
    }

    fn stop_open_timer(&self) {
        if let Some(timer) = self.open_timer.lock().take() {
            timer.cancel();
        }
    }

    /// `STREAM_OPEN`. Returns `false` if the stream was not awaiting open.
    pub(crate) fn open(&self) -> bool {
        let opened = self.state.send_if_modified(|state| {
            if *state == SessionState::AwaitingOpen {
                *state = SessionState::Open;
                true
            } else {
                false
            }
        });
        if opened {
            self.stop_open_timer();
            tracing::trace!(key = %self.key, "Stream opened");
        }
        opened
    }

    /// `STREAM_BACK_PRESSURE`. Negative credit cancels the stream.
    pub(crate) fn grant(&self, credit: i64) {
        if credit < 0 {
            self.cancel();
        } else {
            self.credits.grant(credit);
        }
    }

    /// `STREAM_CLOSE` or connection teardown: stop without a terminal event.
    pub(crate) fn cancel(&self) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Cancelled {
                false
            } else {
                *state = SessionState::Cancelled;
                true
            }
        });
        self.stop_open_timer();
        self.credits.close();
        self.cancel.cancel();
    }

    /// Open deadline passed. Fails the stream if it was never opened.
    pub(crate) fn open_timed_out(&self) {
        if *self.state.borrow() != SessionState::AwaitingOpen {
            return;
        }
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(key = %self.key, "Stream was not opened in time");

        let error = ServiceError::new("stream_not_opened", "Stream was not opened in time");
        let result = MsgPackCodec::encode(&error)
            .and_then(|payload| stream_error_event_frame(self.key, &payload))
            .and_then(|frame| self.writer.try_send(OutboundFrame::new(frame)));
        if let Err(e) = result {
            tracing::debug!(key = %self.key, "Could not send stream error: {}", e);
        }
        self.cancel();
    }

    /// Send the producer's terminal event, once, after the stream opened.
    pub(crate) async fn finish(&self, termination: StreamTermination) {
        if self.wait_open().await.is_err() || self.is_cancelled() {
            return;
        }
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        let frame = match &termination {
            StreamTermination::Completed => stream_close_event_frame(self.key),
            StreamTermination::Failed(payload) => stream_error_event_frame(self.key, payload),
        };
        let sent = match frame {
            Ok(frame) => self.writer.send(OutboundFrame::new(frame)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::debug!(key = %self.key, "Terminal stream event not delivered: {}", e);
        }
        self.credits.close();
    }

    fn is_cancelled(&self) -> bool {
        *self.state.borrow() == SessionState::Cancelled
    }

    async fn wait_open(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        let opened = tokio::select! {
            result = state.wait_for(|s| *s != SessionState::AwaitingOpen) => {
                matches!(result.as_deref(), Ok(SessionState::Open))
            }
            _ = self.cancel.cancelled() => false,
        };
        if opened {
            Ok(())
        } else {
            Err(CallwireError::StreamClosed)
        }
    }

    pub(crate) fn key(&self) -> InvocationKey {
        self.key
    }
}

/// Producer handle on an outbound stream.
///
/// Cloneable; every clone feeds the same stream.
#[derive(Clone)]
pub struct StreamSink {
    session: Arc<StreamSession>,
}

impl StreamSink {
    pub(crate) fn new(session: Arc<StreamSession>) -> Self {
        Self { session }
    }

    /// Stream identity.
    pub fn key(&self) -> InvocationKey {
        self.session.key
    }

    /// Send one item.
    ///
    /// Waits until the consumer has opened the stream and granted credit.
    /// Fails with `StreamClosed` once the consumer closed the stream.
    pub async fn send<T: Serialize + ?Sized>(&self, item: &T) -> Result<()> {
        let frame = stream_data_frame(self.session.key, item, self.session.max_frame_length)?;
        self.send_frame(frame).await
    }

    /// Send one already-serialized item.
    pub async fn send_raw(&self, item: impl Into<Bytes>) -> Result<()> {
        let frame = FrameEncoder::with_max_length(
            Command::StreamData,
            self.session.key,
            self.session.max_frame_length,
        )
        .raw(&item.into())
        .finish()?;
        self.send_frame(frame).await
    }

    async fn send_frame(&self, frame: Bytes) -> Result<()> {
        self.session.wait_open().await?;
        tokio::select! {
            acquired = self.session.credits.acquire() => acquired?,
            _ = self.session.cancel.cancelled() => return Err(CallwireError::StreamClosed),
        }
        self.session.writer.send(OutboundFrame::new(frame)).await
    }

    /// Whether the consumer closed the stream.
    pub fn is_closed(&self) -> bool {
        self.session.cancel.is_cancelled()
    }

    /// Resolves when the consumer closes the stream.
    pub async fn closed(&self) {
        self.session.cancel.cancelled().await
    }

    /// Credit currently available.
    pub fn credit(&self) -> i64 {
        self.session.credits.available()
    }
}
