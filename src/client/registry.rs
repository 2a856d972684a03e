//! Invocation registry: the per-connection table of in-flight calls.
//!
//! Every call that expects a response is registered here before its request
//! frame is written. Exactly one of {response, timeout, cancel, connection
//! loss} resolves it: each path removes the entry under the map lock, and
//! only the path that actually removed it completes the caller's result.
//! The others find nothing and return `false`.
//!
//! Timeouts live on the connection's [`TimerWheel`]. A timer callback holds
//! only a weak reference to the registry, so a closed connection does not
//! stay alive through its pending timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::binding::{BindingCloseReason, BindingState};
use crate::error::{CallwireError, Result};
use crate::failure::CallFailure;
use crate::protocol::{cancel_frame, InvocationKey};
use crate::timer::{TimerHandle, TimerWheel};
use crate::writer::{OutboundFrame, WriterHandle};

/// Deadline reported for timeouts too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Outcome delivered to the caller.
pub(crate) type CallOutcome = std::result::Result<Bytes, CallFailure>;

/// One registered call.
struct PendingInvocation {
    method_id: u32,
    timeout: Duration,
    deadline: Instant,
    timer: TimerHandle,
    completion: oneshot::Sender<CallOutcome>,
    binding: Arc<BindingState>,
}

impl PendingInvocation {
    fn complete(self, outcome: CallOutcome) {
        self.timer.cancel();
        // Receiver dropped means the caller stopped waiting
        let _ = self.completion.send(outcome);
    }
}

/// Snapshot of one pending call, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSummary {
    /// Call identity.
    pub key: InvocationKey,
    /// Invoked method.
    pub method_id: u32,
    /// When the call times out.
    pub deadline: Instant,
}

/// Per-connection pending-call table.
pub(crate) struct InvocationRegistry {
    pending: Mutex<HashMap<InvocationKey, PendingInvocation>>,
    /// Set under the `pending` lock by `fail_all`.
    closed: AtomicBool,
    timers: Arc<TimerWheel>,
    writer: WriterHandle,
}

impl InvocationRegistry {
    pub(crate) fn new(timers: Arc<TimerWheel>, writer: WriterHandle) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            timers,
            writer,
        })
    }

    /// Register a call and start its timeout.
    ///
    /// Returns the receiver on which the single outcome will arrive, or
    /// `ConnectionClosed` once the registry has been failed.
    pub(crate) fn register(
        self: &Arc<Self>,
        key: InvocationKey,
        method_id: u32,
        timeout: Duration,
        binding: Arc<BindingState>,
    ) -> Result<oneshot::Receiver<CallOutcome>> {
        let (tx, rx) = oneshot::channel();

        let mut pending = self.pending.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(CallwireError::ConnectionClosed);
        }
        if pending.contains_key(&key) {
            return Err(CallwireError::Protocol(format!(
                "Invocation {} is already registered",
                key
            )));
        }

        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);

        let registry: Weak<Self> = Arc::downgrade(self);
        let timer = self.timers.schedule(timeout, move || {
            if let Some(registry) = registry.upgrade() {
                registry.expire(key);
            }
        });

        pending.insert(
            key,
            PendingInvocation {
                method_id,
                timeout,
                deadline,
                timer,
                completion: tx,
                binding,
            },
        );

        Ok(rx)
    }

    /// Resolve a call with its outcome.
    ///
    /// Returns `false` when the key is no longer registered (late or
    /// duplicate response); the outcome is discarded.
    pub(crate) fn resolve(&self, key: InvocationKey, outcome: CallOutcome) -> bool {
        let Some(entry) = self.pending.lock().remove(&key) else {
            tracing::debug!(%key, "Discarding response for unknown or completed call");
            return false;
        };

        if let Err(failure) = &outcome {
            if failure.is_binding_fatal() {
                entry
                    .binding
                    .close(BindingCloseReason::ApiMismatch(failure.clone()));
            }
        }

        entry.complete(outcome);
        true
    }

    /// Cancel a call locally and tell the peer.
    ///
    /// Returns `false` if the call is not registered (already completed, or a
    /// fire-and-forget call that never was).
    pub(crate) fn cancel(&self, key: InvocationKey, interrupt: bool) -> bool {
        let Some(entry) = self.pending.lock().remove(&key) else {
            return false;
        };

        tracing::debug!(%key, method_id = entry.method_id, interrupt, "Cancelling call");
        entry.complete(Err(CallFailure::Cancelled));
        self.send_cancel(key, interrupt);
        true
    }

    /// Timer expiry path.
    fn expire(&self, key: InvocationKey) {
        let Some(entry) = self.pending.lock().remove(&key) else {
            return;
        };

        tracing::debug!(%key, method_id = entry.method_id, "Call timed out");
        let timeout = entry.timeout;
        entry.complete(Err(CallFailure::Timeout(timeout)));
        self.send_cancel(key, true);
    }

    /// Fail every registered call, e.g. on connection loss. Later
    /// registrations are refused.
    ///
    /// Returns the number of calls failed.
    pub(crate) fn fail_all(&self, failure: CallFailure) -> usize {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            self.closed.store(true, Ordering::Release);
            pending.drain().collect()
        };
        let count = drained.len();
        for (_, entry) in drained {
            entry.complete(Err(failure.clone()));
        }
        count
    }

    /// Whether `key` is registered.
    pub(crate) fn contains(&self, key: &InvocationKey) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Number of registered calls.
    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Snapshot of the registered calls.
    pub(crate) fn snapshot(&self) -> Vec<PendingSummary> {
        self.pending
            .lock()
            .iter()
            .map(|(key, entry)| PendingSummary {
                key: *key,
                method_id: entry.method_id,
                deadline: entry.deadline,
            })
            .collect()
    }

    /// Best-effort: never blocks the caller or the timer task.
    fn send_cancel(&self, key: InvocationKey, interrupt: bool) {
        let result = cancel_frame(key, interrupt)
            .and_then(|frame| self.writer.try_send(OutboundFrame::new(frame)));
        if let Err(e) = result {
            tracing::debug!(%key, "Could not send cancel: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, Inbound, ServerInbound};
    use crate::writer::{spawn_writer_task, WriterConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct Fixture {
        registry: Arc<InvocationRegistry>,
        peer: DuplexStream,
        binding: Arc<BindingState>,
        _timers: Arc<TimerWheel>,
    }

    fn fixture() -> Fixture {
        let (local, peer) = duplex(64 * 1024);
        let (writer, _task) =
            spawn_writer_task(local, WriterConfig::default(), CancellationToken::new());
        let timers = Arc::new(TimerWheel::start(Duration::from_millis(10), 64));
        let binding = BindingState::new(Uuid::from_u128(9));
        Fixture {
            registry: InvocationRegistry::new(timers.clone(), writer),
            peer,
            binding,
            _timers: timers,
        }
    }

    fn key(call_id: i32) -> InvocationKey {
        InvocationKey::new(Uuid::from_u128(9), call_id)
    }

    async fn read_frame(peer: &mut DuplexStream) -> Inbound {
        let mut buffer = FrameBuffer::new();
        let mut buf = vec![0u8; 1024];
        loop {
            let n = peer.read(&mut buf).await.unwrap();
            let mut frames = buffer.push(&buf[..n]).unwrap();
            if !frames.is_empty() {
                return Inbound::decode(&frames.remove(0));
            }
        }
    }

    #[tokio::test]
    async fn test_resolve_exactly_once() {
        let f = fixture();
        let rx = f
            .registry
            .register(key(1), 7, Duration::from_secs(5), f.binding.clone())
            .unwrap();

        assert!(f.registry.resolve(key(1), Ok(Bytes::from_static(&[0xc3]))));
        assert!(!f.registry.resolve(key(1), Ok(Bytes::from_static(&[0xc2]))));
        assert!(!f.registry.cancel(key(1), true));

        assert_eq!(&rx.await.unwrap().unwrap()[..], &[0xc3]);
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let f = fixture();
        let _rx = f
            .registry
            .register(key(1), 7, Duration::from_secs(5), f.binding.clone())
            .unwrap();
        assert!(f
            .registry
            .register(key(1), 7, Duration::from_secs(5), f.binding.clone())
            .is_err());
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_discarded() {
        let mut f = fixture();
        let rx = f
            .registry
            .register(key(2), 3, Duration::from_millis(30), f.binding.clone())
            .unwrap();

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(CallFailure::Timeout(d)) if d == Duration::from_millis(30)));

        // Best-effort cancel went out with interrupt set
        match read_frame(&mut f.peer).await {
            Inbound::Server(ServerInbound::Cancel { key: k, interrupt }) => {
                assert_eq!(k, key(2));
                assert!(interrupt);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(!f.registry.resolve(key(2), Ok(Bytes::new())));
    }

    #[tokio::test]
    async fn test_cancel_sends_cancel_frame() {
        let mut f = fixture();
        let rx = f
            .registry
            .register(key(3), 1, Duration::from_secs(5), f.binding.clone())
            .unwrap();

        assert!(f.registry.cancel(key(3), false));
        assert!(matches!(rx.await.unwrap(), Err(CallFailure::Cancelled)));

        let frame = read_frame(&mut f.peer).await;
        assert!(matches!(
            frame,
            Inbound::Server(ServerInbound::Cancel { interrupt: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_unregistered_is_noop() {
        let f = fixture();
        assert!(!f.registry.cancel(key(99), true));
    }

    #[tokio::test]
    async fn test_missing_service_closes_binding_once() {
        let f = fixture();
        let closes = Arc::new(AtomicUsize::new(0));
        let c = closes.clone();
        f.binding.on_close(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        for id in [1, 2] {
            let rx = f
                .registry
                .register(key(id), 1, Duration::from_secs(5), f.binding.clone())
                .unwrap();
            f.registry
                .resolve(key(id), Err(CallFailure::MissingService("gone".into())));
            assert!(matches!(rx.await.unwrap(), Err(CallFailure::MissingService(_))));
        }

        assert!(f.binding.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let f = fixture();
        let receivers: Vec<_> = (1..=3)
            .map(|id| {
                f.registry
                    .register(key(id), 1, Duration::from_secs(5), f.binding.clone())
                    .unwrap()
            })
            .collect();
        assert_eq!(f.registry.len(), 3);

        assert_eq!(f.registry.fail_all(CallFailure::ConnectionLost), 3);
        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(CallFailure::ConnectionLost)));
        }
        assert!(f.registry.is_empty());

        assert!(matches!(
            f.registry
                .register(key(4), 1, Duration::from_secs(5), f.binding.clone()),
            Err(CallwireError::ConnectionClosed)
        ));
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_unbounded_timeout_never_fires() {
        let f = fixture();
        let rx = f
            .registry
            .register(key(5), 7, Duration::MAX, f.binding.clone())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.registry.contains(&key(5)));
        assert!(f.registry.snapshot()[0].deadline > Instant::now() + Duration::from_secs(86400));

        assert!(f.registry.resolve(key(5), Ok(Bytes::from_static(&[0xc3]))));
        assert_eq!(&rx.await.unwrap().unwrap()[..], &[0xc3]);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let f = fixture();
        let _rx = f
            .registry
            .register(key(4), 12, Duration::from_secs(1), f.binding.clone())
            .unwrap();
        let snapshot = f.registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].method_id, 12);
        assert_eq!(snapshot[0].key, key(4));
        assert!(f.registry.contains(&key(4)));
    }
}
