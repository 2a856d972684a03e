//! Dispatch engine: runs inbound calls against exported services.
//!
//! For each call the dispatcher resolves the service and method, admits it
//! against the connection's handler limit, then runs it on its own task.
//! The outcome is framed as exactly one response unless the call was
//! fire-and-forget or the caller cancelled it first.
//!
//! Per-service bookkeeping lives in a `ServiceInvoker`: running executions
//! (for cancel and deferred arguments) and open stream sessions (for the
//! stream control commands).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::{CallArgs, CallContext};
use super::service::{Method, MethodKind, ServiceDefinition, StreamMethod};
use super::stream::{StreamSession, StreamSink};
use crate::failure::{FailureCode, Reply, ServiceError};
use crate::protocol::{CallRequest, Command, InvocationKey, ServerInbound, StreamHandle};
use crate::timer::TimerWheel;
use crate::writer::{OutboundFrame, WriterHandle};

type ArgOutcome = std::result::Result<Bytes, ServiceError>;

/// One running invocation.
struct Execution {
    interrupt: CancellationToken,
    cancel_requested: Arc<AtomicBool>,
    deferred: HashMap<u32, oneshot::Sender<ArgOutcome>>,
}

/// Exported service plus its in-flight state.
struct ServiceInvoker {
    definition: ServiceDefinition,
    executions: Mutex<HashMap<i32, Execution>>,
    streams: Mutex<HashMap<i32, Arc<StreamSession>>>,
}

impl ServiceInvoker {
    fn new(definition: ServiceDefinition) -> Self {
        Self {
            definition,
            executions: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn stream(&self, call_id: i32) -> Option<Arc<StreamSession>> {
        self.streams.lock().get(&call_id).cloned()
    }

    fn shutdown(&self) {
        for (_, execution) in self.executions.lock().drain() {
            execution.cancel_requested.store(true, Ordering::Release);
            execution.interrupt.cancel();
        }
        for (_, session) in self.streams.lock().drain() {
            session.cancel();
        }
    }
}

/// Serving side of one connection.
pub(crate) struct Dispatcher {
    services: RwLock<HashMap<Uuid, Arc<ServiceInvoker>>>,
    writer: WriterHandle,
    permits: Arc<Semaphore>,
    timers: Arc<TimerWheel>,
    max_frame_length: u32,
    stream_open_timeout: Duration,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(
        writer: WriterHandle,
        timers: Arc<TimerWheel>,
        max_concurrent_calls: usize,
        max_frame_length: u32,
        stream_open_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            services: RwLock::new(HashMap::new()),
            writer,
            permits: Arc::new(Semaphore::new(max_concurrent_calls)),
            timers,
            max_frame_length,
            stream_open_timeout,
            shutdown: CancellationToken::new(),
        })
    }

    /// Export a service. Returns `true` if it replaced one with the same id.
    pub(crate) fn export(&self, definition: ServiceDefinition) -> bool {
        let id = definition.id();
        tracing::debug!(service_id = %id, methods = definition.method_count(), "Exporting service");
        let previous = self
            .services
            .write()
            .insert(id, Arc::new(ServiceInvoker::new(definition)));
        match previous {
            Some(old) => {
                old.shutdown();
                true
            }
            None => false,
        }
    }

    /// Withdraw a service, interrupting its running calls.
    pub(crate) fn unexport(&self, service_id: Uuid) -> bool {
        match self.services.write().remove(&service_id) {
            Some(invoker) => {
                invoker.shutdown();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_exported(&self, service_id: Uuid) -> bool {
        self.services.read().contains_key(&service_id)
    }

    /// Number of calls currently holding a handler permit.
    pub(crate) fn running(&self, max_concurrent_calls: usize) -> usize {
        max_concurrent_calls.saturating_sub(self.permits.available_permits())
    }

    /// Interrupt everything and stop accepting work.
    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
        self.permits.close();
        for invoker in self.services.read().values() {
            invoker.shutdown();
        }
    }

    fn invoker(&self, service_id: Uuid) -> Option<Arc<ServiceInvoker>> {
        self.services.read().get(&service_id).cloned()
    }

    /// Handle one request-direction message.
    pub(crate) async fn handle(self: &Arc<Self>, message: ServerInbound) {
        match message {
            ServerInbound::Call {
                key,
                expects_response,
                request,
            } => self.handle_call(key, expects_response, request).await,
            ServerInbound::Cancel { key, interrupt } => self.handle_cancel(key, interrupt),
            ServerInbound::AsyncArg {
                key,
                index,
                outcome,
            } => self.handle_async_arg(key, index, outcome),
            ServerInbound::StreamOpen { key } => {
                if let Some(session) = self.stream_session(key) {
                    if !session.open() {
                        tracing::debug!(%key, "Ignoring open for stream that is not awaiting open");
                    }
                }
            }
            ServerInbound::StreamBackPressure { key, credit } => {
                if let Some(session) = self.stream_session(key) {
                    session.grant(credit);
                }
            }
            ServerInbound::StreamClose { key } => {
                if let Some(session) = self.stream_session(key) {
                    tracing::debug!(%key, "Consumer closed stream");
                    session.cancel();
                }
            }
        }
    }

    /// Respond to a request whose payload could not be decoded.
    pub(crate) async fn reject_malformed(&self, key: InvocationKey, command: Command, reason: String) {
        if command.expects_response() {
            self.reply(key, Reply::protocol(FailureCode::ToDeserialize, reason))
                .await;
        } else {
            tracing::warn!(%key, %command, "Dropping malformed request: {}", reason);
        }
    }

    /// Respond to a request-range command byte this build does not know.
    pub(crate) async fn reject_unrecognized(&self, key: InvocationKey, code: u8) {
        tracing::warn!(%key, code, "Unrecognized request command");
        self.reply(
            key,
            Reply::protocol(
                FailureCode::Unknown,
                format!("Unrecognized command 0x{:02X}", code),
            ),
        )
        .await;
    }

    async fn handle_call(self: &Arc<Self>, key: InvocationKey, expects_response: bool, request: CallRequest) {
        let method_id = request.method_id;

        let Some(invoker) = self.invoker(key.service_id) else {
            self.refuse(
                key,
                expects_response,
                FailureCode::NoService,
                format!("No service {}", key.service_id),
            )
            .await;
            return;
        };

        let Some(method) = invoker.definition.lookup(method_id).cloned() else {
            self.refuse(
                key,
                expects_response,
                FailureCode::NoMethod,
                format!("No method {} on service {}", method_id, key.service_id),
            )
            .await;
            return;
        };

        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            tracing::warn!(%key, method_id, "Handler capacity reached");
            self.refuse(
                key,
                expects_response,
                FailureCode::Unknown,
                "handler capacity reached".to_string(),
            )
            .await;
            return;
        };

        let (args, deferred) = CallArgs::from_slots(request.args);
        let interrupt = self.shutdown.child_token();
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let registered = {
            let mut executions = invoker.executions.lock();
            if executions.contains_key(&key.call_id) {
                false
            } else {
                executions.insert(
                    key.call_id,
                    Execution {
                        interrupt: interrupt.clone(),
                        cancel_requested: cancel_requested.clone(),
                        deferred: deferred.into_iter().collect(),
                    },
                );
                true
            }
        };
        if !registered {
            tracing::warn!(%key, "Duplicate invocation key");
            self.refuse(
                key,
                expects_response,
                FailureCode::Unknown,
                format!("Invocation {} is already running", key),
            )
            .await;
            return;
        }

        tracing::trace!(%key, method_id, expects_response, "Dispatching call");
        let ctx = CallContext::new(key, method_id, interrupt.clone(), cancel_requested.clone());
        let call = RunningCall {
            dispatcher: self.clone(),
            invoker,
            key,
            expects_response,
            interrupt,
            cancel_requested,
            _permit: permit,
        };

        match method {
            MethodKind::Unary(method) => {
                tokio::spawn(call.run_unary(method, args, ctx));
            }
            MethodKind::Stream(method) => {
                tokio::spawn(call.run_stream(method, args, ctx));
            }
        }
    }

    fn handle_cancel(&self, key: InvocationKey, interrupt: bool) {
        let Some(invoker) = self.invoker(key.service_id) else {
            tracing::debug!(%key, "Cancel for unknown service");
            return;
        };

        if let Some(execution) = invoker.executions.lock().get(&key.call_id) {
            tracing::debug!(%key, interrupt, "Cancel requested");
            execution.cancel_requested.store(true, Ordering::Release);
            if interrupt {
                execution.interrupt.cancel();
            }
            return;
        }

        if let Some(session) = invoker.stream(key.call_id) {
            session.cancel();
            return;
        }

        tracing::debug!(%key, "Cancel for unknown or finished invocation");
    }

    fn handle_async_arg(&self, key: InvocationKey, index: u32, outcome: ArgOutcome) {
        let sender = self.invoker(key.service_id).and_then(|invoker| {
            invoker
                .executions
                .lock()
                .get_mut(&key.call_id)
                .and_then(|execution| execution.deferred.remove(&index))
        });

        match sender {
            Some(tx) => {
                // Receiver gone means the method never asked for it
                let _ = tx.send(outcome);
            }
            None => tracing::debug!(%key, index, "Async argument for unknown slot"),
        }
    }

    fn stream_session(&self, key: InvocationKey) -> Option<Arc<StreamSession>> {
        let session = self
            .invoker(key.service_id)
            .and_then(|invoker| invoker.stream(key.call_id));
        if session.is_none() {
            tracing::debug!(%key, "Stream control for unknown stream");
        }
        session
    }

    async fn refuse(&self, key: InvocationKey, expects_response: bool, code: FailureCode, diagnostic: String) {
        if expects_response {
            self.reply(key, Reply::protocol(code, diagnostic)).await;
        } else {
            tracing::warn!(%key, ?code, "Dropping fire-and-forget call: {}", diagnostic);
        }
    }

    async fn reply(&self, key: InvocationKey, reply: Reply) {
        let frame = match reply.into_frame(key, self.max_frame_length) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(%key, "Failed to encode reply: {}", e);
                return;
            }
        };
        if let Err(e) = self.writer.send(OutboundFrame::new(frame)).await {
            tracing::debug!(%key, "Reply not delivered: {}", e);
        }
    }
}

/// A call admitted for execution. Holds its handler permit until dropped.
struct RunningCall {
    dispatcher: Arc<Dispatcher>,
    invoker: Arc<ServiceInvoker>,
    key: InvocationKey,
    expects_response: bool,
    interrupt: CancellationToken,
    cancel_requested: Arc<AtomicBool>,
    _permit: OwnedSemaphorePermit,
}

impl RunningCall {
    fn finish_execution(&self) -> bool {
        self.invoker.executions.lock().remove(&self.key.call_id);
        let cancelled = self.cancel_requested.load(Ordering::Acquire);
        if cancelled {
            tracing::debug!(key = %self.key, "Suppressing result of cancelled call");
        }
        !cancelled
    }

    async fn run_unary(self, method: Arc<dyn Method>, args: CallArgs, ctx: CallContext) {
        let reply = tokio::select! {
            reply = method.call(args, ctx) => Some(reply),
            _ = self.interrupt.cancelled() => None,
        };
        if !self.finish_execution() {
            return;
        }
        let Some(reply) = reply else {
            return;
        };

        if self.expects_response {
            self.dispatcher.reply(self.key, reply).await;
        } else if !matches!(reply, Reply::Success(_)) {
            tracing::debug!(key = %self.key, command = %reply.command(), "Fire-and-forget call failed");
        }
    }

    async fn run_stream(self, method: Arc<dyn StreamMethod>, args: CallArgs, ctx: CallContext) {
        let started = tokio::select! {
            started = method.start(args, ctx) => Some(started),
            _ = self.interrupt.cancelled() => None,
        };
        if !self.finish_execution() {
            return;
        }
        let producer = match started {
            None => return,
            Some(Err(reply)) => {
                if self.expects_response {
                    self.dispatcher.reply(self.key, reply).await;
                }
                return;
            }
            Some(Ok(producer)) => producer,
        };
        if !self.expects_response {
            tracing::warn!(key = %self.key, "Streaming method called without return, nothing to stream to");
            return;
        }

        let dispatcher = &self.dispatcher;
        let session = StreamSession::new(
            self.key,
            dispatcher.writer.clone(),
            dispatcher.max_frame_length,
            &self.interrupt,
        );
        self.invoker
            .streams
            .lock()
            .insert(self.key.call_id, session.clone());

        dispatcher
            .reply(self.key, Reply::success(&StreamHandle::from(self.key)))
            .await;

        // Armed after the handle is queued so the timeout error cannot overtake it
        let weak = Arc::downgrade(&session);
        session.set_open_timer(dispatcher.timers.schedule(dispatcher.stream_open_timeout, move || {
            if let Some(session) = weak.upgrade() {
                session.open_timed_out();
            }
        }));

        // A consumer close only closes the sink; the producer still runs to
        // completion. An interrupt drops it.
        let termination = tokio::select! {
            biased;
            termination = producer(StreamSink::new(session.clone())) => Some(termination),
            _ = self.interrupt.cancelled() => None,
        };
        if let Some(termination) = termination {
            session.finish(termination).await;
        }
        self.invoker.streams.lock().remove(&session.key().call_id);
        tracing::trace!(key = %self.key, "Stream finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use crate::protocol::{ArgSlot, ClientInbound, FrameBuffer, Inbound};
    use crate::writer::{spawn_writer_task, WriterConfig};
    use crate::CallFailure;
    use serde_bytes::ByteBuf;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    const SERVICE: Uuid = Uuid::from_u128(0x5E);

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        peer: DuplexStream,
        buffer: FrameBuffer,
        _timers: Arc<TimerWheel>,
    }

    fn fixture(max_concurrent_calls: usize) -> Fixture {
        let (local, peer) = duplex(64 * 1024);
        let (writer, _task) =
            spawn_writer_task(local, WriterConfig::default(), CancellationToken::new());
        let timers = Arc::new(TimerWheel::start(Duration::from_millis(10), 64));
        let dispatcher = Dispatcher::new(
            writer,
            timers.clone(),
            max_concurrent_calls,
            1024 * 1024,
            Duration::from_millis(100),
        );
        dispatcher.export(
            ServiceDefinition::new(SERVICE)
                .method(1, |(a, b): (i32, i32), _ctx| async move {
                    Ok::<_, ServiceError>(a + b)
                })
                .method(2, |(): (), ctx: CallContext| async move {
                    ctx.interrupted().await;
                    Ok::<_, ServiceError>(0u8)
                }),
        );
        Fixture {
            dispatcher,
            peer,
            buffer: FrameBuffer::new(),
            _timers: timers,
        }
    }

    impl Fixture {
        async fn next(&mut self) -> Inbound {
            let mut buf = vec![0u8; 4096];
            loop {
                let n = self.peer.read(&mut buf).await.unwrap();
                let mut frames = self.buffer.push(&buf[..n]).unwrap();
                if !frames.is_empty() {
                    return Inbound::decode(&frames.remove(0));
                }
            }
        }
    }

    fn call(call_id: i32, method_id: u32, args: Vec<ArgSlot>) -> ServerInbound {
        ServerInbound::Call {
            key: InvocationKey::new(SERVICE, call_id),
            expects_response: true,
            request: CallRequest { method_id, args },
        }
    }

    fn value<T: serde::Serialize>(v: &T) -> ArgSlot {
        ArgSlot::Value(ByteBuf::from(MsgPackCodec::encode(v).unwrap()))
    }

    #[tokio::test]
    async fn test_call_success() {
        let mut f = fixture(8);
        f.dispatcher
            .handle(call(1, 1, vec![value(&2), value(&3)]))
            .await;
        match f.next().await {
            Inbound::Client(ClientInbound::Success { key, payload }) => {
                assert_eq!(key.call_id, 1);
                assert_eq!(MsgPackCodec::decode::<i32>(&payload).unwrap(), 5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_service_and_method() {
        let mut f = fixture(8);
        f.dispatcher
            .handle(ServerInbound::Call {
                key: InvocationKey::new(Uuid::from_u128(0xBAD), 1),
                expects_response: true,
                request: CallRequest {
                    method_id: 1,
                    args: vec![],
                },
            })
            .await;
        assert!(matches!(
            f.next().await,
            Inbound::Client(ClientInbound::Failure {
                failure: CallFailure::MissingService(_),
                ..
            })
        ));

        f.dispatcher.handle(call(2, 99, vec![])).await;
        assert!(matches!(
            f.next().await,
            Inbound::Client(ClientInbound::Failure {
                failure: CallFailure::MissingMethod(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_deferred_argument_delivered_by_index() {
        let mut f = fixture(8);
        f.dispatcher
            .handle(call(3, 1, vec![value(&10), ArgSlot::Deferred]))
            .await;
        f.dispatcher
            .handle(ServerInbound::AsyncArg {
                key: InvocationKey::new(SERVICE, 3),
                index: 1,
                outcome: Ok(Bytes::from(MsgPackCodec::encode(&5).unwrap())),
            })
            .await;
        match f.next().await {
            Inbound::Client(ClientInbound::Success { payload, .. }) => {
                assert_eq!(MsgPackCodec::decode::<i32>(&payload).unwrap(), 15);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_async_argument_fails_call() {
        let mut f = fixture(8);
        f.dispatcher
            .handle(call(4, 1, vec![value(&10), ArgSlot::Deferred]))
            .await;
        f.dispatcher
            .handle(ServerInbound::AsyncArg {
                key: InvocationKey::new(SERVICE, 4),
                index: 1,
                outcome: Err(ServiceError::new("io", "lost")),
            })
            .await;
        match f.next().await {
            Inbound::Client(ClientInbound::Failure { failure, .. }) => {
                let err: ServiceError = failure.remote().unwrap();
                assert_eq!(err.kind, "io");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_capacity_reached() {
        let mut f = fixture(1);
        f.dispatcher.handle(call(5, 2, vec![])).await;
        f.dispatcher.handle(call(6, 1, vec![value(&1), value(&1)])).await;
        match f.next().await {
            Inbound::Client(ClientInbound::Failure { key, failure }) => {
                assert_eq!(key.call_id, 6);
                assert!(matches!(failure, CallFailure::PeerUnknown(ref d) if d.contains("capacity")));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.dispatcher.running(1), 1);
    }

    #[tokio::test]
    async fn test_interrupt_suppresses_reply() {
        let mut f = fixture(8);
        f.dispatcher.handle(call(7, 2, vec![])).await;
        f.dispatcher
            .handle(ServerInbound::Cancel {
                key: InvocationKey::new(SERVICE, 7),
                interrupt: true,
            })
            .await;

        // The next frame on the wire belongs to call 8, not the cancelled 7
        f.dispatcher.handle(call(8, 1, vec![value(&1), value(&2)])).await;
        match f.next().await {
            Inbound::Client(ClientInbound::Success { key, .. }) => assert_eq!(key.call_id, 8),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let mut f = fixture(8);
        let key = InvocationKey::new(SERVICE, 9);
        f.dispatcher
            .reject_malformed(key, Command::CallWithReturn, "bad envelope".into())
            .await;
        assert!(matches!(
            f.next().await,
            Inbound::Client(ClientInbound::Failure {
                failure: CallFailure::PeerDeserialize(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_unexport() {
        let f = fixture(8);
        assert!(f.dispatcher.is_exported(SERVICE));
        assert!(f.dispatcher.unexport(SERVICE));
        assert!(!f.dispatcher.is_exported(SERVICE));
        assert!(!f.dispatcher.unexport(SERVICE));
    }
}
