//! Connection builder and runtime loop.
//!
//! A [`Connection`] owns one byte stream and runs both roles over it: it
//! serves the services exported on it and issues calls through
//! [`ServiceBinding`]s. The lifecycle:
//! 1. Split the stream into read and write halves
//! 2. Spawn the writer task and the timer wheel
//! 3. Read frames and route them by command role
//! 4. On end-of-stream, a framing error, a write failure or
//!    [`Connection::close`]: fail pending calls, interrupt running ones,
//!    close every binding
//!
//! # Example
//!
//! ```ignore
//! use callwire::{ConnectionBuilder, ServiceDefinition, ServiceError};
//!
//! let server = ConnectionBuilder::new()
//!     .service(ServiceDefinition::new(CALC).method(1, |(a, b): (i64, i64), _ctx| async move {
//!         Ok::<_, ServiceError>(a + b)
//!     }))
//!     .start(server_io)?;
//!
//! let client = ConnectionBuilder::new().start(client_io)?;
//! let sum: i64 = client
//!     .bind(CALC)
//!     .call(1, vec![Argument::value(&2)?, Argument::value(&3)?])
//!     .await?
//!     .result()
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{ClientCore, PendingSummary, ServiceBinding};
use crate::config::ConnectionConfig;
use crate::error::{CallwireError, Result};
use crate::failure::CallFailure;
use crate::protocol::{effective_max_length, Frame, FrameBuffer, Inbound, Role};
use crate::server::{Dispatcher, ServiceDefinition};
use crate::timer::TimerWheel;
use crate::writer::spawn_writer_task;

/// Builder for configuring and starting a [`Connection`].
#[derive(Debug, Default)]
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    services: Vec<ServiceDefinition>,
}

impl ConnectionBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the largest accepted frame length.
    ///
    /// Default: 16 MiB
    pub fn max_frame_length(mut self, max: u32) -> Self {
        self.config.max_frame_length = max;
        self
    }

    /// Set the timeout for calls that do not specify one.
    ///
    /// Default: 60 seconds
    pub fn default_call_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set how long a streaming call may wait for the consumer to open it.
    ///
    /// Default: 30 seconds
    pub fn stream_open_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream_open_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the maximum number of concurrently executing inbound calls.
    ///
    /// Calls beyond the limit are refused with `FAILURE_UNKNOWN`.
    /// Default: 256
    pub fn max_concurrent_calls(mut self, limit: usize) -> Self {
        self.config.max_concurrent_calls = limit;
        self
    }

    /// Export a service from the start.
    pub fn service(mut self, definition: ServiceDefinition) -> Self {
        self.services.push(definition);
        self
    }

    /// Start the connection over `io`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S>(self, io: S) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Connection::start(self.config, self.services, io)
    }
}

struct ConnectionInner {
    config: ConnectionConfig,
    client: Arc<ClientCore>,
    dispatcher: Arc<Dispatcher>,
    timers: Arc<TimerWheel>,
    /// Cancelled to begin shutdown; also cancelled by a writer failure.
    closing: CancellationToken,
    /// Cancelled once teardown has completed.
    closed: CancellationToken,
}

/// A running connection. Cheaply cloneable.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a connection builder.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    fn start<S>(config: ConnectionConfig, services: Vec<ServiceDefinition>, io: S) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;
        let max_frame_length = effective_max_length(config.max_frame_length);

        let (reader, write_half) = tokio::io::split(io);
        let closing = CancellationToken::new();
        let (writer, _writer_task) =
            spawn_writer_task(write_half, config.writer_config(), closing.clone());
        let timers = Arc::new(TimerWheel::start(config.timer_tick(), config.timer_wheel_size));

        let client = ClientCore::new(
            writer.clone(),
            timers.clone(),
            config.default_call_timeout(),
            max_frame_length,
        );
        let dispatcher = Dispatcher::new(
            writer,
            timers.clone(),
            config.max_concurrent_calls,
            max_frame_length,
            config.stream_open_timeout(),
        );
        for service in services {
            dispatcher.export(service);
        }

        let inner = Arc::new(ConnectionInner {
            config,
            client,
            dispatcher,
            timers,
            closing,
            closed: CancellationToken::new(),
        });

        let reading = inner.clone();
        tokio::spawn(async move {
            match Self::read_loop(reader, &reading).await {
                Ok(()) => tracing::debug!("Connection closed"),
                Err(e) => tracing::error!("Read loop error: {}", e),
            }
            Self::teardown(&reading);
        });

        Ok(Self { inner })
    }

    /// Main read loop - reads frames and routes them by role.
    async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, inner: &ConnectionInner) -> Result<()> {
        let mut frame_buffer = FrameBuffer::with_capacity_and_max_length(
            inner.config.read_buffer_size,
            inner.config.max_frame_length,
        );
        let mut buf = vec![0u8; inner.config.read_buffer_size];

        loop {
            let n = tokio::select! {
                _ = inner.closing.cancelled() => return Ok(()),
                read = reader.read(&mut buf) => match read {
                    Ok(0) => return Ok(()),
                    Ok(n) => n,
                    Err(e) => return Err(CallwireError::Io(e)),
                },
            };

            for frame in frame_buffer.push(&buf[..n])? {
                Self::route(inner, &frame).await;
            }
        }
    }

    /// Route one frame to the dispatcher or the client side.
    async fn route(inner: &ConnectionInner, frame: &Frame) {
        match Inbound::decode(frame) {
            Inbound::Server(message) => inner.dispatcher.handle(message).await,
            Inbound::Client(message) => inner.client.handle(message),
            Inbound::Malformed {
                key,
                command,
                reason,
            } => match command.role() {
                Role::Server => inner.dispatcher.reject_malformed(key, command, reason).await,
                Role::Client => {
                    tracing::warn!(%key, %command, "Malformed response: {}", reason);
                    inner
                        .client
                        .registry
                        .resolve(key, Err(CallFailure::Decode(reason)));
                }
            },
            Inbound::Unrecognized { key, code } => {
                if code < 0x40 {
                    inner.dispatcher.reject_unrecognized(key, code).await;
                } else {
                    inner.client.handle_unrecognized(key, code);
                }
            }
        }
    }

    fn teardown(inner: &ConnectionInner) {
        inner.closing.cancel();
        inner.dispatcher.shutdown();
        inner.client.teardown();
        inner.timers.stop();
        inner.closed.cancel();
    }

    /// Bind to a service exported by the peer.
    pub fn bind(&self, service_id: Uuid) -> ServiceBinding {
        self.inner.client.bind(service_id)
    }

    /// Export a service. Returns `true` if it replaced one with the same id.
    pub fn export(&self, definition: ServiceDefinition) -> bool {
        self.inner.dispatcher.export(definition)
    }

    /// Withdraw an exported service.
    pub fn unexport(&self, service_id: Uuid) -> bool {
        self.inner.dispatcher.unexport(service_id)
    }

    /// Whether `service_id` is exported on this connection.
    pub fn is_exported(&self, service_id: Uuid) -> bool {
        self.inner.dispatcher.is_exported(service_id)
    }

    /// Begin shutdown. Queued frames are flushed before the stream closes.
    pub fn close(&self) {
        self.inner.closing.cancel();
    }

    /// Wait until the connection has fully shut down.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Whether shutdown has completed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Calls awaiting a response.
    pub fn pending_calls(&self) -> Vec<PendingSummary> {
        self.inner.client.registry.snapshot()
    }

    /// Number of calls awaiting a response.
    pub fn pending_call_count(&self) -> usize {
        self.inner.client.registry.len()
    }

    /// Number of open client-side streams.
    pub fn open_streams(&self) -> usize {
        self.inner.client.streams.len()
    }

    /// Inbound calls currently executing.
    pub fn running_calls(&self) -> usize {
        self.inner
            .dispatcher
            .running(self.inner.config.max_concurrent_calls)
    }

    /// Active configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }
}
