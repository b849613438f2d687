//! Client transport connection.
//!
//! A [`Connection`] owns the byte stream (a TCP socket or an in-process
//! pipe) and runs one loop until cancelled or disconnected:
//!
//! 1. poll the stream for available bytes and feed them to the parser,
//! 2. dispatch each complete message to the router's async phase,
//! 3. flush queued outbound messages,
//! 4. keepalive bookkeeping,
//! 5. sleep briefly.
//!
//! Individual read and write errors are logged and the loop carries on.
//! The loop ends on keepalive timeout, an explicit disconnect request, the
//! shared keep-running flag being cleared, the peer closing the stream, or
//! an undecodable inbound stream. Lifecycle changes are broadcast through a
//! [`ConnectionStateWatch`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender};
use meridian_config::NetworkConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::chunk::{BufferPool, PoolReleaser};
use crate::keepalive::{KeepaliveAction, KeepaliveConfig, KeepaliveSnapshot, KeepaliveTracker};
use crate::messages::{Message, ServerMessage};
use crate::parser::{self, MessageParser, ParserConfig};
use crate::routing::{AsyncContext, ProtocolRouter};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Configuration for the transport loop.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Ping cadence and dead-link timeout.
    pub keepalive: KeepaliveConfig,
    /// Reads slower than this log a warning. Default: 1 s.
    pub slow_read_warning: Duration,
    /// Sleep at the end of each iteration, also the read poll timeout.
    /// Default: 1 ms.
    pub loop_sleep: Duration,
    /// Socket read buffer size. Default: 64 KiB.
    pub read_buffer_size: usize,
    /// Parser limits.
    pub parser: ParserConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive: KeepaliveConfig::default(),
            slow_read_warning: Duration::from_secs(1),
            loop_sleep: Duration::from_millis(1),
            read_buffer_size: 64 * 1024,
            parser: ParserConfig::default(),
        }
    }
}

impl From<&NetworkConfig> for ConnectionConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            keepalive: KeepaliveConfig {
                ping_interval: Duration::from_millis(config.ping_interval_ms),
                disconnect_timeout: Duration::from_millis(config.disconnect_timeout_ms),
                ..KeepaliveConfig::default()
            },
            slow_read_warning: Duration::from_millis(config.slow_read_warning_ms),
            loop_sleep: Duration::from_millis(config.loop_sleep_ms),
            read_buffer_size: config.read_buffer_size.max(1),
            parser: ParserConfig {
                max_field_len: config.max_field_len,
                ..ParserConfig::default()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local code or the server asked for a clean close.
    Requested,
    /// Nothing was received within the disconnect timeout.
    KeepaliveTimeout,
    /// The peer closed the stream.
    PeerClosed,
    /// The shared keep-running flag was cleared.
    Shutdown,
    /// A protocol invariant was violated; the session cannot continue.
    Fatal(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("disconnect requested"),
            Self::KeepaliveTimeout => f.write_str("keepalive timeout"),
            Self::PeerClosed => f.write_str("peer closed the connection"),
            Self::Shutdown => f.write_str("client shutting down"),
            Self::Fatal(reason) => write!(f, "fatal: {reason}"),
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Establishing the stream.
    Connecting,
    /// Loop running.
    Connected,
    /// Loop exited.
    Disconnected(DisconnectReason),
}

/// Observable connection state backed by a [`watch`] channel.
///
/// Multiple subscribers can observe state transitions without polling.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a watch initialized to [`ConnectionState::Connecting`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Connecting);
        Self { tx }
    }

    /// Set the current state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }
}

/// Lifetime traffic counters, updated by the transport loop.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    messages_read: AtomicU64,
    messages_written: AtomicU64,
    slow_reads: AtomicU64,
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub messages_read: u64,
    pub messages_written: u64,
    pub slow_reads: u64,
}

impl ConnectionStats {
    /// Copy the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            messages_read: self.messages_read.load(Ordering::Relaxed),
            messages_written: self.messages_written.load(Ordering::Relaxed),
            slow_reads: self.slow_reads.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

struct Shared {
    state: ConnectionStateWatch,
    stats: ConnectionStats,
    outbox_tx: Sender<Message>,
    outbox_rx: Receiver<Message>,
    should_disconnect: AtomicBool,
    fatal: Mutex<Option<String>>,
    keepalive: Mutex<KeepaliveSnapshot>,
    releaser: PoolReleaser,
}

/// Cloneable handle to a running (or finished) connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    fn new(releaser: PoolReleaser) -> Self {
        let (outbox_tx, outbox_rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                state: ConnectionStateWatch::new(),
                stats: ConnectionStats::default(),
                outbox_tx,
                outbox_rx,
                should_disconnect: AtomicBool::new(false),
                fatal: Mutex::new(None),
                keepalive: Mutex::new(KeepaliveSnapshot::default()),
                releaser,
            }),
        }
    }

    /// A handle not attached to any stream. Outbound messages accumulate
    /// until drained.
    pub fn detached() -> Self {
        Self::new(BufferPool::new(0).releaser())
    }

    /// Queue a message for the next outbound flush.
    pub fn send(&self, msg: Message) {
        // Both ends live in `Shared`, so the channel cannot be disconnected.
        let _ = self.shared.outbox_tx.send(msg);
    }

    /// Take everything queued for sending.
    pub fn drain_outbound(&self) -> Vec<Message> {
        self.shared.outbox_rx.try_iter().collect()
    }

    /// Ask the loop to close cleanly at its next iteration.
    pub fn request_disconnect(&self) {
        self.shared.should_disconnect.store(true, Ordering::Release);
    }

    /// Whether a disconnect (clean or fatal) has been requested.
    pub fn disconnect_requested(&self) -> bool {
        self.shared.should_disconnect.load(Ordering::Acquire)
    }

    /// End the session because of a protocol invariant violation. The first
    /// reported reason wins.
    pub fn report_fatal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(%reason, "Fatal session error");
        let mut fatal = self
            .shared
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        fatal.get_or_insert(reason);
        self.request_disconnect();
    }

    /// Observable lifecycle state.
    pub fn state(&self) -> &ConnectionStateWatch {
        &self.shared.state
    }

    /// Whether the loop has exited.
    pub fn is_disconnected(&self) -> bool {
        matches!(self.state().current(), ConnectionState::Disconnected(_))
    }

    /// Traffic counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Latest keepalive figures published by the loop.
    pub fn keepalive(&self) -> KeepaliveSnapshot {
        self.shared
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Handle for returning chunk buffers to the parser's pool.
    pub fn releaser(&self) -> &PoolReleaser {
        &self.shared.releaser
    }

    fn exit_reason(&self) -> DisconnectReason {
        let fatal = self
            .shared
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match fatal {
            Some(reason) => DisconnectReason::Fatal(reason),
            None => DisconnectReason::Requested,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// The transport loop over any async byte stream.
pub struct Connection<T, S> {
    stream: T,
    parser: MessageParser,
    router: Arc<ProtocolRouter<S>>,
    handle: ConnectionHandle,
    keep_running: Arc<AtomicBool>,
    config: ConnectionConfig,
    read_buf: Vec<u8>,
    write_buf: BytesMut,
}

impl<T, S> Connection<T, S>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: 'static,
{
    /// Wrap an established stream with a parser using the built-in
    /// decoders.
    pub fn new(
        stream: T,
        router: Arc<ProtocolRouter<S>>,
        config: ConnectionConfig,
        keep_running: Arc<AtomicBool>,
    ) -> Self {
        let parser = MessageParser::new(config.parser.clone());
        Self::with_parser(stream, parser, router, config, keep_running)
    }

    /// Wrap an established stream with a caller-configured parser.
    pub fn with_parser(
        stream: T,
        parser: MessageParser,
        router: Arc<ProtocolRouter<S>>,
        config: ConnectionConfig,
        keep_running: Arc<AtomicBool>,
    ) -> Self {
        let handle = ConnectionHandle::new(parser.releaser());
        Self {
            stream,
            parser,
            router,
            handle,
            keep_running,
            read_buf: vec![0; config.read_buffer_size.max(1)],
            write_buf: BytesMut::with_capacity(4 * 1024),
            config,
        }
    }

    /// Handle for sending, disconnecting, and observing this connection.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Run the loop on a new tokio task.
    pub fn spawn(self) -> JoinHandle<DisconnectReason> {
        tokio::spawn(self.run())
    }

    /// Run the loop to completion and return why it stopped.
    pub async fn run(mut self) -> DisconnectReason {
        self.handle.state().set(ConnectionState::Connected);
        let mut keepalive = KeepaliveTracker::new(self.config.keepalive.clone(), Instant::now());

        let reason = loop {
            if !self.keep_running.load(Ordering::Acquire) {
                break DisconnectReason::Shutdown;
            }
            if self.handle.disconnect_requested() {
                break self.handle.exit_reason();
            }

            if let Err(reason) = self.poll_inbound(&mut keepalive).await {
                break reason;
            }

            self.flush_outbound().await;

            match keepalive.poll(Instant::now()) {
                KeepaliveAction::Idle => {}
                KeepaliveAction::SendPing => self.handle.send(ServerMessage::Ping.into()),
                KeepaliveAction::TimedOut => {
                    tracing::warn!(
                        silence = ?keepalive.silence(Instant::now()),
                        "No traffic from server within keepalive timeout"
                    );
                    break DisconnectReason::KeepaliveTimeout;
                }
            }
            self.publish_keepalive(&keepalive);

            tokio::time::sleep(self.config.loop_sleep).await;
        };

        // Pings queued on the final iteration and anything the caller sent.
        self.flush_outbound().await;
        if let Err(err) = self.stream.shutdown().await {
            tracing::debug!(error = %err, "Stream shutdown failed");
        }
        self.publish_keepalive(&keepalive);

        let stats = self.handle.stats();
        tracing::info!(
            %reason,
            bytes_read = stats.bytes_read,
            bytes_written = stats.bytes_written,
            messages_read = stats.messages_read,
            "Connection closed"
        );
        self.handle
            .state()
            .set(ConnectionState::Disconnected(reason.clone()));
        reason
    }

    /// Read whatever is available, parse, and dispatch. An `Err` ends the
    /// loop.
    async fn poll_inbound(
        &mut self,
        keepalive: &mut KeepaliveTracker,
    ) -> Result<(), DisconnectReason> {
        let started = Instant::now();
        let read = tokio::time::timeout(self.config.loop_sleep, self.stream.read(&mut self.read_buf))
            .await;

        let n = match read {
            Err(_elapsed) => return Ok(()),
            Ok(Ok(0)) => return Err(DisconnectReason::PeerClosed),
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Socket read failed");
                return Ok(());
            }
        };

        let stats = &self.handle.shared.stats;
        let total = stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
        self.parser.feed(&self.read_buf[..n]);

        let ctx = AsyncContext::new(&self.handle);
        loop {
            match self.parser.next_message() {
                Ok(Some(msg)) => {
                    stats.messages_read.fetch_add(1, Ordering::Relaxed);
                    let now = Instant::now();
                    if matches!(msg, Message::Server(ServerMessage::Pong)) {
                        keepalive.on_pong(now);
                    } else {
                        keepalive.on_inbound(now);
                    }
                    self.router.dispatch_async(msg, &ctx);
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(error = %err, buffered = self.parser.buffered(), "Undecodable inbound stream");
                    return Err(DisconnectReason::Fatal(err.to_string()));
                }
            }
        }

        let elapsed = started.elapsed();
        if elapsed > self.config.slow_read_warning {
            stats.slow_reads.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                elapsed = ?elapsed,
                total_mib = total as f64 / BYTES_PER_MIB,
                "Slow socket read"
            );
        }
        Ok(())
    }

    /// Encode and write everything in the outbox. Write failures are logged.
    async fn flush_outbound(&mut self) {
        let pending = self.handle.drain_outbound();
        if pending.is_empty() {
            return;
        }
        let count = pending.len() as u64;
        self.write_buf.clear();
        for msg in &pending {
            parser::encode(msg, &mut self.write_buf);
        }

        let result = async {
            self.stream.write_all(&self.write_buf).await?;
            self.stream.flush().await
        }
        .await;

        let stats = &self.handle.shared.stats;
        match result {
            Ok(()) => {
                stats
                    .bytes_written
                    .fetch_add(self.write_buf.len() as u64, Ordering::Relaxed);
                stats.messages_written.fetch_add(count, Ordering::Relaxed);
            }
            Err(err) => tracing::warn!(error = %err, dropped = count, "Socket write failed"),
        }
    }

    fn publish_keepalive(&self, keepalive: &KeepaliveTracker) {
        *self
            .handle
            .shared
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = keepalive.snapshot(Instant::now());
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
