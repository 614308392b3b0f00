//! # Upstream Link
//!
//! Owns the relay's single connection to the upstream processing server.
//!
//! ```text
//!               connect()                 transport open
//! Disconnected ───────────▶ Connecting ──────────────────▶ Connected
//!      ▲                        │                              │
//!      │   connect failure      │        remote close / error  │
//!      └────────────────────────┴──────────────────────────────┘
//!                 (one retry scheduled after `reconnect_delay`)
//! ```
//!
//! ## Behaviour
//!
//! - `connect` only leaves `Disconnected`. While an attempt is in flight or a
//!   retry timer is pending, further calls are ignored, so retries can never
//!   pile up.
//! - Every failed attempt, and every loss of an established link, schedules
//!   exactly one further attempt after a constant delay. There is no
//!   exponential growth and no attempt limit.
//! - Retries are tokio timers raced against a `CancellationToken`; `close` and
//!   `shutdown` cancel them.
//! - Each connect attempt carries a generation number. Events from an attempt
//!   that has since been superseded (by `close` or a newer attempt) are
//!   dropped, which keeps the state transitions above exact.
//! - Payloads waiting for the writer are charged against a byte budget.
//!   When a stalled upstream has let the budget fill, `send` refuses instead
//!   of queueing more.
//! - The `connected` flag is an `AtomicBool` read on every forward, written
//!   only while holding the state lock.
//!
//! The transport itself sits behind [`UpstreamConnector`], which hands back a
//! pair of channels. The production connector lives in
//! `transports::ws_upstream`; tests script their own.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::{RelayError, RelayResult};
use crate::core::memory_guard::{ByteBudget, BytePermit};
use crate::core::message::{UpstreamMessage, HEARTBEAT_PING};

/// Outcome of one upstream write, delivered after the fact.
pub type AckResult = RelayResult<()>;

/// A command for the transport's writer.
#[derive(Debug)]
pub enum UpstreamFrame {
    /// Write a text frame. The responder, if any, learns whether the write
    /// succeeded.
    Text {
        /// Payload written verbatim.
        payload: Arc<str>,
        /// Receives the write outcome.
        responder: Option<oneshot::Sender<AckResult>>,
        /// Queue budget held by this frame, released when the writer drops it.
        permit: Option<BytePermit>,
    },
    /// Send a normal-closure frame, then signal `done`.
    Close {
        /// Close reason sent to the server.
        reason: String,
        /// Fired once the close frame has been written (or failed).
        done: oneshot::Sender<()>,
    },
}

/// An event raised by the transport's reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// A text frame arrived.
    Text(String),
    /// The server closed the connection.
    Closed {
        /// Close code, if the server sent one.
        code: Option<u16>,
        /// Close reason, possibly empty.
        reason: String,
    },
    /// Reading failed; the connection is unusable.
    Error(String),
}

/// An open upstream connection, as seen by the link.
///
/// Dropping the inbound receiver's sender (on the transport side) is treated
/// exactly like a remote close.
#[derive(Debug)]
pub struct UpstreamTransport {
    /// Commands for the writer.
    pub outbound: mpsc::UnboundedSender<UpstreamFrame>,
    /// Events from the reader.
    pub inbound: mpsc::UnboundedReceiver<UpstreamEvent>,
    /// The I/O task backing this connection, aborted on release.
    pub io_task: Option<AbortHandle>,
}

/// Opens upstream connections.
pub trait UpstreamConnector: Send + Sync + 'static {
    /// Starts one connection attempt.
    fn connect(&self) -> BoxFuture<'static, RelayResult<UpstreamTransport>>;

    /// Human readable target, for log events.
    fn target(&self) -> String {
        "upstream".to_string()
    }
}

/// Connection state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// No connection and no attempt in flight.
    Disconnected,
    /// An attempt is in flight.
    Connecting,
    /// The link is usable.
    Connected,
}

/// Tunables for the link.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Constant delay before each retry.
    pub reconnect_delay: Duration,
    /// How long `close` waits for the close frame before aborting.
    pub close_timeout: Duration,
    /// Interval between upstream `ping`s while connected. `None` disables.
    pub heartbeat_interval: Option<Duration>,
    /// Most payload bytes allowed to wait for the upstream writer.
    pub max_pending_bytes: u64,
}

/// Default upstream queue budget (16 MiB).
pub const DEFAULT_MAX_PENDING_BYTES: u64 = 16 * 1024 * 1024;

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            close_timeout: Duration::from_secs(1),
            heartbeat_interval: Some(Duration::from_secs(30)),
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }
}

/// Aborts the transport's I/O task when dropped, whatever path released it.
#[derive(Debug)]
struct TransportGuard(Option<AbortHandle>);

impl Drop for TransportGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

#[derive(Debug)]
struct ActiveLink {
    generation: u64,
    outbound: mpsc::UnboundedSender<UpstreamFrame>,
    _guard: TransportGuard,
}

#[derive(Debug)]
struct LinkInner {
    state: LinkState,
    generation: u64,
    active: Option<ActiveLink>,
    retry: Option<(u64, CancellationToken)>,
    retry_seq: u64,
    wanted: bool,
    shut_down: bool,
}

/// The single shared upstream link.
pub struct UpstreamLink {
    connector: Arc<dyn UpstreamConnector>,
    options: LinkOptions,
    inner: Mutex<LinkInner>,
    connected: AtomicBool,
    attempts: AtomicU64,
    pending: Arc<ByteBudget>,
    broadcast_tx: mpsc::UnboundedSender<Arc<str>>,
}

impl UpstreamLink {
    /// Creates a disconnected link.
    ///
    /// Upstream payloads that should reach clients are pushed into the
    /// returned receiver; the router drains it.
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        options: LinkOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<str>>) {
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
        let pending = ByteBudget::new(options.max_pending_bytes);
        let link = Arc::new(Self {
            connector,
            options,
            inner: Mutex::new(LinkInner {
                state: LinkState::Disconnected,
                generation: 0,
                active: None,
                retry: None,
                retry_seq: 0,
                wanted: false,
                shut_down: false,
            }),
            connected: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
            pending,
            broadcast_tx,
        });
        (link, broadcast_rx)
    }

    fn lock(&self) -> MutexGuard<'_, LinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        self.lock().state
    }

    /// `true` only while `Connected`.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Number of connect attempts started so far.
    pub fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Payload bytes queued for upstream and not yet written.
    pub fn pending_bytes(&self) -> u64 {
        self.pending.in_use()
    }

    /// Whether a retry timer is pending.
    pub fn retry_pending(&self) -> bool {
        self.lock().retry.is_some()
    }

    /// Starts a connect attempt if the link is idle.
    ///
    /// Returns `true` when a new attempt was started. Does not wait for it.
    pub fn connect(self: &Arc<Self>) -> bool {
        let generation = {
            let mut inner = self.lock();
            if inner.shut_down {
                return false;
            }
            inner.wanted = true;
            if inner.state != LinkState::Disconnected || inner.retry.is_some() {
                return false;
            }
            inner.state = LinkState::Connecting;
            inner.generation += 1;
            inner.generation
        };

        let link = Arc::clone(self);
        tokio::spawn(async move { link.run_attempt(generation).await });
        true
    }

    async fn run_attempt(self: Arc<Self>, generation: u64) {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(attempt, upstream = %self.connector.target(), "connecting upstream");

        match self.connector.connect().await {
            Ok(transport) => self.on_open(generation, transport),
            Err(e) => self.on_connect_failure(generation, e),
        }
    }

    fn on_open(self: &Arc<Self>, generation: u64, transport: UpstreamTransport) {
        let UpstreamTransport { outbound, inbound, io_task } = transport;
        let guard = TransportGuard(io_task);

        {
            let mut inner = self.lock();
            if inner.generation != generation || inner.state != LinkState::Connecting {
                // Closed or superseded while connecting; `guard` releases it.
                tracing::debug!(generation, "discarding stale upstream connection");
                return;
            }
            inner.state = LinkState::Connected;
            inner.active = Some(ActiveLink {
                generation,
                outbound: outbound.clone(),
                _guard: guard,
            });
            self.connected.store(true, Ordering::Release);
        }
        tracing::info!(upstream = %self.connector.target(), "upstream connected");

        let link = Arc::clone(self);
        tokio::spawn(async move { link.pump(generation, inbound).await });

        if let Some(every) = self.options.heartbeat_interval {
            let link = Arc::clone(self);
            tokio::spawn(async move { link.heartbeat(generation, outbound, every).await });
        }
    }

    fn on_connect_failure(self: &Arc<Self>, generation: u64, err: RelayError) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != LinkState::Connecting {
            return;
        }
        inner.state = LinkState::Disconnected;
        self.connected.store(false, Ordering::Release);
        tracing::warn!(error = %err, "upstream connect failed");
        self.schedule_retry(&mut inner);
    }

    fn on_link_lost(self: &Arc<Self>, generation: u64, why: &str) {
        let released = {
            let mut inner = self.lock();
            if inner.generation != generation || inner.state != LinkState::Connected {
                return;
            }
            inner.state = LinkState::Disconnected;
            self.connected.store(false, Ordering::Release);
            tracing::warn!(reason = why, "upstream link lost");
            self.schedule_retry(&mut inner);
            inner.active.take()
        };
        drop(released);
    }

    /// Arms the single retry timer, unless one is pending or nobody wants the link.
    fn schedule_retry(self: &Arc<Self>, inner: &mut LinkInner) {
        if !inner.wanted || inner.shut_down || inner.retry.is_some() {
            return;
        }
        inner.retry_seq += 1;
        let seq = inner.retry_seq;
        let token = CancellationToken::new();
        inner.retry = Some((seq, token.clone()));

        let delay = self.options.reconnect_delay;
        tracing::info!(delay_ms = delay.as_millis() as u64, "upstream reconnect scheduled");

        let link = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("upstream reconnect cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    {
                        let mut inner = link.lock();
                        match &inner.retry {
                            Some((current, _)) if *current == seq => inner.retry = None,
                            _ => return,
                        }
                    }
                    link.connect();
                }
            }
        });
    }

    async fn pump(self: Arc<Self>, generation: u64, mut inbound: mpsc::UnboundedReceiver<UpstreamEvent>) {
        let why = loop {
            match inbound.recv().await {
                Some(UpstreamEvent::Text(text)) => self.on_receive(text),
                Some(UpstreamEvent::Closed { code, reason }) => {
                    tracing::info!(code, reason = %reason, "upstream closed the connection");
                    break "closed by upstream";
                }
                Some(UpstreamEvent::Error(e)) => {
                    tracing::error!(error = %e, "upstream read failed");
                    break "read error";
                }
                None => break "transport ended",
            }
        };
        self.on_link_lost(generation, why);
    }

    async fn heartbeat(
        self: Arc<Self>,
        generation: u64,
        outbound: mpsc::UnboundedSender<UpstreamFrame>,
        every: Duration,
    ) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            ticker.tick().await;
            {
                let inner = self.lock();
                let current = inner.active.as_ref().map(|a| a.generation);
                if current != Some(generation) {
                    return;
                }
            }
            let (tx, rx) = oneshot::channel();
            let frame = UpstreamFrame::Text {
                payload: Arc::from(HEARTBEAT_PING),
                responder: Some(tx),
                permit: None,
            };
            if outbound.send(frame).is_err() {
                return;
            }
            tracing::trace!("upstream heartbeat sent");
            if let Ok(Err(e)) = rx.await {
                tracing::warn!(error = %e, "upstream heartbeat write failed");
                self.on_link_lost(generation, "heartbeat write failed");
                return;
            }
        }
    }

    /// Handles one text frame from upstream.
    ///
    /// `pong` is consumed here; anything else is handed on for broadcast.
    pub fn on_receive(&self, payload: String) {
        match UpstreamMessage::classify(&payload) {
            UpstreamMessage::Heartbeat => tracing::trace!("upstream heartbeat reply"),
            UpstreamMessage::Broadcast => {
                tracing::debug!(bytes = payload.len(), "upstream message received");
                if self.broadcast_tx.send(Arc::from(payload)).is_err() {
                    tracing::warn!("upstream message dropped: router is gone");
                }
            }
        }
    }

    /// Queues a payload for upstream.
    ///
    /// Fails immediately with `UpstreamUnavailable` unless `Connected`, and
    /// with `Transport` when the queue budget is exhausted. On success the
    /// returned receiver later yields the write outcome; callers must not
    /// treat `Ok` as delivery.
    pub fn send(&self, payload: Arc<str>) -> RelayResult<oneshot::Receiver<AckResult>> {
        if !self.is_connected() {
            return Err(RelayError::UpstreamUnavailable);
        }
        let outbound = {
            let inner = self.lock();
            inner
                .active
                .as_ref()
                .map(|a| a.outbound.clone())
                .ok_or(RelayError::UpstreamUnavailable)?
        };
        let bytes = payload.len() as u64;
        let permit = self.pending.try_acquire(bytes).ok_or_else(|| {
            tracing::warn!(
                bytes,
                pending = self.pending.in_use(),
                capacity = self.pending.capacity(),
                "upstream queue full"
            );
            RelayError::Transport("upstream is busy, try again later".to_string())
        })?;
        let (tx, rx) = oneshot::channel();
        outbound
            .send(UpstreamFrame::Text {
                payload,
                responder: Some(tx),
                permit: Some(permit),
            })
            .map_err(|_| RelayError::UpstreamUnavailable)?;
        Ok(rx)
    }

    /// Closes the link and stops reconnecting until the next `connect`.
    ///
    /// The close frame is best effort, bounded by `close_timeout`. The
    /// transport is aborted afterwards in every case.
    pub async fn close(&self, reason: &str) {
        if let Some(closing) = self.detach() {
            closing.finish(reason).await;
        }
    }

    /// Moves the link to `Disconnected` at once, cancels any retry and hands
    /// back the open connection, if there was one, for [`ClosingLink::finish`].
    ///
    /// A `connect` issued after this starts a fresh connection.
    pub fn detach(&self) -> Option<ClosingLink> {
        let mut inner = self.lock();
        inner.wanted = false;
        if let Some((_, token)) = inner.retry.take() {
            token.cancel();
        }
        inner.generation += 1;
        inner.state = LinkState::Disconnected;
        self.connected.store(false, Ordering::Release);
        inner.active.take().map(|active| ClosingLink {
            active,
            timeout: self.options.close_timeout,
        })
    }

    /// Closes the link for good. Later `connect` calls are ignored.
    pub async fn shutdown(&self) {
        self.lock().shut_down = true;
        self.close("relay shutting down").await;
    }
}

/// A connection taken off the link that still owes its close frame.
#[derive(Debug)]
pub struct ClosingLink {
    active: ActiveLink,
    timeout: Duration,
}

impl ClosingLink {
    /// Sends the normal-closure frame, waits up to `close_timeout` for it to
    /// be written, then aborts the transport.
    pub async fn finish(self, reason: &str) {
        let (done_tx, done_rx) = oneshot::channel();
        let frame = UpstreamFrame::Close {
            reason: reason.to_string(),
            done: done_tx,
        };
        if self.active.outbound.send(frame).is_ok()
            && tokio::time::timeout(self.timeout, done_rx).await.is_err()
        {
            tracing::warn!("upstream close signal timed out");
        }
        drop(self.active);
        tracing::info!(reason, "upstream link closed");
    }
}
