//! Per-client connection state and outbound transport.
//!
//! A [`Connection`] is the send-side handle for one client. It owns the
//! sending half of a bounded channel; the socket writer task (in
//! `pulse-server`) drains the receiving half, which is what guarantees
//! per-connection FIFO delivery. The pool's reverse indexes are the source
//! of truth for membership — the local sets here are bookkeeping kept in
//! sync by [`crate::pool::ConnectionPool`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pulse_proto::{Envelope, frames};

use crate::error::{BrokerError, Result};
use crate::metrics::ConnectionMetrics;
use crate::rate_limit::TokenBucket;

/// Micro-window a batched message may wait before flushing.
pub const BATCH_WINDOW: Duration = Duration::from_millis(10);

/// Queued batch size that triggers an immediate flush.
pub const BATCH_MAX: usize = 10;

/// Capacity of the batch staging channel.
const BATCH_CHANNEL_CAPACITY: usize = 256;

/// Frames handed to the socket writer task.
#[derive(Clone, Debug)]
pub enum OutboundFrame {
    /// A serialized text frame.
    Text(Arc<String>),
    /// A transport-level ping.
    Ping,
    /// Close the socket with a code and reason, then stop writing.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// One connected client.
pub struct Connection {
    /// Unique connection ID (server-assigned or client-supplied).
    pub id: String,
    /// Authenticated user, when the verifier resolved one.
    pub user_id: Option<String>,
    /// Permission set recorded from the authentication collaborator.
    pub permissions: Vec<String>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has responded since the last heartbeat sweep.
    pub is_alive: AtomicBool,

    tx: mpsc::Sender<OutboundFrame>,
    batch_tx: mpsc::Sender<Envelope>,
    batch_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    rate_limiter: TokenBucket,
    closed: AtomicBool,
    last_pong: Mutex<Instant>,
    subscriptions: RwLock<HashSet<String>>,
    rooms: RwLock<HashSet<String>>,
    event_filters: RwLock<HashMap<String, HashMap<String, Value>>>,
    cancel: CancellationToken,
    metrics: ConnectionMetrics,
}

impl Connection {
    /// Create a connection with a fresh rate limiter.
    ///
    /// Batched sends are staged on an internal channel; spawn
    /// [`Connection::spawn_batch_flusher`] on the shared handle to drain it.
    pub fn new(
        id: String,
        user_id: Option<String>,
        tx: mpsc::Sender<OutboundFrame>,
        rate_limiter: TokenBucket,
    ) -> Self {
        let now = Instant::now();
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        Self {
            id,
            user_id,
            permissions: Vec::new(),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            tx,
            batch_tx,
            batch_rx: Mutex::new(Some(batch_rx)),
            rate_limiter,
            closed: AtomicBool::new(false),
            last_pong: Mutex::new(now),
            subscriptions: RwLock::new(HashSet::new()),
            rooms: RwLock::new(HashSet::new()),
            event_filters: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            metrics: ConnectionMetrics::new(),
        }
    }

    /// Attach a permission set (builder style, used at handshake).
    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }

    // ── Sending ──────────────────────────────────────────────────────

    /// Send an envelope to this client.
    ///
    /// With `batch = false` the frame is enqueued to the writer task
    /// immediately; with `batch = true` it is staged for the batch flusher,
    /// which combines messages into one `batch` frame when either
    /// [`BATCH_MAX`] accumulate or [`BATCH_WINDOW`] elapses.
    ///
    /// Fails with [`BrokerError::ConnectionClosed`] on a closed connection,
    /// [`BrokerError::RateLimitExceeded`] when the token bucket is empty,
    /// and [`BrokerError::QueueFull`] when the target channel is full.
    pub fn send(&self, envelope: &Envelope, batch: bool) -> Result<()> {
        if self.is_closed() {
            return Err(BrokerError::ConnectionClosed);
        }
        if !self.rate_limiter.try_acquire() {
            self.metrics.record_dropped();
            return Err(BrokerError::RateLimitExceeded);
        }
        if batch {
            match self.batch_tx.try_send(envelope.clone()) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    self.metrics.record_dropped();
                    Err(BrokerError::QueueFull)
                }
                Err(TrySendError::Closed(_)) => Err(BrokerError::ConnectionClosed),
            }
        } else {
            self.send_now(envelope)
        }
    }

    fn send_now(&self, envelope: &Envelope) -> Result<()> {
        let json = envelope.to_json()?;
        self.send_text(Arc::new(json))
    }

    fn send_text(&self, text: Arc<String>) -> Result<()> {
        let bytes = text.len();
        match self.tx.try_send(OutboundFrame::Text(text)) {
            Ok(()) => {
                self.metrics.record_sent(bytes);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.record_dropped();
                Err(BrokerError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::SeqCst);
                Err(BrokerError::ConnectionClosed)
            }
        }
    }

    /// Spawn the batch flusher for this connection. Call once after wrapping
    /// the connection in an `Arc`.
    ///
    /// The flusher waits for a first staged message, then collects more
    /// until [`BATCH_MAX`] accumulate or [`BATCH_WINDOW`] elapses, and
    /// writes them as one combined frame. Close cancels it; pending
    /// messages are dropped without sending.
    pub fn spawn_batch_flusher(connection: Arc<Self>) -> JoinHandle<()> {
        let Some(mut rx) = connection.batch_rx.lock().take() else {
            debug!(conn_id = %connection.id, "batch flusher already running");
            return tokio::spawn(async {});
        };
        tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    () = connection.cancel.cancelled() => break,
                    staged = rx.recv() => match staged {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };

                let mut pending = vec![first];
                let window = tokio::time::sleep(BATCH_WINDOW);
                tokio::pin!(window);
                loop {
                    tokio::select! {
                        () = connection.cancel.cancelled() => return,
                        () = &mut window => break,
                        staged = rx.recv() => match staged {
                            Some(envelope) => {
                                pending.push(envelope);
                                if pending.len() >= BATCH_MAX {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }

                // Close drains queued-but-unflushed messages without sending.
                if connection.is_closed() {
                    return;
                }
                if let Err(e) = connection.flush_batch(&pending) {
                    debug!(conn_id = %connection.id, error = %e, "batch flush failed");
                }
            }
        })
    }

    fn flush_batch(&self, messages: &[Envelope]) -> Result<()> {
        // A single queued message skips the batch wrapper.
        match messages {
            [only] => self.send_now(only),
            many => self.send_now(&frames::batch(many)),
        }
    }

    /// Enqueue a transport-level ping. Returns `false` when the writer
    /// channel is full or gone.
    pub fn ping(&self) -> bool {
        self.tx.try_send(OutboundFrame::Ping).is_ok()
    }

    // ── Liveness ─────────────────────────────────────────────────────

    /// Mark the connection as alive (pong or any client activity).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Check and reset the alive flag for the heartbeat sweep.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    // ── Subscription / room bookkeeping ──────────────────────────────
    //
    // Local sets only; the pool updates these together with its reverse
    // indexes inside one critical section.

    /// Record a subscription, with optional exact-match payload filters.
    pub fn subscribe(&self, event_type: &str, filters: Option<HashMap<String, Value>>) {
        let _ = self.subscriptions.write().insert(event_type.to_owned());
        if let Some(filters) = filters {
            let _ = self.event_filters.write().insert(event_type.to_owned(), filters);
        }
    }

    /// Drop a subscription and its filters.
    pub fn unsubscribe(&self, event_type: &str) {
        let _ = self.subscriptions.write().remove(event_type);
        let _ = self.event_filters.write().remove(event_type);
    }

    /// Record room membership.
    pub fn join_room(&self, room: &str) {
        let _ = self.rooms.write().insert(room.to_owned());
    }

    /// Drop room membership.
    pub fn leave_room(&self, room: &str) {
        let _ = self.rooms.write().remove(room);
    }

    /// Whether this connection subscribed to `event_type`.
    pub fn is_subscribed(&self, event_type: &str) -> bool {
        self.subscriptions.read().contains(event_type)
    }

    /// Whether this connection is a member of `room`.
    pub fn in_room(&self, room: &str) -> bool {
        self.rooms.read().contains(room)
    }

    /// Snapshot of current subscriptions.
    pub fn subscriptions(&self) -> HashSet<String> {
        self.subscriptions.read().clone()
    }

    /// Snapshot of current room memberships.
    pub fn rooms(&self) -> HashSet<String> {
        self.rooms.read().clone()
    }

    /// Apply this connection's filter for `event_type` to a payload.
    ///
    /// True when no filter is registered; otherwise every filter key must
    /// equal the corresponding payload value exactly (no range or partial
    /// matching).
    pub fn matches_filter(&self, event_type: &str, payload: &Value) -> bool {
        let filters = self.event_filters.read();
        let Some(required) = filters.get(event_type) else {
            return true;
        };
        required
            .iter()
            .all(|(key, expected)| payload.get(key) == Some(expected))
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Completes once the connection has been closed (by any actor — the
    /// session itself, the heartbeat sweep, or server shutdown).
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Close the connection. Idempotent.
    ///
    /// Cancels the batch flusher (dropping staged messages) and enqueues a
    /// close frame for the writer task.
    pub fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let _ = self.tx.try_send(OutboundFrame::Close {
            code,
            reason: reason.to_owned(),
        });
        debug!(
            conn_id = %self.id,
            duration_secs = self.connected_at.elapsed().as_secs_f64(),
            "connection closed"
        );
    }

    /// Transfer counters and latency window.
    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
