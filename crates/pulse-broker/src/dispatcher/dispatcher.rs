//! Queued event dispatch with concurrent per-event handler fan-out.
//!
//! Producers never block: the queue is bounded and drop-on-full. A single
//! worker task drains it and runs every matching handler for an event
//! concurrently — one task per handler, so a panicking or failing handler
//! cannot take its siblings down — awaiting them all before the event counts
//! as processed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::handler::HandlerRegistration;
use super::registry::HandlerRegistry;
use crate::metrics::RollingAverage;

/// Window size for event processing-time tracking.
const PROCESSING_WINDOW: usize = 100;

/// Configuration for the dispatcher queue.
#[derive(Clone, Copy, Debug)]
pub struct DispatcherConfig {
    /// Bounded queue capacity; events beyond it are dropped, not blocked on.
    pub queue_capacity: usize,
    /// How many failure records to keep for diagnostics.
    pub failed_events_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            failed_events_capacity: 100,
        }
    }
}

struct QueuedEvent {
    event_type: String,
    payload: Value,
}

/// A handler failure kept for diagnostics.
#[derive(Clone, Debug, Serialize)]
pub struct FailedEvent {
    /// Event type being processed.
    pub event_type: String,
    /// Name of the handler that failed.
    pub handler: String,
    /// Error message (or panic description).
    pub error: String,
    /// When the failure happened (RFC-3339).
    pub timestamp: String,
}

/// Routes events through registered handlers.
pub struct EventDispatcher {
    registry: Arc<HandlerRegistry>,
    tx: mpsc::Sender<QueuedEvent>,
    rx: Mutex<Option<mpsc::Receiver<QueuedEvent>>>,
    cancel: CancellationToken,
    config: DispatcherConfig,

    events_processed: AtomicU64,
    events_queued: AtomicU64,
    events_dropped: AtomicU64,
    events_skipped: AtomicU64,
    handlers_executed: AtomicU64,
    handlers_failed: AtomicU64,
    processing_time_ms: Mutex<RollingAverage>,
    failed_events: Mutex<VecDeque<FailedEvent>>,
}

impl EventDispatcher {
    /// Create a dispatcher over a handler registry.
    pub fn new(registry: Arc<HandlerRegistry>, config: DispatcherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            registry,
            tx,
            rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            config,
            events_processed: AtomicU64::new(0),
            events_queued: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            events_skipped: AtomicU64::new(0),
            handlers_executed: AtomicU64::new(0),
            handlers_failed: AtomicU64::new(0),
            processing_time_ms: Mutex::new(RollingAverage::new(PROCESSING_WINDOW)),
            failed_events: Mutex::new(VecDeque::new()),
        }
    }

    /// The handler registry backing this dispatcher.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Run the worker loop that drains the queue. Spawn once on the shared
    /// handle: `tokio::spawn(dispatcher.clone().run())`. Exits on
    /// [`EventDispatcher::stop`] or when every sender is gone.
    pub async fn run(self: Arc<Self>) {
        let Some(mut rx) = self.rx.lock().take() else {
            warn!("dispatcher worker already started");
            return;
        };
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => {
                        self.execute_handlers(&event.event_type, &event.payload).await;
                    }
                    None => break,
                },
            }
        }
        debug!("dispatcher worker stopped");
    }

    /// Stop the worker task.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Dispatch an event.
    ///
    /// With `sync = true` the handlers run before this call returns. With
    /// `sync = false` the event is enqueued for the worker; when the queue
    /// is full the event is dropped and counted, never blocking the
    /// producer. Returns whether the event was accepted.
    pub async fn dispatch(&self, event_type: &str, payload: Value, sync: bool) -> bool {
        if sync {
            self.execute_handlers(event_type, &payload).await;
            return true;
        }
        match self.tx.try_send(QueuedEvent {
            event_type: event_type.to_owned(),
            payload,
        }) {
            Ok(()) => {
                let _ = self.events_queued.fetch_add(1, Ordering::Relaxed);
                counter!("dispatcher_events_queued_total").increment(1);
                true
            }
            Err(TrySendError::Full(event)) => {
                let _ = self.events_dropped.fetch_add(1, Ordering::Relaxed);
                counter!("dispatcher_events_dropped_total").increment(1);
                warn!(
                    event_type = event.event_type,
                    capacity = self.config.queue_capacity,
                    "dispatch queue full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                warn!(event_type = event.event_type, "dispatch queue closed");
                false
            }
        }
    }

    /// Run every matching handler for one event, concurrently, and wait for
    /// all of them.
    async fn execute_handlers(&self, event_type: &str, payload: &Value) {
        if !self.registry.is_enabled() {
            let _ = self.events_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let start = Instant::now();
        let mut tasks: Vec<(Arc<HandlerRegistration>, JoinHandle<Option<String>>)> = Vec::new();

        // Spawn in priority order; completion order is unordered.
        for registration in self.registry.handlers_for(event_type) {
            if !registration.is_enabled() || !registration.matches(payload) {
                registration.metrics().record_skipped();
                continue;
            }
            let reg = Arc::clone(&registration);
            let event_type = event_type.to_owned();
            let payload = payload.clone();
            let task =
                tokio::spawn(async move { run_handler(&reg, &event_type, &payload).await });
            tasks.push((registration, task));
        }

        let executed = tasks.len() as u64;
        for (registration, task) in tasks {
            let failure = match task.await {
                Ok(failure) => failure,
                Err(join_error) => {
                    // A panicking handler is isolated to its own task.
                    registration
                        .metrics()
                        .record_failure(start.elapsed().as_secs_f64() * 1000.0);
                    Some(format!("handler panicked: {join_error}"))
                }
            };
            if let Some(error) = failure {
                self.record_handler_failure(event_type, registration.name(), &error);
            }
        }

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let _ = self.events_processed.fetch_add(1, Ordering::Relaxed);
        let _ = self.handlers_executed.fetch_add(executed, Ordering::Relaxed);
        self.processing_time_ms.lock().record(elapsed_ms);
        counter!("dispatcher_events_total").increment(1);
        histogram!("dispatcher_processing_seconds").record(elapsed_ms / 1000.0);
    }

    fn record_handler_failure(&self, event_type: &str, handler: &str, error: &str) {
        let _ = self.handlers_failed.fetch_add(1, Ordering::Relaxed);
        counter!("dispatcher_handler_failures_total").increment(1);
        let mut failed = self.failed_events.lock();
        failed.push_back(FailedEvent {
            event_type: event_type.to_owned(),
            handler: handler.to_owned(),
            error: error.to_owned(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
        while failed.len() > self.config.failed_events_capacity {
            let _ = failed.pop_front();
        }
    }

    /// Rolling average event processing time in milliseconds.
    pub fn avg_processing_time_ms(&self) -> f64 {
        self.processing_time_ms.lock().average()
    }

    /// Point-in-time snapshot for the stats endpoint.
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_queued: self.events_queued.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            handlers_executed: self.handlers_executed.load(Ordering::Relaxed),
            handlers_failed: self.handlers_failed.load(Ordering::Relaxed),
            avg_processing_time_ms: self.avg_processing_time_ms(),
            queue_capacity: self.config.queue_capacity,
            failed_events: self.failed_events.lock().iter().cloned().collect(),
        }
    }
}

async fn run_handler(
    registration: &HandlerRegistration,
    event_type: &str,
    payload: &Value,
) -> Option<String> {
    if !registration.handler().validate(payload).await {
        registration.metrics().record_validation_failure();
        debug!(
            handler = registration.name(),
            event_type, "payload rejected by validation"
        );
        return None;
    }

    let start = Instant::now();
    match registration.handler().handle(payload).await {
        Ok(_result) => {
            registration
                .metrics()
                .record_success(start.elapsed().as_secs_f64() * 1000.0);
            None
        }
        Err(error) => {
            registration
                .metrics()
                .record_failure(start.elapsed().as_secs_f64() * 1000.0);
            warn!(
                handler = registration.name(),
                event_type,
                error = %error,
                "handler failed"
            );
            Some(error.to_string())
        }
    }
}

/// Serializable view of dispatcher state.
#[derive(Clone, Debug, Serialize)]
pub struct DispatcherStats {
    /// Events fully processed (all handlers awaited).
    pub events_processed: u64,
    /// Events accepted onto the queue.
    pub events_queued: u64,
    /// Events dropped because the queue was full.
    pub events_dropped: u64,
    /// Events skipped because the registry was disabled.
    pub events_skipped: u64,
    /// Handler invocations started.
    pub handlers_executed: u64,
    /// Handler invocations that failed (errors and panics).
    pub handlers_failed: u64,
    /// Rolling average per-event processing time.
    pub avg_processing_time_ms: f64,
    /// Configured queue capacity.
    pub queue_capacity: usize,
    /// Recent handler failures, oldest first.
    pub failed_events: Vec<FailedEvent>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
