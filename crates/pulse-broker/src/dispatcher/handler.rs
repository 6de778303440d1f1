//! The event handler contract and its registration record.
//!
//! Handlers are registered explicitly with a builder — there is no runtime
//! scanning. A registration carries the handler's priority, its required
//! payload fields, an enabled toggle, and per-handler metrics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::metrics::RollingAverage;

/// Window size for per-handler processing-time tracking.
const PROCESSING_WINDOW: usize = 50;

/// Error returned by a handler's `handle` step.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload was structurally valid but semantically unusable.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The handler's work failed.
    #[error("{0}")]
    Failed(String),
}

/// User-supplied logic bound to an event type.
///
/// `validate` runs first; returning `false` records a validation failure and
/// skips `handle`. Errors from `handle` are isolated per handler — they are
/// recorded but never abort sibling handlers or the dispatcher loop.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Cheap structural check before `handle`.
    async fn validate(&self, _payload: &Value) -> bool {
        true
    }

    /// Process the payload. The returned value is recorded for diagnostics;
    /// any follow-up emission is the handler's own business through whatever
    /// services it captured.
    async fn handle(&self, payload: &Value) -> Result<Value, HandlerError>;
}

/// Per-handler execution counters.
pub struct HandlerMetrics {
    invocations: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    validation_failures: AtomicU64,
    skipped: AtomicU64,
    processing_time_ms: Mutex<RollingAverage>,
}

impl HandlerMetrics {
    fn new() -> Self {
        Self {
            invocations: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            processing_time_ms: Mutex::new(RollingAverage::new(PROCESSING_WINDOW)),
        }
    }

    /// Record a successful invocation.
    pub fn record_success(&self, elapsed_ms: f64) {
        let _ = self.invocations.fetch_add(1, Ordering::Relaxed);
        let _ = self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_time(elapsed_ms);
    }

    /// Record a failed invocation.
    pub fn record_failure(&self, elapsed_ms: f64) {
        let _ = self.invocations.fetch_add(1, Ordering::Relaxed);
        let _ = self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_time(elapsed_ms);
    }

    /// Record a validation rejection (handle was skipped).
    pub fn record_validation_failure(&self) {
        let _ = self.invocations.fetch_add(1, Ordering::Relaxed);
        let _ = self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a deterministic no-op (handler or registry disabled, or
    /// filters did not match).
    pub fn record_skipped(&self) {
        let _ = self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_time(&self, elapsed_ms: f64) {
        self.processing_time_ms.lock().record(elapsed_ms);
    }

    /// Point-in-time snapshot.
    pub fn snapshot(&self) -> HandlerMetricsSnapshot {
        HandlerMetricsSnapshot {
            invocations: self.invocations.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            avg_processing_time_ms: self.processing_time_ms.lock().average(),
        }
    }
}

/// Serializable view of [`HandlerMetrics`].
#[derive(Clone, Debug, Serialize)]
pub struct HandlerMetricsSnapshot {
    /// Times the handler was invoked (including validation rejections).
    pub invocations: u64,
    /// Successful `handle` completions.
    pub succeeded: u64,
    /// Failed `handle` completions (errors and panics).
    pub failed: u64,
    /// Payloads rejected by `validate`.
    pub validation_failures: u64,
    /// Deterministic no-ops (disabled or filter mismatch).
    pub skipped: u64,
    /// Rolling average `handle` duration.
    pub avg_processing_time_ms: f64,
}

/// A handler bound to an event type (or registered globally).
pub struct HandlerRegistration {
    name: String,
    priority: i32,
    filters: HashMap<String, Value>,
    enabled: AtomicBool,
    handler: Box<dyn EventHandler>,
    metrics: HandlerMetrics,
}

impl HandlerRegistration {
    /// Create a registration with priority 0 and no filters.
    pub fn new(name: impl Into<String>, handler: impl EventHandler + 'static) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            filters: HashMap::new(),
            enabled: AtomicBool::new(true),
            handler: Box::new(handler),
            metrics: HandlerMetrics::new(),
        }
    }

    /// Set the priority (higher runs first).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Require a payload field to equal `value` for this handler to run.
    pub fn with_filter(mut self, key: impl Into<String>, value: Value) -> Self {
        let _ = self.filters.insert(key.into(), value);
        self
    }

    /// Start disabled.
    pub fn disabled(self) -> Self {
        self.enabled.store(false, Ordering::Relaxed);
        self
    }

    /// Handler name, for logs and diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registration priority.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Toggle the handler at runtime.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether the handler is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Whether a payload satisfies this registration's required fields
    /// (exact equality, same semantics as connection filters).
    pub fn matches(&self, payload: &Value) -> bool {
        self.filters
            .iter()
            .all(|(key, expected)| payload.get(key) == Some(expected))
    }

    /// The underlying handler.
    pub fn handler(&self) -> &dyn EventHandler {
        self.handler.as_ref()
    }

    /// Execution counters.
    pub fn metrics(&self) -> &HandlerMetrics {
        &self.metrics
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
