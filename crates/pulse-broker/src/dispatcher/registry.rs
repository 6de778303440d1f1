//! Registry mapping event types to priority-ordered handler lists.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::handler::{HandlerMetricsSnapshot, HandlerRegistration};

struct RegistryInner {
    by_type: HashMap<String, Vec<Arc<HandlerRegistration>>>,
    global: Vec<Arc<HandlerRegistration>>,
}

/// Handler registry.
///
/// Registration is rare relative to dispatch volume, so dispatch takes
/// copy-on-read snapshots under a read lock. Lists are kept sorted by
/// priority descending (stable: equal priorities keep registration order).
pub struct HandlerRegistry {
    inner: RwLock<RegistryInner>,
    enabled: AtomicBool,
}

impl HandlerRegistry {
    /// Create an empty, enabled registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                by_type: HashMap::new(),
                global: Vec::new(),
            }),
            enabled: AtomicBool::new(true),
        }
    }

    /// Register a handler for one event type. Returns the shared
    /// registration so the caller can toggle it or read its metrics.
    pub fn register(
        &self,
        event_type: &str,
        registration: HandlerRegistration,
    ) -> Arc<HandlerRegistration> {
        let registration = Arc::new(registration);
        let mut inner = self.inner.write();
        let list = inner.by_type.entry(event_type.to_owned()).or_default();
        list.push(registration.clone());
        list.sort_by_key(|r| Reverse(r.priority()));
        registration
    }

    /// Register a handler that runs for every event type.
    pub fn register_global(&self, registration: HandlerRegistration) -> Arc<HandlerRegistration> {
        let registration = Arc::new(registration);
        let mut inner = self.inner.write();
        inner.global.push(registration.clone());
        inner.global.sort_by_key(|r| Reverse(r.priority()));
        registration
    }

    /// Snapshot of the handlers that apply to `event_type`: type-specific ∪
    /// global, merged in priority order (stable).
    pub fn handlers_for(&self, event_type: &str) -> Vec<Arc<HandlerRegistration>> {
        let inner = self.inner.read();
        let mut combined: Vec<Arc<HandlerRegistration>> = inner
            .by_type
            .get(event_type)
            .into_iter()
            .flatten()
            .chain(inner.global.iter())
            .cloned()
            .collect();
        combined.sort_by_key(|r| Reverse(r.priority()));
        combined
    }

    /// Number of registrations (type-specific plus global).
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.by_type.values().map(Vec::len).sum::<usize>() + inner.global.len()
    }

    /// Whether the registry has no handlers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Toggle the whole registry. A disabled registry is a deterministic
    /// no-op for every dispatch.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether the registry is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Per-handler metric snapshots keyed by handler name, for `/stats`.
    pub fn metrics_snapshot(&self) -> HashMap<String, HandlerMetricsSnapshot> {
        let inner = self.inner.read();
        inner
            .by_type
            .values()
            .flatten()
            .chain(inner.global.iter())
            .map(|r| (r.name().to_owned(), r.metrics().snapshot()))
            .collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
