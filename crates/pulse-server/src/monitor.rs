//! Stale-connection cleanup and advisory load monitoring.
//!
//! Both loops are observability/maintenance only — threshold breaches are
//! logged, never acted on, and neither loop can terminate the server.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pulse_broker::{ConnectionPool, EventDispatcher};

/// Run the stale-connection cleanup sweep until cancelled.
pub async fn run_cleanup_loop(
    pool: Arc<ConnectionPool>,
    interval: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    let _ = ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let removed = pool.cleanup_stale(max_age);
                if !removed.is_empty() {
                    counter!("stale_cleanups_total").increment(removed.len() as u64);
                }
            }
        }
    }
    debug!("cleanup loop stopped");
}

/// Thresholds for the advisory monitor.
#[derive(Clone, Copy, Debug)]
pub struct MonitorThresholds {
    /// Warn when active connections reach this count.
    pub connection_count: usize,
    /// Warn when rolling dispatch latency exceeds this.
    pub latency_ms: f64,
}

/// Run the advisory load monitor until cancelled.
pub async fn run_monitor_loop(
    pool: Arc<ConnectionPool>,
    dispatcher: Arc<EventDispatcher>,
    thresholds: MonitorThresholds,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    let _ = ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                check_thresholds(&pool, &dispatcher, thresholds);
            }
        }
    }
    debug!("monitor loop stopped");
}

#[allow(clippy::cast_precision_loss)]
fn check_thresholds(
    pool: &ConnectionPool,
    dispatcher: &EventDispatcher,
    thresholds: MonitorThresholds,
) {
    let active = pool.active_connections();
    gauge!("ws_connections_active").set(active as f64);

    if active >= thresholds.connection_count {
        warn!(
            active,
            threshold = thresholds.connection_count,
            "server overload: connection count above threshold"
        );
    }

    let avg_latency = dispatcher.avg_processing_time_ms();
    if avg_latency > thresholds.latency_ms {
        warn!(
            avg_latency_ms = avg_latency,
            threshold_ms = thresholds.latency_ms,
            "server overload: dispatch latency above threshold"
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
