//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at server startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across crates.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Handshakes refused at the connection cap (counter).
pub const WS_HANDSHAKES_REFUSED_TOTAL: &str = "ws_handshakes_refused_total";
/// Connection duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Socket-write latency seconds (histogram).
pub const WS_SEND_LATENCY_SECONDS: &str = "ws_send_latency_seconds";
/// Inbound frames total (counter, labels: kind).
pub const WS_FRAMES_RECEIVED_TOTAL: &str = "ws_frames_received_total";
/// Fan-out deliveries total (counter, labels: op).
pub const FANOUT_DELIVERIES_TOTAL: &str = "fanout_deliveries_total";
/// Fan-out drops total (counter, labels: op).
pub const FANOUT_DROPS_TOTAL: &str = "fanout_drops_total";
/// Heartbeat timeouts total (counter).
pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "heartbeat_timeouts_total";
/// Stale connections removed total (counter).
pub const STALE_CLEANUPS_TOTAL: &str = "stale_cleanups_total";
/// Dispatcher events processed total (counter).
pub const DISPATCHER_EVENTS_TOTAL: &str = "dispatcher_events_total";
/// Dispatcher events dropped at the queue (counter).
pub const DISPATCHER_EVENTS_DROPPED_TOTAL: &str = "dispatcher_events_dropped_total";
/// Dispatcher handler failures total (counter).
pub const DISPATCHER_HANDLER_FAILURES_TOTAL: &str = "dispatcher_handler_failures_total";
/// Per-event dispatch duration seconds (histogram).
pub const DISPATCHER_PROCESSING_SECONDS: &str = "dispatcher_processing_seconds";
