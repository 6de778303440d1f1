//! `GatewayServer` — Axum HTTP + WebSocket server.
//!
//! The server is the only component holding both the [`ConnectionPool`] and
//! the [`EventDispatcher`]; both are constructed here and passed by
//! reference — there is no ambient global state. The HTTP surface calls
//! only the public `broadcast`/`emit` operations and read-only stats.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use pulse_broker::dispatcher::{DispatcherConfig, DispatcherStats, HandlerMetricsSnapshot};
use pulse_broker::dispatcher::registry::HandlerRegistry;
use pulse_broker::pool::PoolStats;
use pulse_broker::{BrokerError, ConnectionPool, EventDispatcher};
use pulse_proto::Envelope;

use crate::auth::{AllowAll, TokenVerifier};
use crate::config::GatewayConfig;
use crate::health::{self, HealthResponse};
use crate::heartbeat;
use crate::monitor::{self, MonitorThresholds};
use crate::session;
use crate::shutdown::ShutdownCoordinator;

/// WebSocket close code sent when the server shuts down.
const CLOSE_GOING_AWAY: u16 = 1001;

/// How long shutdown waits for in-flight sessions to drain.
const SHUTDOWN_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection registry.
    pub pool: Arc<ConnectionPool>,
    /// Event dispatcher.
    pub dispatcher: Arc<EventDispatcher>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Authentication collaborator.
    pub verifier: Arc<dyn TokenVerifier>,
    /// Gateway configuration.
    pub config: Arc<GatewayConfig>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus render handle, when the recorder is installed.
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    /// Fan a message out to a room's members, or to every connection.
    ///
    /// Sends are batched. A connection whose transport is gone is removed
    /// from the pool; rate-limited or backlogged connections are skipped
    /// and counted as drops but stay connected. Returns the delivered
    /// count.
    pub fn broadcast(&self, envelope: &Envelope, room: Option<&str>) -> usize {
        let targets = match room {
            Some(room) => self.pool.get_by_room(room),
            None => self.pool.all(),
        };
        self.deliver(envelope, targets, "broadcast")
    }

    /// Fan an event out to its subscribers, optionally restricted to a
    /// room, honoring each connection's payload filters — and enqueue it
    /// onto the dispatcher so registered handlers observe it.
    pub async fn emit(&self, event_type: &str, payload: Value, room: Option<&str>) -> usize {
        let envelope = Envelope::new(event_type, payload.clone());
        let mut targets = self.pool.get_by_subscription(event_type);
        if let Some(room) = room {
            targets.retain(|conn| conn.in_room(room));
        }
        targets.retain(|conn| conn.matches_filter(event_type, &payload));
        let delivered = self.deliver(&envelope, targets, "emit");

        let _ = self.dispatcher.dispatch(event_type, payload, false).await;
        delivered
    }

    fn deliver(
        &self,
        envelope: &Envelope,
        targets: Vec<Arc<pulse_broker::Connection>>,
        op: &'static str,
    ) -> usize {
        let mut delivered = 0_usize;
        for conn in targets {
            match conn.send(envelope, true) {
                Ok(()) => delivered += 1,
                Err(BrokerError::ConnectionClosed) => {
                    debug!(conn_id = %conn.id, op, "dropping dead connection during fan-out");
                    let _ = self.pool.remove(&conn.id);
                    counter!("fanout_drops_total", "op" => op).increment(1);
                }
                Err(e) => {
                    debug!(conn_id = %conn.id, op, error = %e, "fan-out send failed");
                    counter!("fanout_drops_total", "op" => op).increment(1);
                }
            }
        }
        counter!("fanout_deliveries_total", "op" => op).increment(delivered as u64);
        delivered
    }

    /// Mean socket-write latency across live connections.
    pub fn avg_send_latency_ms(&self) -> f64 {
        let connections = self.pool.all();
        if connections.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let count = connections.len() as f64;
        connections
            .iter()
            .map(|c| c.metrics().avg_send_latency_ms())
            .sum::<f64>()
            / count
    }
}

/// The Pulse gateway server.
pub struct GatewayServer {
    state: AppState,
}

impl GatewayServer {
    /// Create a server with a fresh pool, registry, and dispatcher.
    pub fn new(config: GatewayConfig) -> Self {
        let pool = Arc::new(ConnectionPool::new(config.max_connections));
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Arc::new(EventDispatcher::new(
            registry,
            DispatcherConfig {
                queue_capacity: config.dispatch_queue_capacity,
                ..DispatcherConfig::default()
            },
        ));
        Self {
            state: AppState {
                pool,
                dispatcher,
                shutdown: Arc::new(ShutdownCoordinator::new()),
                verifier: Arc::new(AllowAll),
                config: Arc::new(config),
                start_time: Instant::now(),
                metrics_handle: None,
            },
        }
    }

    /// Use a specific authentication collaborator.
    pub fn with_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.state.verifier = verifier;
        self
    }

    /// Attach the Prometheus render handle for `/metrics`.
    pub fn with_metrics_handle(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics_handle = Some(handle);
        self
    }

    /// Clone the shared handler state (pool, dispatcher, config, …).
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.state.pool
    }

    /// Get the event dispatcher.
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.state.dispatcher
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.state.config
    }

    /// Fan a message out to a room or to every connection.
    pub fn broadcast(&self, envelope: &Envelope, room: Option<&str>) -> usize {
        self.state.broadcast(envelope, room)
    }

    /// Fan an event out to subscribers and feed it to the dispatcher.
    pub async fn emit(&self, event_type: &str, payload: Value, room: Option<&str>) -> usize {
        self.state.emit(event_type, payload, room).await
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .route("/broadcast", post(broadcast_handler))
            .route("/emit/{event_type}", post(emit_handler))
            .route("/ws", get(session::ws_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind and serve.
    ///
    /// Spawns the dispatcher worker and the heartbeat, cleanup, and
    /// monitoring loops, all tied to the shutdown token. Returns the bound
    /// address and a handle that resolves once the server has fully shut
    /// down (every connection closed, every loop drained).
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener =
            tokio::net::TcpListener::bind((self.state.config.host.as_str(), self.state.config.port))
                .await?;
        let addr = listener.local_addr()?;
        let app = self.router();

        let token = self.state.shutdown.token();
        let config = &self.state.config;

        let background = vec![
            tokio::spawn(self.state.dispatcher.clone().run()),
            tokio::spawn(heartbeat::run_heartbeat_loop(
                self.state.pool.clone(),
                config.heartbeat_interval(),
                config.heartbeat_timeout(),
                token.clone(),
            )),
            tokio::spawn(monitor::run_cleanup_loop(
                self.state.pool.clone(),
                config.cleanup_interval(),
                config.stale_max_age(),
                token.clone(),
            )),
            tokio::spawn(monitor::run_monitor_loop(
                self.state.pool.clone(),
                self.state.dispatcher.clone(),
                MonitorThresholds {
                    connection_count: config.warn_connection_count,
                    latency_ms: config.warn_latency_ms,
                },
                config.monitor_interval(),
                token.clone(),
            )),
        ];

        let pool = self.state.pool.clone();
        let dispatcher = self.state.dispatcher.clone();
        let serve_token = token.clone();
        let mut serve_task = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "server error");
            }
        });

        let handle = tokio::spawn(async move {
            tokio::select! {
                // The accept loop ended on its own (serve error).
                _ = &mut serve_task => {}
                () = token.cancelled() => {
                    // Close every live connection with a defined code/reason
                    // so in-flight sessions drain, then wait for the accept
                    // loop to finish its graceful shutdown.
                    for conn in pool.all() {
                        conn.close(CLOSE_GOING_AWAY, "server shutting down");
                        let _ = pool.remove(&conn.id);
                    }
                    let _ = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, serve_task).await;
                }
            }
            dispatcher.stop();
            let _ = futures::future::join_all(background).await;
            info!("gateway shut down");
        });

        info!(%addr, "pulse gateway listening");
        Ok((addr, handle))
    }
}

// ── HTTP handlers ────────────────────────────────────────────────────

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.pool.active_connections();
    let resp = health::health_check(state.start_time, connections, state.avg_send_latency_ms());
    Json(resp)
}

/// Body of GET /stats.
#[derive(Debug, Serialize)]
struct StatsResponse {
    uptime_secs: u64,
    pool: PoolStats,
    dispatcher: DispatcherStats,
    handlers: std::collections::HashMap<String, HandlerMetricsSnapshot>,
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        uptime_secs: state.start_time.elapsed().as_secs(),
        pool: state.pool.stats(),
        dispatcher: state.dispatcher.stats(),
        handlers: state.dispatcher.registry().metrics_snapshot(),
    })
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Body of POST /broadcast.
#[derive(Debug, Deserialize)]
struct BroadcastBody {
    /// Message type for the outgoing envelope.
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    room: Option<String>,
}

/// Delivery count returned by the fan-out endpoints.
#[derive(Debug, Serialize)]
struct DeliveryResponse {
    delivered: usize,
}

/// POST /broadcast — inject a message for fan-out.
async fn broadcast_handler(
    State(state): State<AppState>,
    Json(body): Json<BroadcastBody>,
) -> Json<DeliveryResponse> {
    let envelope = Envelope::new(body.event_type, body.payload);
    let delivered = state.broadcast(&envelope, body.room.as_deref());
    Json(DeliveryResponse { delivered })
}

/// Body of POST /emit/{event_type}.
#[derive(Debug, Deserialize)]
struct EmitBody {
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    room: Option<String>,
}

/// POST /emit/{event_type} — inject a typed event.
async fn emit_handler(
    State(state): State<AppState>,
    Path(event_type): Path<String>,
    Json(body): Json<EmitBody>,
) -> Json<DeliveryResponse> {
    let delivered = state.emit(&event_type, body.payload, body.room.as_deref()).await;
    Json(DeliveryResponse { delivered })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
