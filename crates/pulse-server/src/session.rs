//! WebSocket session lifecycle — handles a single connected client from
//! upgrade through disconnect.
//!
//! The session loop intercepts transport Ping/Pong and application-level
//! `ping`/`pong` envelopes (they refresh liveness and are never surfaced),
//! applies control frames against the pool, and forwards every other type
//! to the dispatcher. Malformed frames get a structured `error` response;
//! the client stays connected.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use pulse_broker::connection::OutboundFrame;
use pulse_broker::{Connection, TokenBucket};
use pulse_proto::{ControlRequest, Envelope, frames};

use crate::server::AppState;

/// Close code for a handshake refused at the connection cap.
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Writes slower than this get a warning log.
const SLOW_SEND_THRESHOLD: Duration = Duration::from_millis(50);

/// Query parameters accepted at connection establishment.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Client-supplied connection ID (server-assigned when absent).
    pub client_id: Option<String>,
    /// Claimed user, recorded via the verifier.
    pub user_id: Option<String>,
    /// Opaque token handed to the authentication collaborator.
    pub token: Option<String>,
}

/// GET /ws — upgrade to a WebSocket session.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let max_message_size = state.config.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, state, query))
}

/// Run a WebSocket session for a connected client.
///
/// 1. Resolves identity through the verifier and registers the connection
///    (a pool at capacity refuses the handshake with a close frame)
/// 2. Sends `connection.established`
/// 3. Applies control frames against the pool, echoing confirmations
/// 4. Forwards domain events to the dispatcher
/// 5. Cleans up on disconnect
#[instrument(skip_all, fields(conn_id))]
pub async fn run_ws_session(ws: WebSocket, state: AppState, query: WsQuery) {
    let identity = state
        .verifier
        .verify(query.token.as_deref(), query.user_id.as_deref())
        .await;
    let connection_id = query
        .client_id
        .unwrap_or_else(|| format!("conn_{}", Uuid::now_v7()));
    let _ = tracing::Span::current().record("conn_id", connection_id.as_str());

    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) = mpsc::channel::<OutboundFrame>(state.config.outbound_channel_capacity);
    let bucket = TokenBucket::new(
        state.config.rate_limit_capacity,
        state.config.rate_limit_refill_per_sec,
    );
    let connection = Arc::new(
        Connection::new(connection_id.clone(), identity.user_id, send_tx, bucket)
            .with_permissions(identity.permissions),
    );

    if let Err(e) = state.pool.add(connection.clone()) {
        warn!(error = %e, "handshake refused");
        counter!("ws_handshakes_refused_total").increment(1);
        let frame = frames::error(
            frames::CONNECTION_LIMIT_EXCEEDED,
            "connection limit exceeded",
            None,
        );
        if let Ok(json) = frame.to_json() {
            let _ = ws_tx.send(Message::Text(json.into())).await;
        }
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_TRY_AGAIN_LATER,
                reason: "connection limit exceeded".into(),
            })))
            .await;
        return;
    }

    let _flusher = Connection::spawn_batch_flusher(connection.clone());

    let connection_start = Instant::now();
    info!("client connected");
    counter!("ws_connections_total").increment(1);
    gauge!("ws_connections_active").increment(1.0);

    if let Err(e) = connection.send(&frames::connection_established(&connection_id), false) {
        debug!(error = %e, "failed to enqueue connection.established");
    }

    // Writer task: drains the outbound channel onto the socket. The single
    // consumer is what guarantees per-connection FIFO.
    let writer_conn = connection.clone();
    let outbound = tokio::spawn(async move {
        while let Some(frame) = send_rx.recv().await {
            match frame {
                OutboundFrame::Text(text) => {
                    let start = Instant::now();
                    if ws_tx.send(Message::Text((*text).clone().into())).await.is_err() {
                        break;
                    }
                    let elapsed = start.elapsed();
                    writer_conn
                        .metrics()
                        .record_send_latency(elapsed.as_secs_f64() * 1000.0);
                    histogram!("ws_send_latency_seconds").record(elapsed.as_secs_f64());
                    if elapsed > SLOW_SEND_THRESHOLD {
                        warn!(
                            conn_id = %writer_conn.id,
                            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                            "slow send"
                        );
                    }
                }
                OutboundFrame::Ping => {
                    if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Read loop. Ends when the client disconnects or when any actor (the
    // heartbeat sweep, the cleanup sweep, server shutdown) closes the
    // connection.
    loop {
        let msg = tokio::select! {
            () = connection.closed() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(msg)) => msg,
                Some(Err(_)) | None => break,
            },
        };

        let text = match msg {
            Message::Text(ref t) => t.to_string(),
            Message::Binary(ref data) => match std::str::from_utf8(data) {
                Ok(s) => s.to_owned(),
                Err(_) => {
                    counter!("ws_frames_received_total", "kind" => "binary_invalid").increment(1);
                    let frame =
                        frames::error(frames::INVALID_MESSAGE, "non-UTF8 binary frame", None);
                    let _ = connection.send(&frame, false);
                    continue;
                }
            },
            Message::Ping(_) | Message::Pong(_) => {
                connection.mark_alive();
                continue;
            }
            Message::Close(_) => {
                info!("client sent close frame");
                break;
            }
        };

        connection.metrics().record_received(text.len());
        counter!("ws_frames_received_total", "kind" => "text").increment(1);
        handle_frame(&state, &connection, &text).await;
    }

    // Clean up.
    info!("client disconnected");
    counter!("ws_disconnections_total").increment(1);
    gauge!("ws_connections_active").decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(connection_start.elapsed().as_secs_f64());
    connection.close(1000, "session ended");
    let _ = state.pool.remove(&connection_id);
    // The close frame is already queued; give the writer a moment to flush
    // it before tearing the task down.
    let mut outbound = outbound;
    if tokio::time::timeout(Duration::from_millis(500), &mut outbound)
        .await
        .is_err()
    {
        outbound.abort();
    }
}

/// Decode one inbound frame and route it.
async fn handle_frame(state: &AppState, connection: &Arc<Connection>, text: &str) {
    let envelope = match Envelope::from_bytes(text.as_bytes()) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(conn_id = %connection.id, error = %e, "malformed frame");
            let frame = frames::error(frames::INVALID_MESSAGE, &e.to_string(), None);
            let _ = connection.send(&frame, false);
            return;
        }
    };

    match ControlRequest::from_envelope(&envelope) {
        Some(Ok(request)) => apply_control(state, connection, &envelope, request),
        Some(Err(e)) => {
            debug!(conn_id = %connection.id, error = %e, "invalid control payload");
            let frame = frames::error(frames::INVALID_MESSAGE, &e.to_string(), None);
            let _ = connection.send(&frame, false);
        }
        None => {
            // Domain event: hand to the dispatcher, never block the reader.
            let accepted = state
                .dispatcher
                .dispatch(&envelope.event_type, envelope.payload, false)
                .await;
            if !accepted {
                debug!(
                    conn_id = %connection.id,
                    event_type = envelope.event_type,
                    "dispatcher rejected event"
                );
            }
        }
    }
}

/// Apply a control request against the pool and echo a confirmation that
/// shares the request's correlation ID.
fn apply_control(
    state: &AppState,
    connection: &Arc<Connection>,
    envelope: &Envelope,
    request: ControlRequest,
) {
    let confirmation = match request {
        ControlRequest::Subscribe {
            event_types,
            filters,
        } => {
            for event_type in &event_types {
                let _ = state.pool.add_subscription(
                    &connection.id,
                    event_type,
                    filters.get(event_type).cloned(),
                );
            }
            Some(frames::subscription_confirmed(&event_types))
        }
        ControlRequest::Unsubscribe { event_types } => {
            for event_type in &event_types {
                let _ = state.pool.remove_subscription(&connection.id, event_type);
            }
            Some(frames::unsubscription_confirmed(&event_types))
        }
        ControlRequest::JoinRoom { rooms } => {
            for room in &rooms {
                let _ = state.pool.add_to_room(&connection.id, room);
            }
            Some(frames::room_joined(&rooms))
        }
        ControlRequest::LeaveRoom { rooms } => {
            for room in &rooms {
                let _ = state.pool.remove_from_room(&connection.id, room);
            }
            Some(frames::room_left(&rooms))
        }
        ControlRequest::Ping => {
            connection.mark_alive();
            Some(frames::pong())
        }
        ControlRequest::Pong => {
            connection.mark_alive();
            None
        }
    };

    if let Some(confirmation) = confirmation {
        let reply = confirmation.with_correlation_id(envelope.correlation_id.clone());
        if let Err(e) = connection.send(&reply, false) {
            debug!(conn_id = %connection.id, error = %e, "failed to send confirmation");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
