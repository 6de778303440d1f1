//! End-to-end integration tests using a real WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use pulse_proto::Envelope;
use pulse_server::config::GatewayConfig;
use pulse_server::server::GatewayServer;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Boot a test server and return its base address + shared handle.
async fn boot_server(config: GatewayConfig) -> (String, Arc<GatewayServer>) {
    let server = Arc::new(GatewayServer::new(config));
    let (addr, _handle) = server.listen().await.unwrap();
    (addr.to_string(), server)
}

async fn connect(addr: &str, client_id: &str) -> WsStream {
    let url = format!("ws://{addr}/ws?client_id={client_id}");
    let (ws, _) = timeout(TIMEOUT, connect_async(url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

async fn send_envelope(ws: &mut WsStream, envelope: &Envelope) {
    ws.send(Message::Text(envelope.to_json().unwrap().into()))
        .await
        .expect("send failed");
}

/// Receive the next text frame as an envelope, skipping transport pings.
async fn recv_envelope(ws: &mut WsStream) -> Envelope {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("receive timed out")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return Envelope::from_bytes(text.as_bytes()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert that no text frame arrives within a short window.
async fn assert_silent(ws: &mut WsStream) {
    let result = timeout(Duration::from_millis(200), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                other => return other,
            }
        }
    })
    .await;
    assert!(result.is_err(), "expected silence, got {result:?}");
}

#[tokio::test]
async fn connection_established_on_connect() {
    let (addr, _server) = boot_server(GatewayConfig::default()).await;
    let mut ws = connect(&addr, "itest_c1").await;

    let established = recv_envelope(&mut ws).await;
    assert_eq!(established.event_type, "connection.established");
    assert_eq!(established.payload["connectionId"], "itest_c1");
}

#[tokio::test]
async fn subscribe_then_emit_delivers_only_to_subscribers() {
    let (addr, server) = boot_server(GatewayConfig::default()).await;

    let mut subscriber = connect(&addr, "sub_1").await;
    let _ = recv_envelope(&mut subscriber).await; // connection.established
    let mut bystander = connect(&addr, "sub_2").await;
    let _ = recv_envelope(&mut bystander).await;

    let subscribe = Envelope::new("subscribe", json!({"eventTypes": ["sla.alert"]}));
    send_envelope(&mut subscriber, &subscribe).await;
    let confirmed = recv_envelope(&mut subscriber).await;
    assert_eq!(confirmed.event_type, "subscription.confirmed");
    assert_eq!(confirmed.correlation_id, subscribe.correlation_id);

    let delivered = server
        .emit("sla.alert", json!({"severity": "high"}), None)
        .await;
    assert_eq!(delivered, 1);

    let alert = recv_envelope(&mut subscriber).await;
    assert_eq!(alert.event_type, "sla.alert");
    assert_eq!(alert.payload["severity"], "high");

    assert_silent(&mut bystander).await;
}

#[tokio::test]
async fn room_scoped_emit_requires_membership_and_subscription() {
    let (addr, server) = boot_server(GatewayConfig::default()).await;

    // In the room and subscribed — the only one who should receive.
    let mut member_sub = connect(&addr, "room_c1").await;
    let _ = recv_envelope(&mut member_sub).await;
    send_envelope(
        &mut member_sub,
        &Envelope::new("subscribe", json!({"eventTypes": ["sla.alert"]})),
    )
    .await;
    let _ = recv_envelope(&mut member_sub).await;
    send_envelope(
        &mut member_sub,
        &Envelope::new("join_room", json!({"rooms": ["ops"]})),
    )
    .await;
    let joined = recv_envelope(&mut member_sub).await;
    assert_eq!(joined.event_type, "room.joined");
    assert_eq!(joined.payload["joinedRooms"][0], "ops");

    // In the room, not subscribed.
    let mut member_only = connect(&addr, "room_c2").await;
    let _ = recv_envelope(&mut member_only).await;
    send_envelope(
        &mut member_only,
        &Envelope::new("join_room", json!({"rooms": ["ops"]})),
    )
    .await;
    let _ = recv_envelope(&mut member_only).await;

    // Subscribed, not in the room.
    let mut sub_only = connect(&addr, "room_c3").await;
    let _ = recv_envelope(&mut sub_only).await;
    send_envelope(
        &mut sub_only,
        &Envelope::new("subscribe", json!({"eventTypes": ["sla.alert"]})),
    )
    .await;
    let _ = recv_envelope(&mut sub_only).await;

    let delivered = server
        .emit("sla.alert", json!({"severity": "high"}), Some("ops"))
        .await;
    assert_eq!(delivered, 1);

    let alert = recv_envelope(&mut member_sub).await;
    assert_eq!(alert.event_type, "sla.alert");
    assert_silent(&mut member_only).await;
    assert_silent(&mut sub_only).await;
}

#[tokio::test]
async fn malformed_frame_gets_error_and_connection_survives() {
    let (addr, _server) = boot_server(GatewayConfig::default()).await;
    let mut ws = connect(&addr, "bad_c1").await;
    let _ = recv_envelope(&mut ws).await;

    ws.send(Message::Text("{ not json".to_owned().into()))
        .await
        .unwrap();

    let error = recv_envelope(&mut ws).await;
    assert_eq!(error.event_type, "error");
    assert_eq!(error.payload["errorCode"], "INVALID_MESSAGE");

    // Still connected: an application ping is answered.
    send_envelope(&mut ws, &Envelope::new("ping", json!({}))).await;
    let pong = recv_envelope(&mut ws).await;
    assert_eq!(pong.event_type, "pong");
}

#[tokio::test]
async fn connection_limit_refuses_excess_handshakes() {
    let config = GatewayConfig {
        max_connections: 1,
        ..GatewayConfig::default()
    };
    let (addr, _server) = boot_server(config).await;

    let mut first = connect(&addr, "cap_c1").await;
    let _ = recv_envelope(&mut first).await;

    let mut second = connect(&addr, "cap_c2").await;
    let refusal = recv_envelope(&mut second).await;
    assert_eq!(refusal.event_type, "error");
    assert_eq!(refusal.payload["errorCode"], "CONNECTION_LIMIT_EXCEEDED");

    // The refused socket is closed by the server.
    let next = timeout(TIMEOUT, second.next()).await.expect("timed out");
    assert!(matches!(next, Some(Ok(Message::Close(_))) | None));

    // The existing connection is unaffected.
    send_envelope(&mut first, &Envelope::new("ping", json!({}))).await;
    assert_eq!(recv_envelope(&mut first).await.event_type, "pong");
}

#[tokio::test]
async fn http_health_and_stats_reflect_connections() {
    let (addr, _server) = boot_server(GatewayConfig::default()).await;
    let mut ws = connect(&addr, "http_c1").await;
    let _ = recv_envelope(&mut ws).await;

    let health: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 1);

    let stats: Value = reqwest::get(format!("http://{addr}/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["pool"]["active_connections"], 1);
    assert_eq!(stats["pool"]["total_accepted"], 1);
}

#[tokio::test]
async fn broadcast_endpoint_reaches_connected_client() {
    let (addr, _server) = boot_server(GatewayConfig::default()).await;
    let mut ws = connect(&addr, "bcast_c1").await;
    let _ = recv_envelope(&mut ws).await;

    let response: Value = reqwest::Client::new()
        .post(format!("http://{addr}/broadcast"))
        .json(&json!({"type": "announce", "payload": {"msg": "maintenance at noon"}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["delivered"], 1);

    let announce = recv_envelope(&mut ws).await;
    assert_eq!(announce.event_type, "announce");
    assert_eq!(announce.payload["msg"], "maintenance at noon");
}

#[tokio::test]
async fn emit_endpoint_honors_subscription_filters() {
    let (addr, _server) = boot_server(GatewayConfig::default()).await;
    let mut ws = connect(&addr, "filter_c1").await;
    let _ = recv_envelope(&mut ws).await;

    send_envelope(
        &mut ws,
        &Envelope::new(
            "subscribe",
            json!({
                "eventTypes": ["forecast.updated"],
                "filters": {"forecast.updated": {"region": "east"}}
            }),
        ),
    )
    .await;
    let _ = recv_envelope(&mut ws).await;

    let client = reqwest::Client::new();
    let west: Value = client
        .post(format!("http://{addr}/emit/forecast.updated"))
        .json(&json!({"payload": {"region": "west"}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(west["delivered"], 0);

    let east: Value = client
        .post(format!("http://{addr}/emit/forecast.updated"))
        .json(&json!({"payload": {"region": "east"}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(east["delivered"], 1);

    let update = recv_envelope(&mut ws).await;
    assert_eq!(update.event_type, "forecast.updated");
    assert_eq!(update.payload["region"], "east");
}

#[tokio::test]
async fn shutdown_closes_clients() {
    let (addr, server) = boot_server(GatewayConfig::default()).await;
    let mut ws = connect(&addr, "down_c1").await;
    let _ = recv_envelope(&mut ws).await;

    server.shutdown().shutdown();

    // The client observes a close frame (or the stream ending) promptly.
    let outcome = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "client was not closed on shutdown");
}
