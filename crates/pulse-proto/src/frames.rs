//! Server→client frame constructors and wire error codes.

use serde_json::{Value, json};

use crate::envelope::Envelope;

/// The client sent a frame the gateway could not decode.
pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
/// The client exceeded its per-connection message rate.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
/// The gateway is at its connection cap; the handshake was refused.
pub const CONNECTION_LIMIT_EXCEEDED: &str = "CONNECTION_LIMIT_EXCEEDED";
/// Advisory: the gateway is above a load threshold.
pub const SERVER_OVERLOAD: &str = "SERVER_OVERLOAD";

/// First frame on every accepted connection.
pub fn connection_established(connection_id: &str) -> Envelope {
    Envelope::new(
        "connection.established",
        json!({ "connectionId": connection_id }),
    )
}

/// Acknowledge a subscribe request.
pub fn subscription_confirmed(subscribed: &[String]) -> Envelope {
    Envelope::new(
        "subscription.confirmed",
        json!({ "subscribedEvents": subscribed }),
    )
}

/// Acknowledge an unsubscribe request.
pub fn unsubscription_confirmed(unsubscribed: &[String]) -> Envelope {
    Envelope::new(
        "unsubscription.confirmed",
        json!({ "unsubscribedEvents": unsubscribed }),
    )
}

/// Acknowledge a room join.
pub fn room_joined(rooms: &[String]) -> Envelope {
    Envelope::new("room.joined", json!({ "joinedRooms": rooms }))
}

/// Acknowledge a room leave.
pub fn room_left(rooms: &[String]) -> Envelope {
    Envelope::new("room.left", json!({ "leftRooms": rooms }))
}

/// Application-level pong, answering a client `ping` frame.
pub fn pong() -> Envelope {
    Envelope::new("pong", Value::Null)
}

/// Structured error frame. The connection stays open.
pub fn error(code: &str, message: &str, details: Option<Value>) -> Envelope {
    Envelope::new(
        "error",
        json!({
            "errorCode": code,
            "errorMessage": message,
            "details": details.unwrap_or(Value::Null),
        }),
    )
}

/// Combine queued messages into one batch frame.
pub fn batch(messages: &[Envelope]) -> Envelope {
    Envelope::new(
        "batch",
        json!({
            "messages": messages,
            "batchSize": messages.len(),
        }),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connection_established_carries_id() {
        let frame = connection_established("conn_42");
        assert_eq!(frame.event_type, "connection.established");
        assert_eq!(frame.payload["connectionId"], "conn_42");
    }

    #[test]
    fn subscription_confirmed_lists_events() {
        let frame = subscription_confirmed(&["sla.alert".into(), "forecast.updated".into()]);
        assert_eq!(frame.event_type, "subscription.confirmed");
        assert_eq!(frame.payload["subscribedEvents"][0], "sla.alert");
        assert_eq!(frame.payload["subscribedEvents"][1], "forecast.updated");
    }

    #[test]
    fn room_frames_list_rooms() {
        let joined = room_joined(&["ops".into()]);
        assert_eq!(joined.event_type, "room.joined");
        assert_eq!(joined.payload["joinedRooms"][0], "ops");

        let left = room_left(&["ops".into()]);
        assert_eq!(left.event_type, "room.left");
        assert_eq!(left.payload["leftRooms"][0], "ops");
    }

    #[test]
    fn error_frame_shape() {
        let frame = error(INVALID_MESSAGE, "could not decode frame", Some(json!({"offset": 3})));
        assert_eq!(frame.event_type, "error");
        assert_eq!(frame.payload["errorCode"], "INVALID_MESSAGE");
        assert_eq!(frame.payload["errorMessage"], "could not decode frame");
        assert_eq!(frame.payload["details"]["offset"], 3);
    }

    #[test]
    fn error_frame_without_details() {
        let frame = error(SERVER_OVERLOAD, "load threshold breached", None);
        assert_eq!(frame.payload["details"], Value::Null);
    }

    #[test]
    fn batch_carries_messages_and_size() {
        let messages = vec![
            Envelope::new("sla.alert", json!({"n": 1})),
            Envelope::new("sla.alert", json!({"n": 2})),
        ];
        let frame = batch(&messages);
        assert_eq!(frame.event_type, "batch");
        assert_eq!(frame.payload["batchSize"], 2);
        assert_eq!(frame.payload["messages"][0]["payload"]["n"], 1);
        assert_eq!(frame.payload["messages"][1]["payload"]["n"], 2);
    }

    #[test]
    fn batch_of_none_is_empty() {
        let frame = batch(&[]);
        assert_eq!(frame.payload["batchSize"], 0);
    }

    #[test]
    fn error_codes_are_screaming_snake() {
        for code in [
            INVALID_MESSAGE,
            RATE_LIMIT_EXCEEDED,
            CONNECTION_LIMIT_EXCEEDED,
            SERVER_OVERLOAD,
        ] {
            assert!(
                code.chars().all(|c| c.is_ascii_uppercase() || c == '_'),
                "error code '{code}' must be SCREAMING_SNAKE_CASE"
            );
        }
    }
}
