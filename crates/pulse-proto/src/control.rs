//! Client→server control frames.
//!
//! Control frames share the [`Envelope`] wire format; they are distinguished
//! by their `type` string. Every other type is a domain event and is routed
//! to the dispatcher instead.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::envelope::Envelope;
use crate::error::{ProtoError, Result};

/// `type` string for subscribe frames.
pub const TYPE_SUBSCRIBE: &str = "subscribe";
/// `type` string for unsubscribe frames.
pub const TYPE_UNSUBSCRIBE: &str = "unsubscribe";
/// `type` string for room-join frames.
pub const TYPE_JOIN_ROOM: &str = "join_room";
/// `type` string for room-leave frames.
pub const TYPE_LEAVE_ROOM: &str = "leave_room";
/// `type` string for application-level ping frames.
pub const TYPE_PING: &str = "ping";
/// `type` string for application-level pong frames.
pub const TYPE_PONG: &str = "pong";

/// A parsed control request.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlRequest {
    /// Opt in to one or more event types, with optional per-type payload
    /// filters (exact-match key/value requirements).
    Subscribe {
        /// Event types to subscribe to.
        event_types: Vec<String>,
        /// Optional filters keyed by event type.
        filters: HashMap<String, HashMap<String, Value>>,
    },
    /// Opt out of one or more event types.
    Unsubscribe {
        /// Event types to drop.
        event_types: Vec<String>,
    },
    /// Join one or more rooms.
    JoinRoom {
        /// Rooms to join.
        rooms: Vec<String>,
    },
    /// Leave one or more rooms.
    LeaveRoom {
        /// Rooms to leave.
        rooms: Vec<String>,
    },
    /// Application-level liveness probe.
    Ping,
    /// Application-level liveness response.
    Pong,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribePayload {
    event_types: Vec<String>,
    #[serde(default)]
    filters: HashMap<String, HashMap<String, Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomPayload {
    rooms: Vec<String>,
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    frame_type: &'static str,
    payload: &Value,
) -> Result<T> {
    serde_json::from_value(payload.clone()).map_err(|e| ProtoError::InvalidControlPayload {
        frame_type,
        reason: e.to_string(),
    })
}

impl ControlRequest {
    /// Parse a control request from an envelope.
    ///
    /// Returns `None` when the envelope's type is not a control type (i.e. it
    /// is a domain event); returns `Some(Err(_))` when the type is a control
    /// type but its payload is malformed.
    pub fn from_envelope(envelope: &Envelope) -> Option<Result<Self>> {
        match envelope.event_type.as_str() {
            TYPE_SUBSCRIBE => Some(
                parse_payload::<SubscribePayload>(TYPE_SUBSCRIBE, &envelope.payload).map(|p| {
                    Self::Subscribe {
                        event_types: p.event_types,
                        filters: p.filters,
                    }
                }),
            ),
            TYPE_UNSUBSCRIBE => Some(
                parse_payload::<SubscribePayload>(TYPE_UNSUBSCRIBE, &envelope.payload).map(|p| {
                    Self::Unsubscribe {
                        event_types: p.event_types,
                    }
                }),
            ),
            TYPE_JOIN_ROOM => Some(
                parse_payload::<RoomPayload>(TYPE_JOIN_ROOM, &envelope.payload)
                    .map(|p| Self::JoinRoom { rooms: p.rooms }),
            ),
            TYPE_LEAVE_ROOM => Some(
                parse_payload::<RoomPayload>(TYPE_LEAVE_ROOM, &envelope.payload)
                    .map(|p| Self::LeaveRoom { rooms: p.rooms }),
            ),
            TYPE_PING => Some(Ok(Self::Ping)),
            TYPE_PONG => Some(Ok(Self::Pong)),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
