//! The message envelope every wire frame travels in.
//!
//! Matches the JSON wire format consumed by the web dashboard and the mobile
//! clients:
//! ```json
//! { "type": "sla.alert", "payload": {...}, "metadata": {...},
//!   "timestamp": "2026-...", "correlationId": "..." }
//! ```
//!
//! Envelopes are immutable once constructed. The `correlationId` ties a
//! request to its response across async boundaries; clients may omit it (and
//! the timestamp), in which case decoding fills them in.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtoError, Result};

/// Immutable message envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Message type (e.g. `forecast.updated`, `subscribe`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Structured payload — shape varies by message type.
    #[serde(default)]
    pub payload: Value,
    /// Transport metadata, omitted from the wire when empty.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// RFC-3339 timestamp, generated when the sender omitted it.
    #[serde(default = "now_rfc3339")]
    pub timestamp: String,
    /// Correlation ID, generated when the sender omitted it.
    #[serde(default = "new_correlation_id")]
    pub correlation_id: String,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn new_correlation_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

impl Envelope {
    /// Create an envelope with a fresh timestamp and correlation ID.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            metadata: Map::new(),
            timestamp: now_rfc3339(),
            correlation_id: new_correlation_id(),
        }
    }

    /// Attach metadata (builder style).
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Use a specific correlation ID (builder style).
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Build a response envelope sharing this envelope's correlation ID.
    pub fn reply(&self, event_type: impl Into<String>, payload: Value) -> Self {
        Self::new(event_type, payload).with_correlation_id(self.correlation_id.clone())
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Serialize to a JSON string for a text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an envelope from wire bytes.
    ///
    /// Fills in a missing `correlationId`/`timestamp`; rejects frames whose
    /// `type` is absent, empty, or not a string (numeric timestamps are also
    /// rejected — the wire format is RFC-3339 strings only).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        if envelope.event_type.is_empty() {
            return Err(ProtoError::MissingType);
        }
        Ok(envelope)
    }

    /// Approximate encoded size in bytes, for transfer accounting.
    pub fn encoded_len(&self) -> usize {
        self.to_bytes().map(|b| b.len()).unwrap_or(0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn new_generates_timestamp_and_correlation_id() {
        let env = Envelope::new("sla.alert", json!({"severity": "high"}));
        assert_eq!(env.event_type, "sla.alert");
        assert!(!env.timestamp.is_empty());
        assert!(env.timestamp.contains('T'));
        assert!(!env.correlation_id.is_empty());
    }

    #[test]
    fn correlation_ids_are_unique() {
        let a = Envelope::new("a", Value::Null);
        let b = Envelope::new("a", Value::Null);
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn reply_shares_correlation_id() {
        let request = Envelope::new("subscribe", json!({"eventTypes": ["sla.alert"]}));
        let response = request.reply("subscription.confirmed", json!({}));
        assert_eq!(response.correlation_id, request.correlation_id);
        assert_eq!(response.event_type, "subscription.confirmed");
    }

    #[test]
    fn bytes_roundtrip() {
        let mut metadata = Map::new();
        let _ = metadata.insert("source".into(), json!("scheduler"));
        let env = Envelope::new("schedule.changed", json!({"scheduleId": "sch_1"}))
            .with_metadata(metadata);

        let bytes = env.to_bytes().unwrap();
        let back = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let env = Envelope::new("forecast.updated", json!({}));
        let value: Value = serde_json::to_value(&env).unwrap();
        assert!(value.get("type").is_some(), "should use 'type' not 'event_type'");
        assert!(value.get("correlationId").is_some());
        assert!(value.get("timestamp").is_some());
        assert!(value.get("payload").is_some());
    }

    #[test]
    fn empty_metadata_omitted_from_wire() {
        let env = Envelope::new("ping", Value::Null);
        let json = env.to_json().unwrap();
        assert!(!json.contains("metadata"));
    }

    #[test]
    fn decode_fills_missing_correlation_id_and_timestamp() {
        let bytes = br#"{"type":"agent.status.changed","payload":{"agentId":"a1"}}"#;
        let env = Envelope::from_bytes(bytes).unwrap();
        assert!(!env.correlation_id.is_empty());
        assert!(!env.timestamp.is_empty());
    }

    #[test]
    fn decode_rejects_missing_type() {
        let result = Envelope::from_bytes(br#"{"payload":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn decode_rejects_empty_type() {
        let result = Envelope::from_bytes(br#"{"type":"","payload":{}}"#);
        assert!(matches!(result, Err(ProtoError::MissingType)));
    }

    #[test]
    fn decode_rejects_numeric_timestamp() {
        let result =
            Envelope::from_bytes(br#"{"type":"ping","payload":{},"timestamp":1736899200}"#);
        assert!(result.is_err());
    }

    #[test]
    fn decode_rejects_non_json() {
        assert!(Envelope::from_bytes(b"not json at all").is_err());
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let env = Envelope::from_bytes(br#"{"type":"ping"}"#).unwrap();
        assert_eq!(env.payload, Value::Null);
    }

    #[test]
    fn encoded_len_is_positive() {
        let env = Envelope::new("ping", Value::Null);
        assert!(env.encoded_len() > 0);
    }

    proptest! {
        #[test]
        fn roundtrip_arbitrary_payload_shapes(
            event_type in "[a-z]{1,12}(\\.[a-z]{1,12}){0,2}",
            string_val in ".{0,64}",
            int_val in proptest::num::i64::ANY,
            flag in proptest::bool::ANY,
        ) {
            let env = Envelope::new(
                event_type,
                json!({ "s": string_val, "n": int_val, "flag": flag, "nested": { "xs": [1, 2, 3] } }),
            );
            let back = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(back, env);
        }
    }
}
