//! Error types for wire-format decoding.

use thiserror::Error;

/// Errors produced while decoding or constructing wire frames.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// JSON encoding/decoding failed.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame has no `type` field, or it is empty.
    #[error("frame is missing a message type")]
    MissingType,

    /// A control frame carried a payload that does not match its type.
    #[error("invalid {frame_type} payload: {reason}")]
    InvalidControlPayload {
        /// The control frame type being parsed.
        frame_type: &'static str,
        /// What was wrong with the payload.
        reason: String,
    },
}

/// Convenience alias for proto results.
pub type Result<T> = std::result::Result<T, ProtoError>;
