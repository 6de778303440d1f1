//! # pulse-proto
//!
//! Wire-format types for the Pulse gateway WebSocket protocol.
//!
//! - [`Envelope`] — the immutable message envelope every frame travels in
//! - [`ControlRequest`] — client→server control frames (subscribe, rooms, ping)
//! - [`frames`] — server→client frame constructors and wire error codes
//!
//! The wire format is JSON with camelCase field names; `Envelope::to_bytes`
//! and `Envelope::from_bytes` are the (de)serialization surface used by the
//! transport layer.

#![deny(unsafe_code)]

pub mod control;
pub mod envelope;
pub mod error;
pub mod frames;

pub use control::ControlRequest;
pub use envelope::Envelope;
pub use error::{ProtoError, Result};
