//! # pulse-server
//!
//! Axum HTTP + `WebSocket` server for the Pulse gateway.
//!
//! - HTTP surface: `/health`, `/stats`, `/metrics`, `/broadcast`,
//!   `/emit/{event_type}`
//! - `WebSocket` gateway: connection lifecycle, control-frame routing,
//!   heartbeat, batched fan-out
//! - Background loops: heartbeat sweep, stale-connection cleanup, advisory
//!   load monitoring
//! - Graceful shutdown via `tokio::signal` + `CancellationToken`

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod health;
pub mod heartbeat;
pub mod metrics;
pub mod monitor;
pub mod server;
pub mod session;
pub mod shutdown;
