//! # pulse-broker
//!
//! The core of the Pulse gateway:
//!
//! - [`Connection`] — per-client send handle with rate limiting, batching,
//!   and subscription/room bookkeeping
//! - [`ConnectionPool`] — single source of truth for who is connected, in
//!   which rooms, subscribed to what
//! - [`dispatcher`] — priority-ordered event dispatch with per-handler
//!   isolation and metrics
//!
//! The broker is transport-agnostic: connections hold the sending half of a
//! bounded channel whose receiving half is drained by a socket writer task
//! owned by `pulse-server`.

#![deny(unsafe_code)]

pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod rate_limit;

pub use connection::{Connection, OutboundFrame};
pub use dispatcher::{EventDispatcher, EventHandler, HandlerRegistration, HandlerRegistry};
pub use error::{BrokerError, Result};
pub use pool::ConnectionPool;
pub use rate_limit::TokenBucket;
