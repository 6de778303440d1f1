//! Error types for the broker core.
//!
//! [`BrokerError`] is the primary error type returned by connection and pool
//! operations. Only pool-capacity and rate-limit errors are meant to reach
//! the original caller as an explicit signal; transport-level failures are
//! handled locally by removing the connection.

use thiserror::Error;

/// Errors that can occur in the broker core.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Operation attempted on a closed connection. The caller must drop its
    /// reference.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The connection's token bucket is empty. Transient; the caller may
    /// retry after backoff.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// The pool is at capacity. New handshakes are rejected; existing
    /// connections are unaffected.
    #[error("connection limit exceeded ({limit})")]
    ConnectionLimitExceeded {
        /// The configured pool capacity.
        limit: usize,
    },

    /// A bounded queue rejected the item instead of blocking the producer.
    #[error("queue is full")]
    QueueFull,

    /// Wire-format error from the proto layer.
    #[error(transparent)]
    Proto(#[from] pulse_proto::ProtoError),
}

/// Convenience alias for broker results.
pub type Result<T> = std::result::Result<T, BrokerError>;
