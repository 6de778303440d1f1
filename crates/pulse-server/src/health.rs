//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current WebSocket connection count.
    pub connections: usize,
    /// Rolling average socket-write latency across connections.
    pub avg_send_latency_ms: f64,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    connections: usize,
    avg_send_latency_ms: f64,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        avg_send_latency_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), 0, 0.0);
        assert_eq!(resp.status, "ok");
    }

    #[test]
    fn uptime_starts_at_zero() {
        let resp = health_check(Instant::now(), 0, 0.0);
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(start, 0, 0.0);
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn counters_tracked() {
        let resp = health_check(Instant::now(), 5, 12.5);
        assert_eq!(resp.connections, 5);
        assert!((resp.avg_send_latency_ms - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn serialization() {
        let resp = health_check(Instant::now(), 2, 1.0);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 2);
        assert!(json["uptime_secs"].is_number());
        assert!(json["avg_send_latency_ms"].is_number());
    }
}
