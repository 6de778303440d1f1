//! Rolling-window averages and per-connection counters.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Fixed-size ring buffer of samples with a rolling mean.
pub struct RollingAverage {
    samples: Vec<f64>,
    cursor: usize,
    total: usize,
}

impl RollingAverage {
    /// Create a window holding `size` samples (clamped to at least 1).
    pub fn new(size: usize) -> Self {
        Self {
            samples: vec![0.0; size.max(1)],
            cursor: 0,
            total: 0,
        }
    }

    /// Record one sample, evicting the oldest when the window is full.
    pub fn record(&mut self, sample: f64) {
        self.samples[self.cursor] = sample;
        self.cursor = (self.cursor + 1) % self.samples.len();
        self.total += 1;
    }

    /// Mean of the samples currently in the window (0.0 when empty).
    #[allow(clippy::cast_precision_loss)] // window sizes are tiny
    pub fn average(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let count = self.samples.len().min(self.total);
        self.samples[..count].iter().sum::<f64>() / count as f64
    }

    /// Number of samples recorded over the window's lifetime.
    pub fn count(&self) -> usize {
        self.total
    }
}

/// Default window size for per-connection latency tracking.
const LATENCY_WINDOW: usize = 50;

/// Per-connection transfer counters.
///
/// All counters are atomics; the latency window sits behind an interior
/// mutex and is only touched by the connection's writer task.
pub struct ConnectionMetrics {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    messages_dropped: AtomicU64,
    send_latency_ms: Mutex<RollingAverage>,
}

impl ConnectionMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            send_latency_ms: Mutex::new(RollingAverage::new(LATENCY_WINDOW)),
        }
    }

    /// Record one outbound message of `bytes` length.
    pub fn record_sent(&self, bytes: usize) {
        let _ = self.messages_sent.fetch_add(1, Ordering::Relaxed);
        let _ = self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record one inbound message of `bytes` length.
    pub fn record_received(&self, bytes: usize) {
        let _ = self.messages_received.fetch_add(1, Ordering::Relaxed);
        let _ = self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a message dropped due to a full or closed channel.
    pub fn record_dropped(&self) {
        let _ = self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the socket-write latency of one message.
    pub fn record_send_latency(&self, latency_ms: f64) {
        self.send_latency_ms.lock().record(latency_ms);
    }

    /// Messages dropped so far.
    pub fn dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    /// Rolling average send latency in milliseconds.
    pub fn avg_send_latency_ms(&self) -> f64 {
        self.send_latency_ms.lock().average()
    }

    /// Point-in-time snapshot for the stats endpoint.
    pub fn snapshot(&self) -> ConnectionMetricsSnapshot {
        ConnectionMetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            avg_send_latency_ms: self.avg_send_latency_ms(),
        }
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of [`ConnectionMetrics`].
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionMetricsSnapshot {
    /// Messages written to this connection.
    pub messages_sent: u64,
    /// Bytes written to this connection.
    pub bytes_sent: u64,
    /// Messages read from this connection.
    pub messages_received: u64,
    /// Bytes read from this connection.
    pub bytes_received: u64,
    /// Messages dropped due to a full or closed channel.
    pub messages_dropped: u64,
    /// Rolling average socket-write latency.
    pub avg_send_latency_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_averages_zero() {
        let window = RollingAverage::new(10);
        assert!((window.average() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn average_of_partial_window() {
        let mut window = RollingAverage::new(10);
        window.record(2.0);
        window.record(4.0);
        assert!((window.average() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn full_window_evicts_oldest() {
        let mut window = RollingAverage::new(2);
        window.record(100.0);
        window.record(10.0);
        window.record(20.0); // evicts 100.0
        assert!((window.average() - 15.0).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_size_clamped_to_one() {
        let mut window = RollingAverage::new(0);
        window.record(7.0);
        assert!((window.average() - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn counters_accumulate() {
        let metrics = ConnectionMetrics::new();
        metrics.record_sent(100);
        metrics.record_sent(50);
        metrics.record_received(30);
        metrics.record_dropped();

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.bytes_received, 30);
        assert_eq!(snap.messages_dropped, 1);
    }

    #[test]
    fn latency_window_feeds_snapshot() {
        let metrics = ConnectionMetrics::new();
        metrics.record_send_latency(10.0);
        metrics.record_send_latency(20.0);
        let snap = metrics.snapshot();
        assert!((snap.avg_send_latency_ms - 15.0).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_serializes() {
        let metrics = ConnectionMetrics::new();
        metrics.record_sent(10);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["messages_sent"], 1);
        assert_eq!(json["bytes_sent"], 10);
    }
}
