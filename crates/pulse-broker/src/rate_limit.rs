//! Per-connection token-bucket rate limiting.

use std::time::Instant;

use parking_lot::Mutex;

/// Token bucket refilled lazily from elapsed time.
///
/// Thread-safe (interior `Mutex`). One bucket guards each connection's
/// message rate; `try_acquire` never blocks.
pub struct TokenBucket {
    inner: Mutex<Inner>,
    capacity: f64,
    refill_per_sec: f64,
}

struct Inner {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket holding `capacity` tokens, refilled at
    /// `refill_per_sec` tokens per second. A full bucket is available
    /// immediately.
    pub fn new(capacity: usize, refill_per_sec: f64) -> Self {
        #[allow(clippy::cast_precision_loss)] // capacities are small (≤10⁶)
        let capacity = capacity as f64;
        Self {
            inner: Mutex::new(Inner {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_per_sec: refill_per_sec.max(0.0),
        }
    }

    fn refill(&self, inner: &mut Inner) {
        let elapsed = inner.last_refill.elapsed().as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        inner.last_refill = Instant::now();
    }

    /// Consume one token. Returns `false` when the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, for diagnostics.
    pub fn available(&self) -> f64 {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        inner.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_bucket_on_creation() {
        let bucket = TokenBucket::new(5, 1.0);
        assert!((bucket.available() - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn exactly_one_over_capacity_fails() {
        // No refill: capacity+1 acquires within one interval → exactly one failure
        let bucket = TokenBucket::new(5, 0.0);
        let outcomes: Vec<bool> = (0..6).map(|_| bucket.try_acquire()).collect();
        assert_eq!(outcomes.iter().filter(|&&ok| ok).count(), 5);
        assert!(!outcomes[5]);
    }

    #[test]
    fn acquire_drains_tokens() {
        let bucket = TokenBucket::new(3, 0.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!((bucket.available() - 1.0).abs() < 0.01);
    }

    #[test]
    fn refill_restores_tokens() {
        let bucket = TokenBucket::new(2, 1000.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        std::thread::sleep(std::time::Duration::from_millis(10));
        // 1000 tokens/sec × 10ms ≥ 1 token
        assert!(bucket.try_acquire());
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let bucket = TokenBucket::new(2, 1000.0);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(bucket.available() <= 2.0);
    }

    #[test]
    fn zero_capacity_always_fails() {
        let bucket = TokenBucket::new(0, 10.0);
        assert!(!bucket.try_acquire());
    }
}
