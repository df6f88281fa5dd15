// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! Token bucket value object (spec.md §3, §8 universal invariants).

use std::time::{Duration, Instant};

/// A leaky-bucket variant: tokens accrue at a fixed rate up to `capacity`;
/// each admission consumes tokens.
///
/// `TokenBucket` itself holds no lock — callers (the rate limiter) own
/// synchronization. `refill` must be called before any acquisition
/// decision, per spec.md §3's invariant.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// `capacity` is clamped to at least 1.0.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        let capacity = capacity.max(1.0);
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Advances the current level by `min(capacity, level + elapsed*rate)`.
    /// Must be called before every acquisition decision.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Attempts to debit `n` tokens. Caller must have refilled first.
    /// Returns whether the debit succeeded.
    pub fn try_debit(&mut self, n: f64) -> bool {
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Milliseconds until `n` tokens would be available, given the current
    /// level (0 if already sufficient).
    pub fn wait_time_ms(&self, n: f64) -> f64 {
        if self.tokens >= n {
            0.0
        } else if self.refill_rate <= 0.0 {
            f64::INFINITY
        } else {
            (n - self.tokens) / self.refill_rate * 1000.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_of_ten_then_eleventh_denied() {
        // S1: rate 5, burst 10.
        let mut bucket = TokenBucket::new(10.0, 5.0);
        for _ in 0..10 {
            assert!(bucket.try_debit(1.0));
        }
        assert!(!bucket.try_debit(1.0));
    }

    #[test]
    fn tokens_never_exceed_capacity_after_refill() {
        let mut bucket = TokenBucket::new(5.0, 100.0);
        bucket.try_debit(5.0);
        bucket.refill(Instant::now() + Duration::from_secs(10));
        assert!(bucket.tokens() <= bucket.capacity());
        assert_eq!(bucket.tokens(), 5.0);
    }

    #[test]
    fn capacity_is_clamped_to_at_least_one() {
        let bucket = TokenBucket::new(0.0, 1.0);
        assert_eq!(bucket.capacity(), 1.0);
    }

    proptest::proptest! {
        #[test]
        fn tokens_stay_in_bounds(capacity in 1.0f64..1000.0, rate in 0.0f64..1000.0, millis in 0u64..5000) {
            let mut bucket = TokenBucket::new(capacity, rate);
            bucket.refill(Instant::now() + std::time::Duration::from_millis(millis));
            proptest::prop_assert!(bucket.tokens() >= 0.0);
            proptest::prop_assert!(bucket.tokens() <= bucket.capacity());
        }
    }
}
