//! Continuous-refill token bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tokens stay within `[0, capacity]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: f64, refill_per_sec: f64, now: DateTime<Utc>) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: refill_per_sec.max(0.0),
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Credit tokens for the time elapsed since the last refill. A clock that
    /// goes backwards credits nothing.
    pub fn refill(&mut self, now: DateTime<Utc>) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = (now - self.last_refill).num_milliseconds() as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Refill, then take `cost` tokens if that many are available.
    pub fn try_consume(&mut self, cost: f64, now: DateTime<Utc>) -> bool {
        self.refill(now);
        if cost < 0.0 || self.tokens < cost {
            return false;
        }
        self.tokens = (self.tokens - cost).max(0.0);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    #[test]
    fn consumes_and_refills() {
        let t0 = Utc::now();
        let mut bucket = TokenBucket::new(4.0, 1.0, t0);
        assert!(bucket.try_consume(4.0, t0));
        assert!(!bucket.try_consume(1.0, t0));
        assert!(bucket.try_consume(1.0, t0 + Duration::seconds(1)));
        bucket.refill(t0 + Duration::hours(1));
        assert_eq!(bucket.tokens(), 4.0);
    }

    proptest! {
        #[test]
        fn tokens_stay_within_bounds(
            capacity in 0.0f64..50.0,
            rate in 0.0f64..10.0,
            ops in proptest::collection::vec((0.0f64..8.0, 0i64..5_000), 0..64),
        ) {
            let t0 = Utc::now();
            let mut bucket = TokenBucket::new(capacity, rate, t0);
            let mut now = t0;
            for (cost, advance_ms) in ops {
                now += Duration::milliseconds(advance_ms);
                bucket.try_consume(cost, now);
                prop_assert!(bucket.tokens() >= 0.0);
                prop_assert!(bucket.tokens() <= bucket.capacity());
            }
        }
    }
}
