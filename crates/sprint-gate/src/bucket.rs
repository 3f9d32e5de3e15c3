//! Per-tenant token bucket.

use parking_lot::Mutex;
use std::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Classic token bucket: capacity = burst, refill = rps.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rps: f64,
    capacity: f64,
}

impl TokenBucket {
    pub fn new(rps: u32, burst: u32) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            state: Mutex::new(BucketState { tokens: capacity, last_refill: Instant::now() }),
            rps: rps.max(1) as f64,
            capacity,
        }
    }

    /// Take one token, or report how long until one is available.
    pub fn try_acquire(&self, now: Instant) -> Result<(), u64> {
        let mut state = self.state.lock();

        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rps).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            let retry_after_ms = ((deficit / self.rps) * 1000.0).ceil() as u64;
            Err(retry_after_ms)
        }
    }

    /// Tokens currently available (diagnostic).
    pub fn available(&self, now: Instant) -> f64 {
        let state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        (state.tokens + elapsed * self.rps).min(self.capacity)
    }
}
