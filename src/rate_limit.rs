//! Per-endpoint token-bucket admission control.
//!
//! Tokens are fractional and refill smoothly: a bucket configured at
//! `requests_per_second` credits `elapsed_ms × rps / 1000` tokens on each
//! query, capped at the burst capacity. No background timer exists; refill
//! is computed lazily whenever the bucket is consulted.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::error::RpcError;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_millis: u64,
}

/// Token bucket shaping request admission at a single endpoint.
#[derive(Debug)]
pub struct TokenBucket {
    requests_per_second: f64,
    burst: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a bucket refilling at `requests_per_second` with `burst`
    /// maximum instantaneous capacity. The bucket starts full.
    pub fn new(requests_per_second: f64, burst: u32) -> Result<Self, RpcError> {
        if requests_per_second <= 0.0 || !requests_per_second.is_finite() {
            return Err(RpcError::validation(format!(
                "requests_per_second must be positive, got {}",
                requests_per_second
            )));
        }
        if burst == 0 {
            return Err(RpcError::validation("burst capacity must be >= 1"));
        }
        Ok(Self {
            requests_per_second,
            burst: f64::from(burst),
            state: Mutex::new(BucketState { tokens: f64::from(burst), last_refill_millis: 0 }),
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now_millis();
        let elapsed = now.saturating_sub(state.last_refill_millis);
        if elapsed > 0 {
            let credit = elapsed as f64 * self.requests_per_second / 1_000.0;
            state.tokens = (state.tokens + credit).min(self.burst);
        }
        state.last_refill_millis = now;
    }

    /// Attempt to take one token. Returns `true` when the request is
    /// admitted.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token becomes available; zero when one already
    /// is.
    pub fn wait_time(&self) -> Duration {
        let mut state = self.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let deficit = 1.0 - state.tokens;
        let millis = (deficit / self.requests_per_second * 1_000.0).ceil() as u64;
        Duration::from_millis(millis)
    }

    /// Restore the bucket to full burst capacity.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.tokens = self.burst;
        state.last_refill_millis = self.clock.now_millis();
    }

    /// Tokens currently available (after lazy refill).
    pub fn available(&self) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state);
        state.tokens
    }

    pub fn requests_per_second(&self) -> f64 {
        self.requests_per_second
    }

    pub fn burst(&self) -> u32 {
        self.burst as u32
    }
}
