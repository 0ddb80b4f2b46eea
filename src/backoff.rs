//! Backoff schedules for retry and reconnect delays.

use std::time::Duration;

/// Default cap applied to growing schedules when none is configured.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
enum Schedule {
    /// `base · multiplier^(attempt-1)`
    Exponential { multiplier: f64 },
    /// `base · attempt`
    Linear,
    /// `base`
    Fixed,
    /// `base · fib(attempt)` with fib(1)=1, fib(2)=2
    Fibonacci,
}

/// Delay schedule over 1-indexed attempts, capped at a maximum delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    schedule: Schedule,
    base: Duration,
    max: Duration,
}

impl Backoff {
    /// Exponential growth by `multiplier` per attempt.
    pub fn exponential(base: Duration, multiplier: f64) -> Self {
        Self { schedule: Schedule::Exponential { multiplier }, base, max: MAX_BACKOFF }
    }

    /// Linear growth: attempt `a` waits `base · a`.
    pub fn linear(base: Duration) -> Self {
        Self { schedule: Schedule::Linear, base, max: MAX_BACKOFF }
    }

    /// Constant delay between attempts.
    pub fn fixed(base: Duration) -> Self {
        Self { schedule: Schedule::Fixed, base, max: MAX_BACKOFF }
    }

    /// Fibonacci growth: attempt `a` waits `base · fib(a)`.
    pub fn fibonacci(base: Duration) -> Self {
        Self { schedule: Schedule::Fibonacci, base, max: MAX_BACKOFF }
    }

    /// Cap every computed delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay to sleep after attempt `attempt` (1-indexed) fails.
    ///
    /// Computed in floating-point milliseconds and saturated at the cap, so
    /// large attempt numbers never overflow.
    pub fn delay(&self, attempt: usize) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        let factor = match self.schedule {
            Schedule::Exponential { multiplier } => multiplier.powi((attempt - 1) as i32),
            Schedule::Linear => attempt as f64,
            Schedule::Fixed => 1.0,
            Schedule::Fibonacci => fib(attempt) as f64,
        };
        let millis = (base_ms * factor).min(max_ms);
        if !millis.is_finite() || millis <= 0.0 {
            return if matches!(self.schedule, Schedule::Fixed) { self.base } else { self.max };
        }
        Duration::from_millis(millis as u64)
    }
}

/// fib(1)=1, fib(2)=2, fib(n)=fib(n-1)+fib(n-2), saturating.
fn fib(n: usize) -> u64 {
    let (mut prev, mut curr) = (1u64, 1u64);
    for _ in 1..n {
        let next = prev.saturating_add(curr);
        prev = curr;
        curr = next;
    }
    curr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_returns_same_delay() {
        let backoff = Backoff::fixed(Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(7), Duration::from_secs(1));
    }

    #[test]
    fn linear_grows_with_attempt() {
        let backoff = Backoff::linear(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(5), Duration::from_millis(500));
    }

    #[test]
    fn exponential_doubles_with_multiplier_two() {
        let backoff = Backoff::exponential(Duration::from_millis(100), 2.0);
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_respects_cap() {
        let backoff = Backoff::exponential(Duration::from_millis(100), 2.0)
            .with_max(Duration::from_secs(1));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(50), Duration::from_secs(1));
    }

    #[test]
    fn fibonacci_sequence_starts_one_two() {
        let backoff =
            Backoff::fibonacci(Duration::from_millis(100)).with_max(Duration::from_secs(60));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(300));
        assert_eq!(backoff.delay(4), Duration::from_millis(500));
        assert_eq!(backoff.delay(5), Duration::from_millis(800));
    }

    #[test]
    fn huge_attempts_saturate_instead_of_overflowing() {
        let backoff = Backoff::exponential(Duration::from_secs(1), 2.0)
            .with_max(Duration::from_secs(120));
        assert_eq!(backoff.delay(500), Duration::from_secs(120));

        let backoff = Backoff::fibonacci(Duration::from_secs(1)).with_max(Duration::from_secs(90));
        assert_eq!(backoff.delay(300), Duration::from_secs(90));
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        let backoff = Backoff::linear(Duration::from_millis(100));
        assert_eq!(backoff.delay(0), backoff.delay(1));
    }
}
