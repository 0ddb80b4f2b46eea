//! Jitter for retry delays, to keep clients from retrying in lockstep.

use rand::Rng;
use std::time::Duration;

/// Perturbation applied to a computed backoff delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Use the exact backoff delay.
    None,
    /// Add a uniform perturbation of ±`fraction` of the delay, clamped at
    /// zero.
    Proportional { fraction: f64 },
}

impl Jitter {
    /// The default ±10% perturbation.
    pub fn proportional() -> Self {
        Jitter::Proportional { fraction: 0.1 }
    }

    /// Apply jitter using the thread RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-supplied RNG (for deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Proportional { fraction } => {
                let millis = delay.as_millis() as f64;
                let span = millis * fraction.abs();
                if span < 1.0 {
                    return delay;
                }
                let offset: f64 = rng.random_range(-span..=span);
                let jittered = (millis + offset).max(0.0);
                Duration::from_millis(jittered as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_returns_exact_delay() {
        assert_eq!(Jitter::None.apply(Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn proportional_stays_within_ten_percent() {
        let jitter = Jitter::proportional();
        let delay = Duration::from_millis(1_000);
        for _ in 0..200 {
            let jittered = jitter.apply(delay);
            assert!(jittered >= Duration::from_millis(900), "{:?}", jittered);
            assert!(jittered <= Duration::from_millis(1_100), "{:?}", jittered);
        }
    }

    #[test]
    fn deterministic_with_seeded_rng() {
        let jitter = Jitter::proportional();
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let delay = Duration::from_millis(2_000);
        assert_eq!(jitter.apply_with_rng(delay, &mut a), jitter.apply_with_rng(delay, &mut b));
    }

    #[test]
    fn tiny_delays_pass_through() {
        let jitter = Jitter::proportional();
        assert_eq!(jitter.apply(Duration::ZERO), Duration::ZERO);
        assert_eq!(jitter.apply(Duration::from_millis(5)), Duration::from_millis(5));
    }

    #[test]
    fn never_negative() {
        let jitter = Jitter::Proportional { fraction: 2.0 };
        for _ in 0..100 {
            // A huge fraction can push below zero; the clamp holds.
            let _ = jitter.apply(Duration::from_millis(100));
        }
    }
}
