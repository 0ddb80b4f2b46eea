//! Cross-cutting behaviors of the resilience primitives, driven through
//! the public API with fake clocks and sleepers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use solrelay::mock::MockTransport;
use solrelay::prelude::*;
use solrelay::{Backoff, CircuitState, InstantSleeper, ManualClock, TrackingSleeper, TtlCache};

#[test]
fn cache_evicts_least_recently_used_first() {
    let mut cache = TtlCache::new(3, Duration::from_secs(3_600)).unwrap();
    cache.set("k1", "v1", None);
    cache.set("k2", "v2", None);
    cache.set("k3", "v3", None);

    assert_eq!(cache.get("k1"), Some(&"v1"));
    cache.set("k4", "v4", None);

    assert!(!cache.has("k2"));
    for key in ["k1", "k3", "k4"] {
        assert!(cache.has(key), "{} should survive", key);
    }
}

#[test]
fn cache_entries_expire_on_the_default_ttl() {
    let clock = ManualClock::new();
    let mut cache = TtlCache::new(16, Duration::from_millis(5_000))
        .unwrap()
        .with_clock(clock.clone());

    cache.set("k1", 1u8, None);
    clock.advance(6_000);

    assert!(!cache.has("k1"));
    assert_eq!(cache.get("k1"), None);
}

#[tokio::test]
async fn breaker_trips_rejects_and_recovers() {
    let clock = ManualClock::new();
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        recovery_timeout: Duration::from_millis(5_000),
        success_threshold: 2,
        operation_timeout: Duration::from_secs(10),
    })
    .unwrap()
    .with_clock(clock.clone());

    for _ in 0..3 {
        let _ = breaker
            .execute(|| async { Err::<(), _>(RpcError::network("boom", true)) })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // Rejected synchronously without running the operation.
    let ran = Arc::new(AtomicUsize::new(0));
    let counted = ran.clone();
    let err = breaker
        .execute(|| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RpcError>(())
            }
        })
        .await
        .unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    // Past the recovery deadline the probe runs; a second success closes.
    clock.advance(5_001);
    breaker.execute(|| async { Ok::<_, RpcError>(()) }).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    breaker.execute(|| async { Ok::<_, RpcError>(()) }).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn retry_waits_the_exponential_base_delay_before_the_second_attempt() {
    let sleeper = TrackingSleeper::new();
    let policy = RetryPolicy::builder()
        .max_attempts(3)
        .backoff(Backoff::exponential(Duration::from_millis(1_000), 2.0))
        .jitter(Jitter::None)
        .with_sleeper(sleeper.clone())
        .build();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = attempts.clone();
    let value = policy
        .execute(|| {
            let counted = counted.clone();
            async move {
                if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RpcError::timeout(1_001, 1_000))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(value, 7);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(sleeper.calls(), vec![Duration::from_millis(1_000)]);
}

#[tokio::test]
async fn retry_gives_up_immediately_on_fatal_errors() {
    let policy = RetryPolicy::builder().max_attempts(5).with_sleeper(InstantSleeper).build();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = attempts.clone();
    let err = policy
        .execute(|| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RpcError::not_found("no such account"))
            }
        })
        .await
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(err.code(), "not-found");
}

#[tokio::test]
async fn health_verdicts_flip_on_hysteresis_thresholds() {
    let monitor = Arc::new(
        HealthMonitor::new(HealthMonitorConfig {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            unhealthy_threshold: 2,
            healthy_threshold: 2,
        })
        .unwrap(),
    );
    let transport = Arc::new(MockTransport::new("https://probe"));
    monitor.register_endpoint("https://probe", false, transport.clone());

    transport.always_fail(RpcError::network("down", true));
    monitor.check_all_endpoints().await;
    assert_eq!(monitor.is_healthy("https://probe"), Some(true), "one failure is not enough");
    monitor.check_all_endpoints().await;
    assert_eq!(monitor.is_healthy("https://probe"), Some(false));

    transport.succeed();
    monitor.check_all_endpoints().await;
    assert_eq!(monitor.is_healthy("https://probe"), Some(false), "one success is not enough");
    monitor.check_all_endpoints().await;
    assert_eq!(monitor.is_healthy("https://probe"), Some(true));
}

#[test]
fn token_bucket_grants_are_bounded_by_burst_plus_refill() {
    let clock = ManualClock::new();
    let bucket = TokenBucket::new(10.0, 5).unwrap().with_clock(clock.clone());

    let mut granted = 0u64;
    for _ in 0..20 {
        while bucket.try_acquire() {
            granted += 1;
        }
        clock.advance(100);
    }
    // burst + Δ·rps = 5 + 2s·10rps = 25.
    assert!(granted <= 25, "granted {}", granted);
    assert!(granted >= 20, "refill should keep feeding tokens, granted {}", granted);
}
