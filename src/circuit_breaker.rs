//! Per-endpoint circuit breaker.
//!
//! State machine over a single external dependency:
//! CLOSED → OPEN after `failure_threshold` consecutive failures,
//! OPEN → HALF_OPEN when a call arrives after the recovery timeout,
//! HALF_OPEN → CLOSED after `success_threshold` consecutive successes,
//! HALF_OPEN → OPEN on any failure.
//!
//! Every admitted call races the operation against the configured
//! operation timeout; a timer win surfaces as a timeout error and counts
//! as a failure. State lives behind a local mutex, never held across a
//! suspension point, so concurrent callers from separate tasks are safe
//! without any cross-endpoint locking.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::error::RpcError;

/// Bounded window of execution-time samples kept for metrics.
const EXECUTION_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Observer of state transitions: (from, to, reason).
pub type StateChangeCallback = Arc<dyn Fn(CircuitState, CircuitState, &str) + Send + Sync>;
/// Observer of successful executions, with the measured duration.
pub type SuccessCallback = Arc<dyn Fn(Duration) + Send + Sync>;
/// Observer of failed executions.
pub type FailureCallback = Arc<dyn Fn(&RpcError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip CLOSED → OPEN.
    pub failure_threshold: u32,
    /// How long OPEN rejects before admitting a probe call.
    pub recovery_timeout: Duration,
    /// Consecutive successes that restore HALF_OPEN → CLOSED.
    pub success_threshold: u32,
    /// Deadline raced against every admitted operation.
    pub operation_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            operation_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.failure_threshold == 0 {
            return Err(RpcError::validation("breaker failure_threshold must be > 0"));
        }
        if self.success_threshold == 0 {
            return Err(RpcError::validation("breaker success_threshold must be > 0"));
        }
        if self.operation_timeout.is_zero() {
            return Err(RpcError::validation("breaker operation_timeout must be > 0"));
        }
        Ok(())
    }
}

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub timed_out_calls: u64,
    pub state_changes: u64,
    pub last_state_change_millis: u64,
    pub next_attempt_millis: u64,
    /// Mean over the bounded execution-time window, milliseconds.
    pub avg_execution_ms: f64,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_state_change_millis: u64,
    next_attempt_millis: u64,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    timed_out_calls: u64,
    state_changes: u64,
    execution_times: VecDeque<u64>,
}

impl BreakerInner {
    fn zero() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_state_change_millis: 0,
            next_attempt_millis: 0,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            timed_out_calls: 0,
            state_changes: 0,
            execution_times: VecDeque::with_capacity(EXECUTION_WINDOW),
        }
    }

    fn record_execution(&mut self, millis: u64) {
        if self.execution_times.len() == EXECUTION_WINDOW {
            self.execution_times.pop_front();
        }
        self.execution_times.push_back(millis);
    }

    /// Returns the transition to report, if any.
    fn transition(
        &mut self,
        to: CircuitState,
        now: u64,
        reason: &str,
    ) -> Option<(CircuitState, CircuitState, String)> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        self.last_state_change_millis = now;
        self.state_changes += 1;
        Some((from, to, reason.to_string()))
    }
}

/// Failure-gating state machine guarding a single endpoint.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    clock: Arc<dyn Clock>,
    on_state_change: Option<StateChangeCallback>,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, RpcError> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Mutex::new(BreakerInner::zero()),
            clock: Arc::new(MonotonicClock::default()),
            on_state_change: None,
            on_success: None,
            on_failure: None,
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn on_state_change(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    pub fn on_success(mut self, callback: SuccessCallback) -> Self {
        self.on_success = Some(callback);
        self
    }

    pub fn on_failure(mut self, callback: FailureCallback) -> Self {
        self.on_failure = Some(callback);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire_transition(&self, change: Option<(CircuitState, CircuitState, String)>) {
        if let Some((from, to, reason)) = change {
            tracing::info!(%from, %to, reason = %reason, "circuit breaker state change");
            if let Some(cb) = &self.on_state_change {
                cb(from, to, &reason);
            }
        }
    }

    /// Stored state, without performing any transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call arriving now would be admitted.
    ///
    /// OPEN still past its recovery deadline admits (the call would probe
    /// via HALF_OPEN); OPEN before the deadline does not.
    pub fn call_permitted(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => self.clock.now_millis() >= inner.next_attempt_millis,
        }
    }

    /// Run `operation` through the breaker, racing it against the
    /// operation timeout.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, RpcError>
    where
        Fut: Future<Output = Result<T, RpcError>>,
        Op: FnOnce() -> Fut,
    {
        match self.admit() {
            Ok(()) => {}
            Err(rejection) => return Err(rejection),
        }
        self.run_admitted(operation).await
    }

    /// Like [`execute`](Self::execute), but a breaker rejection runs
    /// `fallback` instead of surfacing the circuit-open error. Operation
    /// failures do not invoke the fallback.
    pub async fn execute_with_fallback<T, Fut, Op, FbFut, Fb>(
        &self,
        operation: Op,
        fallback: Fb,
    ) -> Result<T, RpcError>
    where
        Fut: Future<Output = Result<T, RpcError>>,
        Op: FnOnce() -> Fut,
        FbFut: Future<Output = Result<T, RpcError>>,
        Fb: FnOnce() -> FbFut,
    {
        match self.admit() {
            Ok(()) => self.run_admitted(operation).await,
            Err(_rejection) => fallback().await,
        }
    }

    /// Admission check per the transition table. OPEN past the recovery
    /// deadline moves to HALF_OPEN and admits the probing call.
    fn admit(&self) -> Result<(), RpcError> {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                if now >= inner.next_attempt_millis {
                    inner.success_count = 0;
                    let change =
                        inner.transition(CircuitState::HalfOpen, now, "recovery timeout elapsed");
                    drop(inner);
                    self.fire_transition(change);
                    Ok(())
                } else {
                    inner.rejected_calls += 1;
                    let err = RpcError::circuit_open(
                        inner.failure_count,
                        inner.next_attempt_millis,
                    );
                    Err(err)
                }
            }
        }
    }

    async fn run_admitted<T, Fut, Op>(&self, operation: Op) -> Result<T, RpcError>
    where
        Fut: Future<Output = Result<T, RpcError>>,
        Op: FnOnce() -> Fut,
    {
        let started = self.clock.now_millis();
        let outcome = tokio::time::timeout(self.config.operation_timeout, operation()).await;
        let elapsed = self.clock.now_millis().saturating_sub(started);

        match outcome {
            Ok(Ok(value)) => {
                self.record_success(elapsed);
                Ok(value)
            }
            Ok(Err(error)) => {
                self.record_failure(elapsed, &error, false);
                Err(error)
            }
            Err(_) => {
                let error = RpcError::timeout(
                    elapsed.max(self.config.operation_timeout.as_millis() as u64),
                    self.config.operation_timeout.as_millis() as u64,
                );
                self.record_failure(elapsed, &error, true);
                Err(error)
            }
        }
    }

    fn record_success(&self, elapsed: u64) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        inner.total_calls += 1;
        inner.successful_calls += 1;
        inner.record_execution(elapsed);

        let change = match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.failure_count = 0;
                    inner.transition(CircuitState::Closed, now, "success threshold reached")
                } else {
                    None
                }
            }
            // Reachable only via force_open racing an in-flight call.
            CircuitState::Open => None,
        };
        drop(inner);

        self.fire_transition(change);
        if let Some(cb) = &self.on_success {
            cb(Duration::from_millis(elapsed));
        }
    }

    fn record_failure(&self, elapsed: u64, error: &RpcError, timed_out: bool) {
        let now = self.clock.now_millis();
        let recover_at = now + self.config.recovery_timeout.as_millis() as u64;
        let mut inner = self.lock();
        inner.total_calls += 1;
        inner.failed_calls += 1;
        if timed_out {
            inner.timed_out_calls += 1;
        }
        inner.record_execution(elapsed);

        let change = match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.next_attempt_millis = recover_at;
                    inner.transition(CircuitState::Open, now, "failure threshold reached")
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                inner.next_attempt_millis = recover_at;
                inner.transition(CircuitState::Open, now, "probe call failed")
            }
            CircuitState::Open => None,
        };
        drop(inner);

        self.fire_transition(change);
        if let Some(cb) = &self.on_failure {
            cb(error);
        }
    }

    /// Unconditionally open the breaker, recording `reason`.
    pub fn force_open(&self, reason: &str) {
        let now = self.clock.now_millis();
        let recover_at = now + self.config.recovery_timeout.as_millis() as u64;
        let mut inner = self.lock();
        inner.next_attempt_millis = recover_at;
        let change = inner.transition(CircuitState::Open, now, reason);
        drop(inner);
        self.fire_transition(change);
    }

    /// Unconditionally close the breaker, recording `reason`.
    pub fn force_closed(&self, reason: &str) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.success_count = 0;
        let change = inner.transition(CircuitState::Closed, now, reason);
        drop(inner);
        self.fire_transition(change);
    }

    /// Return the breaker to its zero state, clearing counters and
    /// metrics.
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = BreakerInner::zero();
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.lock();
        let avg_execution_ms = if inner.execution_times.is_empty() {
            0.0
        } else {
            let total: u64 = inner.execution_times.iter().sum();
            total as f64 / inner.execution_times.len() as f64
        };
        BreakerMetrics {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_calls: inner.total_calls,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
            timed_out_calls: inner.timed_out_calls,
            state_changes: inner.state_changes,
            last_state_change_millis: inner.last_state_change_millis,
            next_attempt_millis: inner.next_attempt_millis,
            avg_execution_ms,
        }
    }
}
