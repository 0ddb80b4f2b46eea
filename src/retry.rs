//! Configurable retry loop with backoff, jitter and retryable-error
//! classification.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::{ErrorKind, RpcError};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Observer invoked before each retry sleep: (attempt, error, delay).
pub type OnRetry = Arc<dyn Fn(usize, &RpcError, Duration) + Send + Sync>;
/// Observer invoked on success with the number of attempts used.
pub type OnSuccess = Arc<dyn Fn(usize) + Send + Sync>;
/// Observer invoked when the loop gives up.
pub type OnFailure = Arc<dyn Fn(&RpcError) + Send + Sync>;

/// Retry policy: attempt budget, delay schedule, and error classification.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    retryable_codes: Vec<String>,
    on_retry: Option<OnRetry>,
    on_success: Option<OnSuccess>,
    on_failure: Option<OnFailure>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("retryable_codes", &self.retryable_codes)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Whether `error` may be retried under this policy.
    ///
    /// The fixed predicate ([`RpcError::is_default_retryable`]) is extended
    /// by the configured code list, matched against the stable category
    /// code and, for RPC errors, the numeric server code.
    pub fn is_retryable(&self, error: &RpcError) -> bool {
        if error.is_default_retryable() {
            return true;
        }
        if self.retryable_codes.iter().any(|c| c == error.code()) {
            return true;
        }
        if let ErrorKind::Rpc { code: Some(code), .. } = error.kind() {
            return self.retryable_codes.iter().any(|c| c == &code.to_string());
        }
        false
    }

    /// Run `operation` up to `max_attempts` times.
    ///
    /// A `max_attempts` of zero exhausts the budget without invoking the
    /// operation at all; one means a single attempt with no retry. On
    /// exhaustion the last error is returned, annotated with the attempt
    /// count.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, RpcError>
    where
        Fut: Future<Output = Result<T, RpcError>>,
        Op: FnMut() -> Fut,
    {
        if self.max_attempts == 0 {
            let error = RpcError::validation("retry budget exhausted before the first attempt")
                .with_detail("max_attempts", serde_json::json!(0));
            if let Some(cb) = &self.on_failure {
                cb(&error);
            }
            return Err(error);
        }

        for attempt in 1..=self.max_attempts {
            match operation().await {
                Ok(value) => {
                    if let Some(cb) = &self.on_success {
                        cb(attempt);
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if attempt == self.max_attempts || !self.is_retryable(&error) {
                        let error =
                            error.with_detail("attempts", serde_json::json!(attempt));
                        if let Some(cb) = &self.on_failure {
                            cb(&error);
                        }
                        return Err(error);
                    }

                    let delay = self.jitter.apply(self.backoff.delay(attempt));
                    tracing::debug!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after failure"
                    );
                    if let Some(cb) = &self.on_retry {
                        cb(attempt, &error, delay);
                    }
                    self.sleeper.sleep(delay).await;
                }
            }
        }

        // The loop always returns from its last iteration.
        Err(RpcError::validation("retry loop exited without a result"))
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    retryable_codes: Vec<String>,
    on_retry: Option<OnRetry>,
    on_success: Option<OnSuccess>,
    on_failure: Option<OnFailure>,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_secs(1), 2.0),
            jitter: Jitter::proportional(),
            retryable_codes: Vec::new(),
            on_retry: None,
            on_success: None,
            on_failure: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Attempt budget. Zero is legal and fails without invoking the
    /// operation.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Additional retryable codes: stable category codes (`"rpc"`,
    /// `"not-found"`, ...) or numeric RPC codes rendered as strings.
    pub fn retryable_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    pub fn on_retry(mut self, callback: OnRetry) -> Self {
        self.on_retry = Some(callback);
        self
    }

    pub fn on_success(mut self, callback: OnSuccess) -> Self {
        self.on_success = Some(callback);
        self
    }

    pub fn on_failure(mut self, callback: OnFailure) -> Self {
        self.on_failure = Some(callback);
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            retryable_codes: self.retryable_codes,
            on_retry: self.on_retry,
            on_success: self.on_success,
            on_failure: self.on_failure,
            sleeper: self.sleeper,
        }
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn retryable() -> RpcError {
        RpcError::network("connection refused", true)
    }

    fn fatal() -> RpcError {
        RpcError::validation("bad pubkey")
    }

    #[tokio::test]
    async fn success_on_first_attempt_sleeps_never() {
        let sleeper = TrackingSleeper::new();
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .with_sleeper(sleeper.clone())
            .build();

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let result = policy
            .execute(|| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, RpcError>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn exponential_delays_between_attempts() {
        let sleeper = TrackingSleeper::new();
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .backoff(Backoff::exponential(Duration::from_millis(1_000), 2.0))
            .jitter(Jitter::None)
            .with_sleeper(sleeper.clone())
            .build();

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let result = policy
            .execute(|| {
                let counted = counted.clone();
                async move {
                    if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(retryable())
                    } else {
                        Ok(7u64)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        // One failure, so exactly one inter-attempt delay of the base 1s.
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(1_000)]);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error_with_attempt_count() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .with_sleeper(InstantSleeper)
            .build();

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let err = policy
            .execute(|| {
                let counted = counted.clone();
                async move {
                    let n = counted.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(RpcError::network(format!("boom {}", n), true))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("boom 2"), "{}", err);
        assert_eq!(err.context().details["attempts"], serde_json::json!(3));
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .with_sleeper(InstantSleeper)
            .build();

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let err = policy
            .execute(|| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(fatal())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.code(), "validation");
    }

    #[tokio::test]
    async fn zero_attempts_never_invokes_operation() {
        let policy = RetryPolicy::builder()
            .max_attempts(0)
            .with_sleeper(InstantSleeper)
            .build();

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let err = policy
            .execute(|| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, RpcError>(())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(err.code(), "validation");
    }

    #[tokio::test]
    async fn single_attempt_means_no_retry() {
        let policy = RetryPolicy::builder()
            .max_attempts(1)
            .with_sleeper(InstantSleeper)
            .build();

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let _ = policy
            .execute(|| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(retryable())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn configured_codes_extend_the_predicate() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .retryable_codes(["not-found", "-32601"])
            .with_sleeper(InstantSleeper)
            .build();

        assert!(policy.is_retryable(&RpcError::not_found("gone")));
        assert!(policy.is_retryable(&RpcError::rpc(Some(-32601), "method not found")));
        assert!(!policy.is_retryable(&RpcError::validation("nope")));
    }

    #[tokio::test]
    async fn fibonacci_schedule_applies_between_attempts() {
        let sleeper = TrackingSleeper::new();
        let policy = RetryPolicy::builder()
            .max_attempts(4)
            .backoff(Backoff::fibonacci(Duration::from_millis(100)))
            .jitter(Jitter::None)
            .with_sleeper(sleeper.clone())
            .build();

        let _ = policy.execute(|| async { Err::<(), _>(retryable()) }).await;
        assert_eq!(
            sleeper.calls(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300)
            ]
        );
    }

    #[tokio::test]
    async fn callbacks_observe_the_lifecycle() {
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let on_retry = events.clone();
        let on_failure = events.clone();
        let policy = RetryPolicy::builder()
            .max_attempts(2)
            .jitter(Jitter::None)
            .backoff(Backoff::fixed(Duration::from_millis(10)))
            .on_retry(Arc::new(move |attempt, _, delay| {
                on_retry.lock().unwrap().push(format!("retry:{}:{}ms", attempt, delay.as_millis()));
            }))
            .on_failure(Arc::new(move |error| {
                on_failure.lock().unwrap().push(format!("failure:{}", error.code()));
            }))
            .with_sleeper(InstantSleeper)
            .build();

        let _ = policy.execute(|| async { Err::<(), _>(retryable()) }).await;

        let seen = events.lock().unwrap().clone();
        assert_eq!(seen, vec!["retry:1:10ms".to_string(), "failure:network".to_string()]);
    }

    #[tokio::test]
    async fn success_callback_reports_attempts_used() {
        let attempts_used = Arc::new(AtomicUsize::new(0));
        let recorded = attempts_used.clone();
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .jitter(Jitter::None)
            .backoff(Backoff::fixed(Duration::from_millis(1)))
            .on_success(Arc::new(move |attempts| {
                recorded.store(attempts, Ordering::SeqCst);
            }))
            .with_sleeper(InstantSleeper)
            .build();

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let _ = policy
            .execute(|| {
                let counted = counted.clone();
                async move {
                    if counted.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(retryable())
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(attempts_used.load(Ordering::SeqCst), 3);
    }
}
