//! Capability-aware RPC fallback chain.
//!
//! Wraps a priority-ordered pool of endpoints, each with its own circuit
//! breaker, token bucket and rolling metrics. A call walks the eligible
//! endpoints in priority order, skipping open breakers, denied limiters
//! and unhealthy verdicts, and returns the first success; a denied
//! limiter never queues, the chain simply advances. Two concurrent calls
//! may interleave, but each call's traversal is strict priority order
//! over its own snapshot of gate state.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{sorted_by_priority, FallbackChainConfig};
use crate::endpoint::{is_das_method, Capability, EndpointConfig, EndpointMetrics};
use crate::error::RpcError;
use crate::health::{HealthMonitor, HealthMonitorConfig};
use crate::rate_limit::TokenBucket;
use crate::transport::{RpcTransport, TransportFactory};
use crate::types::{
    AccountFilter, AccountInfo, Blockhash, Commitment, KeyedAccount, Pubkey, SignatureStatus,
    TokenAccountsFilter, TxSignature,
};

/// Routing directives for one [`RpcFallbackChain::execute`] call.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Logical method name; recognized DAS methods add the `das`
    /// capability requirement.
    pub method: Option<String>,
    pub required_capabilities: Vec<Capability>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_method(method: impl Into<String>) -> Self {
        Self { method: Some(method.into()), required_capabilities: Vec::new() }
    }

    pub fn require(mut self, capability: Capability) -> Self {
        if !self.required_capabilities.contains(&capability) {
            self.required_capabilities.push(capability);
        }
        self
    }
}

/// Endpoint runtime state: descriptor, transport handle, gates, counters.
/// Independently owned siblings; no lock spans two endpoints.
struct EndpointState {
    config: EndpointConfig,
    transport: Arc<dyn RpcTransport>,
    breaker: CircuitBreaker,
    limiter: TokenBucket,
    metrics: Mutex<EndpointMetrics>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ChainTotals {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    fallbacks_triggered: u64,
}

/// Per-endpoint slice of a [`ChainMetrics`] report.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointReport {
    pub url: String,
    pub name: String,
    pub priority: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_latency_ms: f64,
    pub breaker_state: CircuitState,
    /// Verdict from the health monitor, when monitoring is enabled.
    pub healthy: Option<bool>,
}

/// Metrics snapshot over the whole chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Successful calls that were preceded by a skip or failure on a
    /// higher-priority endpoint.
    pub fallbacks_triggered: u64,
    pub endpoints: Vec<EndpointReport>,
}

/// Priority-ordered, capability-aware endpoint pool.
pub struct RpcFallbackChain {
    endpoints: Vec<EndpointState>,
    health: Option<Arc<HealthMonitor>>,
    default_commitment: Commitment,
    totals: Mutex<ChainTotals>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RpcFallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcFallbackChain")
            .field("endpoints", &self.endpoints.len())
            .field("default_commitment", &self.default_commitment)
            .finish_non_exhaustive()
    }
}

impl RpcFallbackChain {
    /// Build the chain from a validated config, creating one transport per
    /// endpoint. Endpoints are sorted by priority (ties keep configuration
    /// order); a health monitor is attached when enabled but its cadence
    /// starts only with [`start_health_monitoring`](Self::start_health_monitoring).
    pub fn new(
        config: FallbackChainConfig,
        factory: &dyn TransportFactory,
    ) -> Result<Self, RpcError> {
        config.validate()?;

        let health = if config.health_monitoring {
            Some(Arc::new(HealthMonitor::new(HealthMonitorConfig {
                interval: Duration::from_millis(config.health_check_interval_ms),
                ..HealthMonitorConfig::default()
            })?))
        } else {
            None
        };

        let mut endpoints = Vec::new();
        for descriptor in sorted_by_priority(&config.endpoints) {
            let transport = factory.create(&descriptor)?;

            let overrides = descriptor.breaker.unwrap_or_default();
            let breaker_config = CircuitBreakerConfig {
                failure_threshold: overrides
                    .failure_threshold
                    .unwrap_or(config.default_breaker.failure_threshold),
                recovery_timeout: Duration::from_millis(
                    overrides
                        .recovery_timeout_ms
                        .unwrap_or(config.default_breaker.recovery_timeout_ms),
                ),
                success_threshold: overrides
                    .success_threshold
                    .unwrap_or(config.default_breaker.success_threshold),
                operation_timeout: Duration::from_millis(
                    descriptor.timeout_ms.unwrap_or(config.default_timeout_ms),
                ),
            };
            let breaker = CircuitBreaker::new(breaker_config)?;

            let limit = descriptor.rate_limit.unwrap_or(config.default_rate_limit);
            let limiter = TokenBucket::new(limit.requests_per_second, limit.burst)?;

            if let Some(monitor) = &health {
                monitor.register_endpoint(
                    descriptor.url.clone(),
                    descriptor.has_capability(Capability::Das),
                    Arc::clone(&transport),
                );
            }

            endpoints.push(EndpointState {
                config: descriptor,
                transport,
                breaker,
                limiter,
                metrics: Mutex::new(EndpointMetrics::default()),
            });
        }

        Ok(Self {
            endpoints,
            health,
            default_commitment: config.default_commitment,
            totals: Mutex::new(ChainTotals::default()),
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    pub fn default_commitment(&self) -> Commitment {
        self.default_commitment
    }

    /// The attached health monitor, when monitoring is enabled.
    pub fn health_monitor(&self) -> Option<&Arc<HealthMonitor>> {
        self.health.as_ref()
    }

    /// Start the health monitor's background cadence.
    pub fn start_health_monitoring(&self) {
        if let Some(monitor) = &self.health {
            monitor.start();
        }
    }

    pub fn stop_health_monitoring(&self) {
        if let Some(monitor) = &self.health {
            monitor.stop();
        }
    }

    /// Run one immediate health round, regardless of the cadence.
    pub async fn check_health_now(&self) {
        if let Some(monitor) = &self.health {
            monitor.check_all_endpoints().await;
        }
    }

    /// Force the breaker of `url` open. Returns false for an unknown URL.
    pub fn force_endpoint_open(&self, url: &str, reason: &str) -> bool {
        match self.endpoints.iter().find(|e| e.config.url == url) {
            Some(endpoint) => {
                endpoint.breaker.force_open(reason);
                true
            }
            None => false,
        }
    }

    /// Force the breaker of `url` closed. Returns false for an unknown URL.
    pub fn force_endpoint_closed(&self, url: &str, reason: &str) -> bool {
        match self.endpoints.iter().find(|e| e.config.url == url) {
            Some(endpoint) => {
                endpoint.breaker.force_closed(reason);
                true
            }
            None => false,
        }
    }

    fn lock_totals(&self) -> std::sync::MutexGuard<'_, ChainTotals> {
        self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn required_capabilities(options: &ExecuteOptions) -> Vec<Capability> {
        let mut required = options.required_capabilities.clone();
        if let Some(method) = &options.method {
            if is_das_method(method) && !required.contains(&Capability::Das) {
                required.push(Capability::Das);
            }
        }
        required
    }

    /// Route `operation` to the best eligible endpoint, falling through on
    /// skip or failure.
    pub async fn execute<T, Op>(
        &self,
        operation: Op,
        options: ExecuteOptions,
    ) -> Result<T, RpcError>
    where
        Op: Fn(Arc<dyn RpcTransport>) -> BoxFuture<'static, Result<T, RpcError>> + Send + Sync,
    {
        let required = Self::required_capabilities(&options);
        let method = options.method.as_deref().unwrap_or("execute");
        self.lock_totals().total_requests += 1;

        let eligible: Vec<&EndpointState> = self
            .endpoints
            .iter()
            .filter(|e| required.iter().all(|c| e.config.has_capability(*c)))
            .collect();
        if eligible.is_empty() {
            self.lock_totals().failed_requests += 1;
            return Err(RpcError::pool_exhausted(required).with_operation(method));
        }

        let health = self.health.as_ref().map(|monitor| monitor.snapshot());
        let mut last_error: Option<RpcError> = None;
        let mut fell_through = false;

        for endpoint in eligible {
            let url = endpoint.config.url.as_str();

            if !endpoint.breaker.call_permitted() {
                tracing::debug!(url, method, "skipping endpoint: breaker open");
                fell_through = true;
                continue;
            }
            if !endpoint.limiter.try_acquire() {
                tracing::debug!(url, method, "skipping endpoint: rate limited");
                fell_through = true;
                continue;
            }
            if let Some(snapshot) = &health {
                if snapshot.get(url).map(|r| !r.healthy).unwrap_or(false) {
                    tracing::debug!(url, method, "skipping endpoint: unhealthy");
                    fell_through = true;
                    continue;
                }
            }

            let started = self.clock.now_millis();
            let transport = Arc::clone(&endpoint.transport);
            let result = endpoint.breaker.execute(|| operation(transport)).await;
            let latency = self.clock.now_millis().saturating_sub(started);

            match result {
                Ok(value) => {
                    endpoint
                        .metrics
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .record(true, latency);
                    let mut totals = self.lock_totals();
                    totals.successful_requests += 1;
                    if fell_through {
                        totals.fallbacks_triggered += 1;
                        tracing::info!(url, method, "call served by fallback endpoint");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    // A breaker rejection never invoked the operation, so
                    // it is a skip, not an endpoint request.
                    if !error.is_circuit_open() {
                        endpoint
                            .metrics
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .record(false, latency);
                    }
                    tracing::warn!(url, method, error = %error, "endpoint failed, advancing");
                    fell_through = true;
                    last_error =
                        Some(error.with_endpoint(url.to_string()).with_operation(method));
                }
            }
        }

        self.lock_totals().failed_requests += 1;
        Err(last_error.unwrap_or_else(|| {
            RpcError::pool_exhausted(required)
                .with_operation(method)
                .with_detail("reason", serde_json::json!("all eligible endpoints exhausted"))
        }))
    }

    pub fn metrics(&self) -> ChainMetrics {
        let totals = *self.lock_totals();
        let health = self.health.as_ref().map(|monitor| monitor.snapshot());
        let endpoints = self
            .endpoints
            .iter()
            .map(|endpoint| {
                let metrics =
                    *endpoint.metrics.lock().unwrap_or_else(PoisonError::into_inner);
                EndpointReport {
                    url: endpoint.config.url.clone(),
                    name: endpoint.config.name.clone(),
                    priority: endpoint.config.priority,
                    total_requests: metrics.total_requests,
                    successful_requests: metrics.successful_requests,
                    failed_requests: metrics.failed_requests,
                    avg_latency_ms: metrics.avg_latency_ms(),
                    breaker_state: endpoint.breaker.state(),
                    healthy: health
                        .as_ref()
                        .and_then(|snapshot| snapshot.get(&endpoint.config.url))
                        .map(|record| record.healthy),
                }
            })
            .collect();
        ChainMetrics {
            total_requests: totals.total_requests,
            successful_requests: totals.successful_requests,
            failed_requests: totals.failed_requests,
            fallbacks_triggered: totals.fallbacks_triggered,
            endpoints,
        }
    }

    // Typed helpers over `execute`, used by applications and by the
    // polling fallback (the chain is itself an `RpcTransport`).

    pub async fn account_info(
        &self,
        pubkey: &Pubkey,
        commitment: Option<Commitment>,
    ) -> Result<Option<AccountInfo>, RpcError> {
        let commitment = commitment.unwrap_or(self.default_commitment);
        let pubkey = pubkey.clone();
        self.execute(
            move |transport| {
                let pubkey = pubkey.clone();
                Box::pin(async move { transport.get_account_info(&pubkey, commitment).await })
            },
            ExecuteOptions::for_method("getAccountInfo"),
        )
        .await
    }

    pub async fn multiple_accounts(
        &self,
        pubkeys: &[Pubkey],
        commitment: Option<Commitment>,
    ) -> Result<Vec<Option<AccountInfo>>, RpcError> {
        let commitment = commitment.unwrap_or(self.default_commitment);
        let pubkeys = pubkeys.to_vec();
        self.execute(
            move |transport| {
                let pubkeys = pubkeys.clone();
                Box::pin(async move { transport.get_multiple_accounts(&pubkeys, commitment).await })
            },
            ExecuteOptions::for_method("getMultipleAccounts"),
        )
        .await
    }

    pub async fn program_accounts(
        &self,
        program: &Pubkey,
        filters: &[AccountFilter],
        commitment: Option<Commitment>,
    ) -> Result<Vec<KeyedAccount>, RpcError> {
        let commitment = commitment.unwrap_or(self.default_commitment);
        let program = program.clone();
        let filters = filters.to_vec();
        self.execute(
            move |transport| {
                let program = program.clone();
                let filters = filters.clone();
                Box::pin(async move {
                    transport.get_program_accounts(&program, &filters, commitment).await
                })
            },
            ExecuteOptions::for_method("getProgramAccounts"),
        )
        .await
    }

    pub async fn token_accounts_by_owner(
        &self,
        owner: &Pubkey,
        filter: &TokenAccountsFilter,
        commitment: Option<Commitment>,
    ) -> Result<Vec<KeyedAccount>, RpcError> {
        let commitment = commitment.unwrap_or(self.default_commitment);
        let owner = owner.clone();
        let filter = filter.clone();
        self.execute(
            move |transport| {
                let owner = owner.clone();
                let filter = filter.clone();
                Box::pin(async move {
                    transport.get_token_accounts_by_owner(&owner, &filter, commitment).await
                })
            },
            ExecuteOptions::for_method("getTokenAccountsByOwner"),
        )
        .await
    }

    pub async fn slot(&self, commitment: Option<Commitment>) -> Result<u64, RpcError> {
        let commitment = commitment.unwrap_or(self.default_commitment);
        self.execute(
            move |transport| Box::pin(async move { transport.get_slot(commitment).await }),
            ExecuteOptions::for_method("getSlot"),
        )
        .await
    }

    pub async fn latest_blockhash(
        &self,
        commitment: Option<Commitment>,
    ) -> Result<Blockhash, RpcError> {
        let commitment = commitment.unwrap_or(self.default_commitment);
        self.execute(
            move |transport| {
                Box::pin(async move { transport.get_latest_blockhash(commitment).await })
            },
            ExecuteOptions::for_method("getLatestBlockhash"),
        )
        .await
    }

    pub async fn signature_status(
        &self,
        signature: &TxSignature,
    ) -> Result<Option<SignatureStatus>, RpcError> {
        let signature = signature.clone();
        self.execute(
            move |transport| {
                let signature = signature.clone();
                Box::pin(async move { transport.get_signature_status(&signature).await })
            },
            ExecuteOptions::for_method("getSignatureStatuses"),
        )
        .await
    }

    /// Method-addressed DAS (and other raw) reads, routed by capability.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let method_owned = method.to_string();
        self.execute(
            move |transport| {
                let method = method_owned.clone();
                let params = params.clone();
                Box::pin(async move { transport.call_raw(&method, params).await })
            },
            ExecuteOptions::for_method(method),
        )
        .await
    }
}

#[async_trait::async_trait]
impl RpcTransport for RpcFallbackChain {
    async fn get_account_info(
        &self,
        pubkey: &Pubkey,
        commitment: Commitment,
    ) -> Result<Option<AccountInfo>, RpcError> {
        self.account_info(pubkey, Some(commitment)).await
    }

    async fn get_multiple_accounts(
        &self,
        pubkeys: &[Pubkey],
        commitment: Commitment,
    ) -> Result<Vec<Option<AccountInfo>>, RpcError> {
        self.multiple_accounts(pubkeys, Some(commitment)).await
    }

    async fn get_program_accounts(
        &self,
        program: &Pubkey,
        filters: &[AccountFilter],
        commitment: Commitment,
    ) -> Result<Vec<KeyedAccount>, RpcError> {
        self.program_accounts(program, filters, Some(commitment)).await
    }

    async fn get_token_accounts_by_owner(
        &self,
        owner: &Pubkey,
        filter: &TokenAccountsFilter,
        commitment: Commitment,
    ) -> Result<Vec<KeyedAccount>, RpcError> {
        self.token_accounts_by_owner(owner, filter, Some(commitment)).await
    }

    async fn get_slot(&self, commitment: Commitment) -> Result<u64, RpcError> {
        self.slot(Some(commitment)).await
    }

    async fn get_latest_blockhash(&self, commitment: Commitment) -> Result<Blockhash, RpcError> {
        self.latest_blockhash(Some(commitment)).await
    }

    async fn get_signature_status(
        &self,
        signature: &TxSignature,
    ) -> Result<Option<SignatureStatus>, RpcError> {
        self.signature_status(signature).await
    }

    async fn get_provider_health(&self) -> Result<(), RpcError> {
        self.execute(
            |transport| Box::pin(async move { transport.get_provider_health().await }),
            ExecuteOptions::for_method("getHealth"),
        )
        .await
    }

    async fn call_raw(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        self.call(method, params).await
    }
}
