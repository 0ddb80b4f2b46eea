//! Background endpoint health monitoring with hysteresis.
//!
//! Each registered endpoint is probed on a cadence: DAS-capable providers
//! answer their provider health query, everyone else is asked for the
//! chain head (a non-positive slot counts as a failure). Verdicts flip
//! only after a configured run of consecutive failures or successes, and
//! the change callback fires exactly once per transition.
//!
//! Records live in the TTL cache so that endpoints which stop being
//! probed age out and return to the initial healthy verdict; a lock-free
//! snapshot is republished after every round for the fallback chain's hot
//! path.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cache::TtlCache;
use crate::clock::{Clock, MonotonicClock};
use crate::error::RpcError;
use crate::transport::RpcTransport;
use crate::types::Commitment;

/// Observer of verdict transitions: (endpoint url, now healthy).
pub type HealthChangeCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// How many probe intervals a record survives without being refreshed.
const RECORD_TTL_INTERVALS: u32 = 10;

/// Health record for one endpoint, keyed by URL.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointHealth {
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub last_checked_millis: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_error: Option<String>,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            latency_ms: None,
            last_checked_millis: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthMonitorConfig {
    /// Cadence of background rounds.
    pub interval: Duration,
    /// Deadline for a single probe.
    pub probe_timeout: Duration,
    /// Consecutive failures flipping healthy → unhealthy.
    pub unhealthy_threshold: u32,
    /// Consecutive successes flipping unhealthy → healthy.
    pub healthy_threshold: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

impl HealthMonitorConfig {
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.interval.is_zero() || self.probe_timeout.is_zero() {
            return Err(RpcError::validation("health monitor intervals must be > 0"));
        }
        if self.unhealthy_threshold == 0 || self.healthy_threshold == 0 {
            return Err(RpcError::validation("health monitor thresholds must be > 0"));
        }
        Ok(())
    }
}

struct ProbeTarget {
    url: String,
    das_capable: bool,
    transport: Arc<dyn RpcTransport>,
}

/// Periodic prober maintaining a hysteretic verdict per endpoint.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    targets: Mutex<Vec<ProbeTarget>>,
    records: Mutex<TtlCache<EndpointHealth>>,
    snapshot: ArcSwap<HashMap<String, EndpointHealth>>,
    on_change: Option<HealthChangeCallback>,
    clock: Arc<dyn Clock>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor").field("config", &self.config).finish_non_exhaustive()
    }
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig) -> Result<Self, RpcError> {
        config.validate()?;
        let record_ttl = config.interval * RECORD_TTL_INTERVALS;
        Ok(Self {
            config,
            targets: Mutex::new(Vec::new()),
            records: Mutex::new(TtlCache::new(256, record_ttl)?),
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            on_change: None,
            clock: Arc::new(MonotonicClock::default()),
            cancel: Mutex::new(None),
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn on_change(mut self, callback: HealthChangeCallback) -> Self {
        self.on_change = Some(callback);
        self
    }

    fn lock_targets(&self) -> std::sync::MutexGuard<'_, Vec<ProbeTarget>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, TtlCache<EndpointHealth>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an endpoint for probing. The initial verdict is healthy.
    pub fn register_endpoint(
        &self,
        url: impl Into<String>,
        das_capable: bool,
        transport: Arc<dyn RpcTransport>,
    ) {
        let url = url.into();
        self.lock_records().set(url.clone(), EndpointHealth::default(), None);
        self.lock_targets().push(ProbeTarget { url, das_capable, transport });
        self.publish();
    }

    /// Current verdict for `url`; `None` when unknown.
    pub fn is_healthy(&self, url: &str) -> Option<bool> {
        self.snapshot.load().get(url).map(|r| r.healthy)
    }

    /// Lock-free snapshot of every record, for hot-path filtering.
    pub fn snapshot(&self) -> Arc<HashMap<String, EndpointHealth>> {
        self.snapshot.load_full()
    }

    /// Run one concurrent probe round over every registered endpoint.
    ///
    /// Individual probe failures never abort the round.
    pub async fn check_all_endpoints(&self) {
        let targets: Vec<(String, bool, Arc<dyn RpcTransport>)> = self
            .lock_targets()
            .iter()
            .map(|t| (t.url.clone(), t.das_capable, Arc::clone(&t.transport)))
            .collect();
        if targets.is_empty() {
            return;
        }

        let probe_timeout = self.config.probe_timeout;
        let started = self.clock.now_millis();
        let probes = targets.into_iter().map(|(url, das_capable, transport)| async move {
            let outcome = probe(transport.as_ref(), das_capable, probe_timeout).await;
            (url, outcome)
        });
        let outcomes = futures::future::join_all(probes).await;
        let finished = self.clock.now_millis();
        let latency = finished.saturating_sub(started);

        for (url, outcome) in outcomes {
            match outcome {
                Ok(()) => self.record_success(&url, latency),
                Err(error) => self.record_failure(&url, &error),
            }
        }
        self.publish();
    }

    fn record_success(&self, url: &str, latency_ms: u64) {
        let now = self.clock.now_millis();
        let mut flipped = false;
        {
            let mut records = self.lock_records();
            let mut record = records.get(url).cloned().unwrap_or_default();
            record.consecutive_failures = 0;
            record.consecutive_successes += 1;
            record.latency_ms = Some(latency_ms);
            record.last_checked_millis = now;
            record.last_error = None;
            if !record.healthy && record.consecutive_successes >= self.config.healthy_threshold {
                record.healthy = true;
                flipped = true;
            }
            records.set(url, record, None);
        }
        if flipped {
            tracing::info!(url, "endpoint recovered");
            if let Some(cb) = &self.on_change {
                cb(url, true);
            }
        }
    }

    fn record_failure(&self, url: &str, error: &RpcError) {
        let now = self.clock.now_millis();
        let mut flipped = false;
        {
            let mut records = self.lock_records();
            let mut record = records.get(url).cloned().unwrap_or_default();
            record.consecutive_successes = 0;
            record.consecutive_failures += 1;
            record.last_checked_millis = now;
            record.last_error = Some(error.to_string());
            if record.healthy && record.consecutive_failures >= self.config.unhealthy_threshold {
                record.healthy = false;
                flipped = true;
            }
            records.set(url, record, None);
        }
        if flipped {
            tracing::warn!(url, error = %error, "endpoint marked unhealthy");
            if let Some(cb) = &self.on_change {
                cb(url, false);
            }
        }
    }

    fn publish(&self) {
        let urls: Vec<String> = self.lock_targets().iter().map(|t| t.url.clone()).collect();
        let mut map = HashMap::with_capacity(urls.len());
        let mut records = self.lock_records();
        for url in urls {
            if let Some(record) = records.get(&url) {
                map.insert(url, record.clone());
            }
        }
        drop(records);
        self.snapshot.store(Arc::new(map));
    }

    /// Start the background cadence. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        drop(guard);

        let monitor = Arc::clone(self);
        let interval = monitor.config.interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        monitor.check_all_endpoints().await;
                    }
                }
            }
        });
    }

    /// Stop the background cadence. Probes already in flight finish.
    pub fn stop(&self) {
        if let Some(token) =
            self.cancel.lock().unwrap_or_else(PoisonError::into_inner).take()
        {
            token.cancel();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn probe(
    transport: &dyn RpcTransport,
    das_capable: bool,
    probe_timeout: Duration,
) -> Result<(), RpcError> {
    let timeout_ms = probe_timeout.as_millis() as u64;
    let fut = async {
        if das_capable {
            transport.get_provider_health().await
        } else {
            let slot = transport.get_slot(Commitment::Processed).await?;
            if slot == 0 {
                return Err(RpcError::rpc(None, "chain head probe returned slot 0"));
            }
            Ok(())
        }
    };
    match tokio::time::timeout(probe_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::timeout(timeout_ms, timeout_ms)),
    }
}
