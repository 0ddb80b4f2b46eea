//! Endpoint descriptors: URL, priority, capabilities and per-endpoint
//! limits.

use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// RPC method families an endpoint can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Plain JSON-RPC reads. Every endpoint has this.
    Standard,
    /// Digital Asset Standard methods.
    Das,
    /// Streaming subscriptions.
    Websocket,
    /// Priority-fee estimation queries.
    PriorityFee,
}

/// Methods that require the [`Capability::Das`] capability.
pub const DAS_METHODS: [&str; 9] = [
    "getAsset",
    "getAssetProof",
    "getAssetsByOwner",
    "getAssetsByGroup",
    "getAssetsByCreator",
    "getAssetsByAuthority",
    "searchAssets",
    "getSignaturesForAsset",
    "getTokenAccounts",
];

/// Whether `method` is a Digital Asset Standard read.
pub fn is_das_method(method: &str) -> bool {
    DAS_METHODS.contains(&method)
}

/// Per-endpoint token-bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { requests_per_second: 10.0, burst: 20 }
    }
}

/// Per-endpoint circuit-breaker overrides; unset fields fall back to the
/// chain defaults.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BreakerOverrides {
    pub failure_threshold: Option<u32>,
    pub recovery_timeout_ms: Option<u64>,
    pub success_threshold: Option<u32>,
}

/// Immutable endpoint descriptor.
///
/// Priorities order the fallback traversal (lower is preferred) and need
/// not be unique; ties keep configuration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    pub name: String,
    pub priority: u32,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub breaker: Option<BreakerOverrides>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Streaming URL for the subscription service, when it differs from
    /// the HTTP URL.
    #[serde(default)]
    pub ws_url: Option<String>,
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>, name: impl Into<String>, priority: u32) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            priority,
            capabilities: vec![Capability::Standard],
            rate_limit: None,
            breaker: None,
            timeout_ms: None,
            ws_url: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn with_rate_limit(mut self, requests_per_second: f64, burst: u32) -> Self {
        self.rate_limit = Some(RateLimitConfig { requests_per_second, burst });
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = Some(ws_url.into());
        self
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Ensure the invariant that every endpoint serves `standard`.
    pub fn normalize(mut self) -> Self {
        if !self.capabilities.contains(&Capability::Standard) {
            self.capabilities.insert(0, Capability::Standard);
        }
        self
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        if self.url.trim().is_empty() {
            return Err(RpcError::validation("endpoint url must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(RpcError::validation(format!(
                "endpoint {} must have a display name",
                self.url
            )));
        }
        if let Some(rl) = &self.rate_limit {
            if rl.requests_per_second <= 0.0 || rl.burst == 0 {
                return Err(RpcError::validation(format!(
                    "endpoint {} has an invalid rate limit ({} rps, burst {})",
                    self.url, rl.requests_per_second, rl.burst
                )));
            }
        }
        if self.timeout_ms == Some(0) {
            return Err(RpcError::validation(format!(
                "endpoint {} timeout must be > 0",
                self.url
            )));
        }
        Ok(())
    }

    /// The URL the subscription service should dial: the streaming URL if
    /// configured, else the HTTP URL.
    pub fn stream_url(&self) -> &str {
        self.ws_url.as_deref().unwrap_or(&self.url)
    }
}

/// Rolling per-endpoint request counters kept by the fallback chain.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EndpointMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_latency_ms: u64,
}

impl EndpointMetrics {
    pub fn record(&mut self, success: bool, latency_ms: u64) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.total_latency_ms += latency_ms;
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.total_requests as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}
