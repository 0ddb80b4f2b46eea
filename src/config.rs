//! Configuration surface for the fallback chain and the subscription
//! service, with construction-time validation.

use serde::{Deserialize, Serialize};

use crate::endpoint::{EndpointConfig, RateLimitConfig};
use crate::error::RpcError;
use crate::types::Commitment;

/// The shared public node: allowed only as a non-primary fallback.
pub const PUBLIC_MAINNET_HOST: &str = "api.mainnet-beta.solana.com";

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_ms() -> u64 {
    30_000
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_slot_debounce_ms() -> u64 {
    2_000
}

fn default_poll_interval_ms() -> u64 {
    30_000
}

fn default_recovery_interval_ms() -> u64 {
    60_000
}

/// Chain-level circuit breaker defaults; endpoints may override fields.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerDefaults {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub success_threshold: u32,
}

impl Default for BreakerDefaults {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout_ms: 30_000, success_threshold: 2 }
    }
}

/// Stable priority sort: ties keep configuration order.
pub(crate) fn sorted_by_priority(endpoints: &[EndpointConfig]) -> Vec<EndpointConfig> {
    let mut sorted: Vec<EndpointConfig> =
        endpoints.iter().cloned().map(EndpointConfig::normalize).collect();
    sorted.sort_by_key(|e| e.priority);
    sorted
}

fn check_pool(endpoints: &[EndpointConfig], what: &str) -> Result<(), RpcError> {
    if endpoints.is_empty() {
        return Err(RpcError::validation(format!("{} requires at least one endpoint", what)));
    }
    for endpoint in endpoints {
        endpoint.validate()?;
    }
    let sorted = sorted_by_priority(endpoints);
    if let Some(primary) = sorted.first() {
        if primary.url.contains(PUBLIC_MAINNET_HOST) {
            return Err(RpcError::validation(format!(
                "{} must not be the primary endpoint; configure it as a lower-priority fallback",
                PUBLIC_MAINNET_HOST
            )));
        }
    }
    Ok(())
}

/// Configuration of [`crate::chain::RpcFallbackChain`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackChainConfig {
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub default_commitment: Commitment,
    /// Per-call operation timeout when an endpoint declares none.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Token-bucket parameters for endpoints without their own.
    #[serde(default)]
    pub default_rate_limit: RateLimitConfig,
    #[serde(default)]
    pub default_breaker: BreakerDefaults,
    #[serde(default = "default_true")]
    pub health_monitoring: bool,
    #[serde(default = "default_health_interval_ms")]
    pub health_check_interval_ms: u64,
}

impl FallbackChainConfig {
    pub fn new(endpoints: Vec<EndpointConfig>) -> Self {
        Self {
            endpoints,
            default_commitment: Commitment::default(),
            default_timeout_ms: default_timeout_ms(),
            default_rate_limit: RateLimitConfig::default(),
            default_breaker: BreakerDefaults::default(),
            health_monitoring: true,
            health_check_interval_ms: default_health_interval_ms(),
        }
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        check_pool(&self.endpoints, "fallback chain")?;
        if self.default_timeout_ms == 0 {
            return Err(RpcError::validation("default_timeout_ms must be > 0"));
        }
        if self.health_monitoring && self.health_check_interval_ms == 0 {
            return Err(RpcError::validation("health_check_interval_ms must be > 0"));
        }
        Ok(())
    }
}

/// Configuration of [`crate::subscription::SubscriptionService`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Streaming endpoints; `ws_url` is dialed when present.
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub commitment: Commitment,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_slot_debounce_ms")]
    pub slot_debounce_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_recovery_interval_ms")]
    pub channel_recovery_interval_ms: u64,
}

impl SubscriptionConfig {
    pub fn new(endpoints: Vec<EndpointConfig>) -> Self {
        Self {
            endpoints,
            commitment: Commitment::default(),
            heartbeat_interval_ms: default_heartbeat_ms(),
            reconnect_base_delay_ms: default_reconnect_base_ms(),
            reconnect_max_delay_ms: default_reconnect_max_ms(),
            slot_debounce_ms: default_slot_debounce_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            channel_recovery_interval_ms: default_recovery_interval_ms(),
        }
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        check_pool(&self.endpoints, "subscription service")?;
        for (name, value) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("reconnect_base_delay_ms", self.reconnect_base_delay_ms),
            ("reconnect_max_delay_ms", self.reconnect_max_delay_ms),
            ("slot_debounce_ms", self.slot_debounce_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("channel_recovery_interval_ms", self.channel_recovery_interval_ms),
        ] {
            if value == 0 {
                return Err(RpcError::validation(format!("{} must be > 0", name)));
            }
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(RpcError::validation(
                "reconnect_base_delay_ms must not exceed reconnect_max_delay_ms",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str, priority: u32) -> EndpointConfig {
        EndpointConfig::new(url, format!("ep-{}", priority), priority)
    }

    #[test]
    fn chain_config_requires_endpoints() {
        let config = FallbackChainConfig::new(vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn public_node_must_not_be_primary() {
        let config = FallbackChainConfig::new(vec![
            endpoint("https://api.mainnet-beta.solana.com", 1),
            endpoint("https://rpc.paid.example.com", 2),
        ]);
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "validation");

        // Allowed as a lower-priority fallback.
        let config = FallbackChainConfig::new(vec![
            endpoint("https://rpc.paid.example.com", 1),
            endpoint("https://api.mainnet-beta.solana.com", 9),
        ]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn priority_sort_is_stable_on_ties() {
        let sorted = sorted_by_priority(&[
            endpoint("https://b", 2),
            endpoint("https://a1", 1),
            endpoint("https://a2", 1),
        ]);
        let urls: Vec<&str> = sorted.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a1", "https://a2", "https://b"]);
    }

    #[test]
    fn subscription_config_validates_intervals() {
        let mut config = SubscriptionConfig::new(vec![endpoint("https://rpc.example.com", 1)]);
        assert!(config.validate().is_ok());

        config.slot_debounce_ms = 0;
        assert!(config.validate().is_err());

        config.slot_debounce_ms = 2_000;
        config.reconnect_base_delay_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_deserialize_from_minimal_json() {
        let json = r#"{"endpoints":[{"url":"https://rpc.example.com","name":"main","priority":1}]}"#;
        let config: SubscriptionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.heartbeat_interval_ms, 30_000);
        assert_eq!(config.slot_debounce_ms, 2_000);
        assert_eq!(config.commitment, Commitment::Confirmed);

        let chain: FallbackChainConfig = serde_json::from_str(json).unwrap();
        assert!(chain.health_monitoring);
        assert_eq!(chain.default_breaker.failure_threshold, 5);
    }
}
