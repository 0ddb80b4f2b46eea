//! Convenient re-exports for common solrelay types.
pub use crate::{
    backoff::{Backoff, MAX_BACKOFF},
    cache::{CacheStats, TtlCache},
    chain::{ChainMetrics, ExecuteOptions, RpcFallbackChain},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    config::{FallbackChainConfig, SubscriptionConfig},
    endpoint::{Capability, EndpointConfig},
    error::{ErrorKind, RpcError},
    events::ChannelEvent,
    health::{HealthMonitor, HealthMonitorConfig},
    jitter::Jitter,
    rate_limit::TokenBucket,
    retry::RetryPolicy,
    subscription::{SubscriptionCallback, SubscriptionId, SubscriptionService},
    transport::{RpcTransport, StreamConnector, TransportFactory},
    types::{
        AccountFilter, AccountInfo, Commitment, NotificationPayload, Pubkey, SlotInfo,
        TokenAccountsFilter, TxSignature,
    },
};
