#![forbid(unsafe_code)]

//! # solrelay
//!
//! Client-side resilience and streaming for read-only Solana portfolio
//! workloads: a capability-aware RPC fallback chain and a supervised
//! subscription service, built from small composable parts.
//!
//! ## Features
//!
//! - **Fallback chain** over a priority-ordered endpoint pool, with
//!   per-endpoint circuit breakers, token-bucket rate limiting and DAS
//!   capability routing
//! - **Resilience primitives**: circuit breaker with half-open recovery,
//!   retry policies with exponential/linear/fixed/fibonacci backoff and
//!   jitter
//! - **Health monitoring** with hysteretic per-endpoint verdicts
//! - **Subscriptions** (account, token account, program, slot, signature)
//!   over a heartbeat-supervised streaming channel, with backoff
//!   reconnect, endpoint rotation, slot debouncing and an HTTP polling
//!   fallback
//! - **LRU+TTL cache** used as the health-caching and memoization
//!   substrate
//!
//! The crate performs no I/O itself: HTTP and WebSocket transports are
//! collaborators behind the [`transport`] traits, and the [`mock`] module
//! ships in-memory implementations for testing.
//!
//! ## Quick Start
//!
//! ```rust
//! use solrelay::mock::MockTransportFactory;
//! use solrelay::prelude::*;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), RpcError> {
//!     let endpoints = vec![
//!         EndpointConfig::new("https://rpc.primary.example.com", "primary", 1)
//!             .with_capabilities([Capability::Standard, Capability::Das])
//!             .with_rate_limit(50.0, 100),
//!         EndpointConfig::new("https://rpc.backup.example.com", "backup", 2),
//!     ];
//!
//!     // Swap in a real HTTP transport factory in production.
//!     let factory = MockTransportFactory::new();
//!     let chain = RpcFallbackChain::new(FallbackChainConfig::new(endpoints), &factory)?;
//!
//!     let slot = chain.slot(None).await?;
//!     assert!(slot > 0);
//!
//!     let assets = chain
//!         .call("getAssetsByOwner", serde_json::json!({"ownerAddress": "..."}))
//!         .await;
//!     // Routed to the DAS-capable endpoint only; the backup is never
//!     // asked for a method it cannot serve.
//!     let _ = assets;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod cache;
pub mod chain;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod health;
pub mod jitter;
pub mod mock;
pub mod rate_limit;
pub mod retry;
pub mod sleeper;
pub mod subscription;
pub mod transport;
pub mod types;

// Re-exports
pub use backoff::{Backoff, MAX_BACKOFF};
pub use cache::{CacheStats, RemovalCallback, TtlCache};
pub use chain::{ChainMetrics, EndpointReport, ExecuteOptions, RpcFallbackChain};
pub use circuit_breaker::{
    BreakerMetrics, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{BreakerDefaults, FallbackChainConfig, SubscriptionConfig};
pub use endpoint::{
    is_das_method, BreakerOverrides, Capability, EndpointConfig, EndpointMetrics, RateLimitConfig,
    DAS_METHODS,
};
pub use error::{CallbackError, ErrorContext, ErrorKind, RpcError, RETRYABLE_RPC_CODES};
pub use events::{ChannelEvent, EventBus};
pub use health::{EndpointHealth, HealthMonitor, HealthMonitorConfig};
pub use jitter::Jitter;
pub use rate_limit::TokenBucket;
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use subscription::{
    ChannelManager, ChannelState, ChannelStatus, PollingFallback, SlotDebouncer,
    SubscriptionCallback, SubscriptionId, SubscriptionService,
};
pub use transport::{
    RpcTransport, StreamConnector, StreamNotification, StreamingChannel, SubscriptionParams,
    TransportFactory,
};
pub use types::Commitment;

pub mod prelude;
