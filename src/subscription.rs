//! Long-lived subscription service over a supervised streaming channel.
//!
//! The [`SubscriptionService`] facade owns four cooperating parts:
//! a [`registry`] of subscription entries keyed by service-assigned ids,
//! a [`channel`] manager actor supervising the single live streaming
//! connection (heartbeat, backoff reconnect, endpoint rotation),
//! a shared slot [`debounce`] window, and an HTTP [`polling`] fallback
//! that services the registry while the channel is down.

pub mod channel;
pub mod debounce;
pub mod polling;
pub mod registry;
pub mod service;

pub use channel::{ChannelManager, ChannelState, ChannelStatus};
pub use debounce::SlotDebouncer;
pub use polling::PollingFallback;
pub use registry::{SubscriptionCallback, SubscriptionEntry, SubscriptionId, SubscriptionRegistry};
pub use service::SubscriptionService;
