//! Typed event stream for channel and fallback lifecycle changes.
//!
//! One enum-shaped stream over a broadcast channel replaces string-keyed
//! event emitters: subscribers match on the variant they care about.
//! Breaker state changes and health verdict flips surface through their
//! own typed callbacks instead.

use tokio::sync::broadcast;

/// Lifecycle events observable from the subscription service.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The streaming channel reached the connected state.
    Connected { endpoint: String },
    /// The streaming channel was lost. `was_clean` is false for heartbeat
    /// failures and transport drops.
    Disconnected { reason: String, was_clean: bool },
    /// A reconnect attempt has been scheduled.
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// A channel-level error that did not map to a state change.
    ChannelError { message: String },
    /// HTTP polling has taken over the live subscriptions.
    PollingFallbackActivated { polling_interval_ms: u64 },
    /// The streaming channel took the subscriptions back.
    PollingFallbackDeactivated,
}

/// Broadcast fan-out of [`ChannelEvent`]s.
///
/// Emitting never blocks and never fails: with no subscribers the event is
/// dropped, and a lagging subscriber loses the oldest events first.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChannelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ChannelEvent) {
        tracing::debug!(?event, "channel event");
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_fan_out_to_all_subscribers() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(ChannelEvent::Connected { endpoint: "wss://one".into() });

        let expected = ChannelEvent::Connected { endpoint: "wss://one".into() };
        assert_eq!(a.recv().await.unwrap(), expected);
        assert_eq!(b.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_no_op() {
        let bus = EventBus::new(8);
        bus.emit(ChannelEvent::PollingFallbackDeactivated);
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_events() {
        let bus = EventBus::new(8);
        bus.emit(ChannelEvent::Reconnecting { attempt: 1, delay_ms: 500 });

        let mut rx = bus.subscribe();
        bus.emit(ChannelEvent::PollingFallbackActivated { polling_interval_ms: 30_000 });
        assert_eq!(
            rx.recv().await.unwrap(),
            ChannelEvent::PollingFallbackActivated { polling_interval_ms: 30_000 }
        );
    }
}
