//! Facade owning the registry, channel actor, debouncer and polling
//! fallback.
//!
//! Subscriptions are identified by service-assigned ids, monotonically
//! increasing and never reused. At any moment either the streaming
//! channel or the polling fallback services a given subscription, never
//! both: a supervisor task watches the event stream and hands the
//! registry to the poller on a non-clean disconnect, returning it to the
//! channel when it next connects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::{sorted_by_priority, SubscriptionConfig};
use crate::error::RpcError;
use crate::events::{ChannelEvent, EventBus};
use crate::subscription::channel::{ChannelManager, ChannelState, ChannelStatus, ChannelTuning};
use crate::subscription::debounce::SlotDebouncer;
use crate::subscription::polling::PollingFallback;
use crate::subscription::registry::{
    SubscriptionCallback, SubscriptionId, SubscriptionRegistry,
};
use crate::transport::{RpcTransport, StreamConnector, SubscriptionParams};
use crate::types::{AccountFilter, Pubkey, TxSignature};

/// Long-lived subscription service over a supervised streaming channel
/// with an HTTP polling fallback.
pub struct SubscriptionService {
    registry: Arc<Mutex<SubscriptionRegistry>>,
    manager: ChannelManager,
    debouncer: SlotDebouncer,
    polling: Arc<PollingFallback>,
    events: EventBus,
    supervisor: CancellationToken,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for SubscriptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionService")
            .field("status", &self.manager.status())
            .field("polling", &self.polling.is_active())
            .finish_non_exhaustive()
    }
}

impl SubscriptionService {
    /// Build the service. `connector` opens streaming channels;
    /// `transport` (typically the fallback chain) serves the polling
    /// fallback. Must run inside a tokio runtime.
    pub fn new(
        config: SubscriptionConfig,
        connector: Arc<dyn StreamConnector>,
        transport: Arc<dyn RpcTransport>,
    ) -> Result<Self, RpcError> {
        config.validate()?;

        let events = EventBus::new(64);
        let registry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        let debouncer = SlotDebouncer::new(
            Duration::from_millis(config.slot_debounce_ms),
            Arc::clone(&registry),
        );

        let manager = ChannelManager::spawn(
            sorted_by_priority(&config.endpoints),
            connector,
            Arc::clone(&registry),
            debouncer.clone(),
            events.clone(),
            ChannelTuning {
                commitment: config.commitment,
                heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
                reconnect_base: Duration::from_millis(config.reconnect_base_delay_ms),
                reconnect_max: Duration::from_millis(config.reconnect_max_delay_ms),
            },
        );

        let recovery_manager = manager.clone();
        let polling = Arc::new(PollingFallback::new(
            transport,
            Arc::clone(&registry),
            debouncer.clone(),
            events.clone(),
            config.commitment,
            Duration::from_millis(config.poll_interval_ms),
            Duration::from_millis(config.channel_recovery_interval_ms),
            Arc::new(move || recovery_manager.request_recovery()),
        ));

        let supervisor = CancellationToken::new();
        Self::spawn_supervisor(events.subscribe(), Arc::clone(&polling), supervisor.clone());

        Ok(Self {
            registry,
            manager,
            debouncer,
            polling,
            events,
            supervisor,
            destroyed: AtomicBool::new(false),
        })
    }

    /// Watches the channel lifecycle and hands subscriptions between the
    /// channel and the polling fallback.
    fn spawn_supervisor(
        mut events: broadcast::Receiver<ChannelEvent>,
        polling: Arc<PollingFallback>,
        token: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(ChannelEvent::Disconnected { was_clean: false, .. }) => {
                            polling.activate();
                        }
                        Ok(ChannelEvent::Connected { .. }) => polling.deactivate(),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "supervisor lagged behind channel events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn ensure_alive(&self) -> Result<(), RpcError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(RpcError::validation("subscription service destroyed"));
        }
        Ok(())
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, SubscriptionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(
        &self,
        params: SubscriptionParams,
        callback: SubscriptionCallback,
    ) -> Result<SubscriptionId, RpcError> {
        self.ensure_alive()?;
        let kind = params.kind();
        let id = self.lock_registry().insert(params, callback);
        tracing::debug!(id, kind, "subscription registered");
        self.manager.install(id);
        Ok(id)
    }

    /// Open the streaming channel at the highest-priority endpoint.
    pub async fn connect(&self) -> Result<(), RpcError> {
        self.ensure_alive()?;
        self.manager.connect().await
    }

    /// Subscribe to changes of one account.
    pub fn subscribe_account(
        &self,
        pubkey: Pubkey,
        callback: SubscriptionCallback,
    ) -> Result<SubscriptionId, RpcError> {
        self.register(SubscriptionParams::Account { pubkey }, callback)
    }

    /// Subscribe to changes of one token account.
    pub fn subscribe_token_account(
        &self,
        pubkey: Pubkey,
        callback: SubscriptionCallback,
    ) -> Result<SubscriptionId, RpcError> {
        self.register(SubscriptionParams::TokenAccount { pubkey }, callback)
    }

    /// Subscribe to program-account changes, optionally filtered.
    pub fn subscribe_program(
        &self,
        program: Pubkey,
        filters: Vec<AccountFilter>,
        callback: SubscriptionCallback,
    ) -> Result<SubscriptionId, RpcError> {
        self.register(SubscriptionParams::Program { program, filters }, callback)
    }

    /// Subscribe to debounced slot progression.
    pub fn subscribe_slot(
        &self,
        callback: SubscriptionCallback,
    ) -> Result<SubscriptionId, RpcError> {
        self.register(SubscriptionParams::Slot, callback)
    }

    /// Subscribe to the status of one signature. One-shot: the entry is
    /// removed atomically when the first satisfying status is delivered.
    pub fn subscribe_signature(
        &self,
        signature: TxSignature,
        callback: SubscriptionCallback,
    ) -> Result<SubscriptionId, RpcError> {
        self.register(SubscriptionParams::Signature { signature }, callback)
    }

    /// Remove a subscription. Once this returns, the callback for `id`
    /// will never fire again; the remote side is unsubscribed best-effort.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.lock_registry().remove(id) {
            Some(entry) => {
                tracing::debug!(id, kind = entry.params.kind(), "subscription removed");
                self.manager.remove_remote(entry.remote_id);
                true
            }
            None => false,
        }
    }

    /// Receive lifecycle events (connect, disconnect, reconnect, polling
    /// handover).
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ChannelState {
        self.manager.state()
    }

    pub fn status(&self) -> ChannelStatus {
        self.manager.status()
    }

    /// Whether the polling fallback currently services the registry.
    pub fn is_polling(&self) -> bool {
        self.polling.is_active()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.lock_registry().len()
    }

    /// The shared slot debounce window.
    pub fn slot_debounce_window(&self) -> Duration {
        self.debouncer.window()
    }

    /// Permanent teardown: the channel actor, polling loop, pending
    /// debounce flushes and the supervisor all stop; no timers remain.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("subscription service destroyed");
        self.manager.destroy();
        self.polling.deactivate();
        self.debouncer.shutdown();
        self.supervisor.cancel();
    }
}

impl Drop for SubscriptionService {
    fn drop(&mut self) {
        self.destroy();
    }
}
