//! HTTP polling fallback for live subscriptions.
//!
//! Activated when the streaming channel suffers a non-clean disconnect
//! and deactivated when it next reaches connected. While active, the
//! fallback periodically polls each registry entry over the HTTP
//! transport (typically the fallback chain) with change detection, and on
//! a second cadence nudges the channel manager to retry recovery.
//!
//! Change detection is deliberately simple. Account and token-account
//! entries compare the encoded data payload against a baseline
//! established on the first poll (which never notifies). Program entries
//! compare only the sorted set of matching account addresses, so a
//! mutation inside a stable address set goes unnoticed; this is a known
//! limitation of the polling path. Slot entries are delivered
//! unconditionally once per cycle, with parent and root approximated
//! from the head slot. Per-entry poll errors are swallowed and retried
//! on the next cycle.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;
use crate::events::{ChannelEvent, EventBus};
use crate::subscription::debounce::SlotDebouncer;
use crate::subscription::registry::{SubscriptionEntry, SubscriptionId, SubscriptionRegistry};
use crate::transport::{RpcTransport, SubscriptionParams};
use crate::types::{
    AccountUpdate, Commitment, NotificationPayload, ProgramUpdate, SignatureUpdate, SlotInfo,
};

/// Finalization depth used to approximate the root slot while polling.
const APPROX_FINALIZED_DEPTH: u64 = 32;

#[derive(Debug, Clone, PartialEq)]
enum Baseline {
    /// Encoded account data payload; `None` for a missing account.
    Data(Option<String>),
    /// Sorted addresses matching a program scan.
    Addresses(Vec<String>),
}

/// Change-detection poller servicing the registry while the channel is
/// down.
pub struct PollingFallback {
    transport: Arc<dyn RpcTransport>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    debouncer: SlotDebouncer,
    events: EventBus,
    commitment: Commitment,
    poll_interval: Duration,
    recovery_interval: Duration,
    recovery: Arc<dyn Fn() + Send + Sync>,
    active: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for PollingFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingFallback")
            .field("poll_interval", &self.poll_interval)
            .field("recovery_interval", &self.recovery_interval)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl PollingFallback {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: Arc<dyn RpcTransport>,
        registry: Arc<Mutex<SubscriptionRegistry>>,
        debouncer: SlotDebouncer,
        events: EventBus,
        commitment: Commitment,
        poll_interval: Duration,
        recovery_interval: Duration,
        recovery: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            transport,
            registry,
            debouncer,
            events,
            commitment,
            poll_interval,
            recovery_interval,
            recovery,
            active: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Start polling. Idempotent while active. Baselines are established
    /// fresh on each activation.
    pub fn activate(self: &Arc<Self>) {
        let token = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if active.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *active = Some(token.clone());
            token
        };

        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "polling fallback activated"
        );
        self.events.emit(ChannelEvent::PollingFallbackActivated {
            polling_interval_ms: self.poll_interval.as_millis() as u64,
        });

        let fallback = Arc::clone(self);
        tokio::spawn(async move { fallback.run(token).await });
    }

    /// Stop polling, typically because the channel recovered.
    pub fn deactivate(&self) {
        let token = self.active.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(token) = token {
            token.cancel();
            tracing::info!("polling fallback deactivated");
            self.events.emit(ChannelEvent::PollingFallbackDeactivated);
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut baselines: HashMap<SubscriptionId, Baseline> = HashMap::new();
        let mut next_poll = Instant::now() + self.poll_interval;
        let mut next_recovery = Instant::now() + self.recovery_interval;

        loop {
            let deadline = next_poll.min(next_recovery);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    let now = Instant::now();
                    if now >= next_poll {
                        next_poll = now + self.poll_interval;
                        self.poll_cycle(&mut baselines).await;
                    }
                    if now >= next_recovery {
                        next_recovery = now + self.recovery_interval;
                        tracing::debug!("nudging channel recovery");
                        (self.recovery)();
                    }
                }
            }
        }
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, SubscriptionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn poll_cycle(&self, baselines: &mut HashMap<SubscriptionId, Baseline>) {
        let entries = self.lock_registry().entries();
        baselines.retain(|id, _| entries.iter().any(|e| e.id == *id));

        let head = match self.transport.get_slot(self.commitment).await {
            Ok(slot) => Some(slot),
            Err(error) => {
                tracing::debug!(error = %error, "head slot poll failed");
                None
            }
        };

        // Slot subscribers are served once per cycle, unconditionally.
        if let Some(slot) = head {
            let has_slot_entries =
                entries.iter().any(|e| matches!(e.params, SubscriptionParams::Slot));
            if has_slot_entries {
                self.debouncer.deliver_now(SlotInfo {
                    slot,
                    parent: slot.saturating_sub(1),
                    root: slot.saturating_sub(APPROX_FINALIZED_DEPTH),
                });
            }
        }

        for entry in &entries {
            if matches!(entry.params, SubscriptionParams::Slot) {
                continue;
            }
            if let Err(error) = self.poll_entry(entry, baselines, head).await {
                tracing::debug!(
                    id = entry.id,
                    kind = entry.params.kind(),
                    error = %error,
                    "poll failed; retrying next cycle"
                );
            }
        }
    }

    async fn poll_entry(
        &self,
        entry: &SubscriptionEntry,
        baselines: &mut HashMap<SubscriptionId, Baseline>,
        head: Option<u64>,
    ) -> Result<(), RpcError> {
        match &entry.params {
            SubscriptionParams::Account { pubkey }
            | SubscriptionParams::TokenAccount { pubkey } => {
                let account = self.transport.get_account_info(pubkey, self.commitment).await?;
                let current = account.as_ref().map(|a| a.data.0.clone());
                let previous = baselines.get(&entry.id).cloned();

                match previous {
                    None => {
                        // First poll establishes the baseline silently.
                        baselines.insert(entry.id, Baseline::Data(current));
                    }
                    Some(Baseline::Data(prev)) if prev == current => {}
                    _ => {
                        baselines.insert(entry.id, Baseline::Data(current));
                        if let Some(account) = account {
                            let payload = NotificationPayload::Account(AccountUpdate {
                                pubkey: pubkey.clone(),
                                account,
                                slot: head.unwrap_or(0),
                            });
                            invoke(entry, &payload);
                        }
                    }
                }
            }
            SubscriptionParams::Program { program, filters } => {
                let accounts =
                    self.transport.get_program_accounts(program, filters, self.commitment).await?;
                let mut addresses: Vec<String> =
                    accounts.iter().map(|k| k.pubkey.to_string()).collect();
                addresses.sort();
                let previous = baselines.get(&entry.id).cloned();

                match previous {
                    None => {
                        baselines.insert(entry.id, Baseline::Addresses(addresses));
                    }
                    Some(Baseline::Addresses(prev)) if prev == addresses => {}
                    previous => {
                        let known: HashSet<String> = match previous {
                            Some(Baseline::Addresses(prev)) => prev.into_iter().collect(),
                            _ => HashSet::new(),
                        };
                        for keyed in &accounts {
                            if !known.contains(keyed.pubkey.as_str()) {
                                let payload = NotificationPayload::Program(ProgramUpdate {
                                    program: program.clone(),
                                    keyed: keyed.clone(),
                                    slot: head.unwrap_or(0),
                                });
                                invoke(entry, &payload);
                            }
                        }
                        baselines.insert(entry.id, Baseline::Addresses(addresses));
                    }
                }
            }
            SubscriptionParams::Signature { signature } => {
                let status = self.transport.get_signature_status(signature).await?;
                if let Some(status) = status {
                    if status.satisfies(self.commitment) {
                        // One-shot: remove from registry and polling set
                        // before delivering, so a second delivery is
                        // impossible.
                        let removed = self.lock_registry().remove(entry.id).is_some();
                        baselines.remove(&entry.id);
                        if removed {
                            let payload = NotificationPayload::Signature(SignatureUpdate {
                                signature: signature.clone(),
                                status,
                            });
                            invoke(entry, &payload);
                        }
                    }
                }
            }
            SubscriptionParams::Slot => {
                // Handled once per cycle in poll_cycle.
            }
        }
        Ok(())
    }
}

fn invoke(entry: &SubscriptionEntry, payload: &NotificationPayload) {
    if let Err(error) = (entry.callback)(payload) {
        tracing::warn!(id = entry.id, error = %error, "subscription callback failed");
    }
}
