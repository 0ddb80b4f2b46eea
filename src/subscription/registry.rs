//! Registry of live subscription entries.
//!
//! Entries are keyed by service-assigned ids, monotonically increasing
//! from 1 and never reused. The registry itself is synchronous; it is
//! shared behind a mutex that is never held across a suspension point.

use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::{Clock, MonotonicClock};
use crate::error::CallbackError;
use crate::transport::SubscriptionParams;
use crate::types::NotificationPayload;

/// Opaque handle identifying one live subscription.
pub type SubscriptionId = u64;

/// User callback invoked with each delivered notification.
///
/// Failures are logged and swallowed; they never affect sibling callbacks
/// or the service.
pub type SubscriptionCallback =
    Arc<dyn Fn(&NotificationPayload) -> Result<(), CallbackError> + Send + Sync>;

/// One live subscription owned by the service.
#[derive(Clone)]
pub struct SubscriptionEntry {
    pub id: SubscriptionId,
    pub params: SubscriptionParams,
    pub callback: SubscriptionCallback,
    pub created_at_millis: u64,
    /// Handle assigned by the current transport; discarded on reconnect.
    pub remote_id: Option<u64>,
}

impl std::fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("id", &self.id)
            .field("kind", &self.params.kind())
            .field("remote_id", &self.remote_id)
            .finish_non_exhaustive()
    }
}

/// Owned store of subscription entries.
pub struct SubscriptionRegistry {
    entries: HashMap<SubscriptionId, SubscriptionEntry>,
    next_id: SubscriptionId,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("entries", &self.entries.len())
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self { entries: HashMap::new(), next_id: 1, clock: Arc::new(MonotonicClock::default()) }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Create an entry and return its freshly assigned id.
    pub fn insert(
        &mut self,
        params: SubscriptionParams,
        callback: SubscriptionCallback,
    ) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            SubscriptionEntry {
                id,
                params,
                callback,
                created_at_millis: self.clock.now_millis(),
                remote_id: None,
            },
        );
        id
    }

    pub fn remove(&mut self, id: SubscriptionId) -> Option<SubscriptionEntry> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: SubscriptionId) -> Option<&SubscriptionEntry> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn set_remote(&mut self, id: SubscriptionId, remote_id: Option<u64>) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.remote_id = remote_id;
        }
    }

    /// Forget every remote handle, typically after losing the transport.
    pub fn clear_remote_ids(&mut self) {
        for entry in self.entries.values_mut() {
            entry.remote_id = None;
        }
    }

    /// The entry currently bound to a transport-assigned id.
    pub fn find_by_remote(&self, remote_id: u64) -> Option<&SubscriptionEntry> {
        self.entries.values().find(|e| e.remote_id == Some(remote_id))
    }

    /// Snapshot of every entry, in id order.
    pub fn entries(&self) -> Vec<SubscriptionEntry> {
        let mut all: Vec<SubscriptionEntry> = self.entries.values().cloned().collect();
        all.sort_by_key(|e| e.id);
        all
    }

    /// Snapshot of the slot subscriptions, in id order.
    pub fn slot_entries(&self) -> Vec<SubscriptionEntry> {
        let mut slots: Vec<SubscriptionEntry> = self
            .entries
            .values()
            .filter(|e| matches!(e.params, SubscriptionParams::Slot))
            .cloned()
            .collect();
        slots.sort_by_key(|e| e.id);
        slots
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pubkey;

    fn noop_callback() -> SubscriptionCallback {
        Arc::new(|_| Ok(()))
    }

    fn account_params() -> SubscriptionParams {
        SubscriptionParams::Account {
            pubkey: Pubkey::new("So11111111111111111111111111111111111111112").unwrap(),
        }
    }

    #[test]
    fn ids_start_at_one_and_are_never_reused() {
        let mut registry = SubscriptionRegistry::new();
        let a = registry.insert(SubscriptionParams::Slot, noop_callback());
        let b = registry.insert(account_params(), noop_callback());
        assert_eq!(a, 1);
        assert_eq!(b, 2);

        registry.remove(a);
        let c = registry.insert(SubscriptionParams::Slot, noop_callback());
        assert_eq!(c, 3);
        assert!(!registry.contains(a));
    }

    #[test]
    fn remote_ids_bind_and_clear() {
        let mut registry = SubscriptionRegistry::new();
        let id = registry.insert(account_params(), noop_callback());
        registry.set_remote(id, Some(77));

        assert_eq!(registry.find_by_remote(77).map(|e| e.id), Some(id));
        registry.clear_remote_ids();
        assert!(registry.find_by_remote(77).is_none());
        assert_eq!(registry.get(id).and_then(|e| e.remote_id), None);
    }

    #[test]
    fn slot_entries_filters_by_kind() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert(account_params(), noop_callback());
        let slot_a = registry.insert(SubscriptionParams::Slot, noop_callback());
        let slot_b = registry.insert(SubscriptionParams::Slot, noop_callback());

        let slots: Vec<SubscriptionId> = registry.slot_entries().iter().map(|e| e.id).collect();
        assert_eq!(slots, vec![slot_a, slot_b]);
        assert_eq!(registry.len(), 3);
    }
}
