//! Shared debounce window for slot notifications.
//!
//! Slot notifications arrive from the server at roughly the slot cadence
//! (~0.4 s). The debouncer buffers the newest notification and delivers
//! exactly one callback per window to every registered slot subscriber,
//! so downstream consumers see at most one wake-up per window. Delivery
//! is gated to be monotonically non-decreasing in the slot number.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::subscription::registry::SubscriptionRegistry;
use crate::types::{NotificationPayload, SlotInfo};

#[derive(Debug, Default)]
struct DebounceState {
    latest: Option<SlotInfo>,
    timer_armed: bool,
    last_delivered: Option<u64>,
}

/// Debouncing fan-out of slot notifications to every slot subscriber.
#[derive(Clone)]
pub struct SlotDebouncer {
    window: Duration,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    state: Arc<Mutex<DebounceState>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SlotDebouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotDebouncer").field("window", &self.window).finish_non_exhaustive()
    }
}

impl SlotDebouncer {
    pub fn new(window: Duration, registry: Arc<Mutex<SubscriptionRegistry>>) -> Self {
        Self {
            window,
            registry,
            state: Arc::new(Mutex::new(DebounceState::default())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DebounceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer a server notification. The first notification of a window
    /// arms the flush timer; later ones only refresh the buffered value
    /// (the highest slot wins).
    pub fn offer(&self, info: SlotInfo) {
        let mut state = self.lock_state();
        let newer = state.latest.map(|latest| info.slot > latest.slot).unwrap_or(true);
        if newer {
            state.latest = Some(info);
        }
        if state.timer_armed {
            return;
        }
        state.timer_armed = true;
        drop(state);

        let debouncer = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = debouncer.cancel.cancelled() => {}
                _ = tokio::time::sleep(debouncer.window) => debouncer.flush(),
            }
        });
    }

    fn flush(&self) {
        let info = {
            let mut state = self.lock_state();
            state.timer_armed = false;
            state.latest.take()
        };
        if let Some(info) = info {
            self.deliver(info);
        }
    }

    /// Deliver `info` to every slot subscriber immediately, bypassing the
    /// window but not the monotonic gate. Used by the polling fallback.
    pub fn deliver_now(&self, info: SlotInfo) {
        self.deliver(info);
    }

    fn deliver(&self, info: SlotInfo) {
        {
            let mut state = self.lock_state();
            if state.last_delivered.map(|last| info.slot < last).unwrap_or(false) {
                tracing::debug!(slot = info.slot, "dropping out-of-order slot notification");
                return;
            }
            state.last_delivered = Some(info.slot);
        }

        let subscribers =
            self.registry.lock().unwrap_or_else(PoisonError::into_inner).slot_entries();
        let payload = NotificationPayload::Slot(info);
        for entry in subscribers {
            if let Err(error) = (entry.callback)(&payload) {
                tracing::warn!(
                    subscription = entry.id,
                    error = %error,
                    "slot callback failed"
                );
            }
        }
    }

    /// Cancel any pending flush. Buffered notifications are dropped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::registry::SubscriptionCallback;
    use crate::transport::SubscriptionParams;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn slot(n: u64) -> SlotInfo {
        SlotInfo { slot: n, parent: n.saturating_sub(1), root: n.saturating_sub(32) }
    }

    fn setup(window_ms: u64) -> (SlotDebouncer, Arc<Mutex<SubscriptionRegistry>>) {
        let registry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        let debouncer =
            SlotDebouncer::new(Duration::from_millis(window_ms), Arc::clone(&registry));
        (debouncer, registry)
    }

    fn counting_subscriber(
        registry: &Arc<Mutex<SubscriptionRegistry>>,
    ) -> (Arc<AtomicUsize>, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let last_slot = Arc::new(AtomicU64::new(0));
        let calls_in = calls.clone();
        let last_in = last_slot.clone();
        let callback: SubscriptionCallback = Arc::new(move |payload| {
            if let NotificationPayload::Slot(info) = payload {
                calls_in.fetch_add(1, Ordering::SeqCst);
                last_in.store(info.slot, Ordering::SeqCst);
            }
            Ok(())
        });
        registry.lock().unwrap().insert(SubscriptionParams::Slot, callback);
        (calls, last_slot)
    }

    #[tokio::test(start_paused = true)]
    async fn one_callback_per_window_with_the_latest_slot() {
        let (debouncer, registry) = setup(2_000);
        let (calls, last_slot) = counting_subscriber(&registry);

        for n in 100..=104 {
            debouncer.offer(slot(n));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Within the window: nothing delivered yet.
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // At the window boundary: exactly one delivery of the latest slot.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(last_slot.load(Ordering::SeqCst), 104);

        // No further deliveries without new notifications.
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn every_slot_subscriber_sees_the_same_notification() {
        let (debouncer, registry) = setup(500);
        let (calls_a, last_a) = counting_subscriber(&registry);
        let (calls_b, last_b) = counting_subscriber(&registry);

        debouncer.offer(slot(10));
        debouncer.offer(slot(12));
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(calls_a.load(Ordering::SeqCst), 1);
        assert_eq!(calls_b.load(Ordering::SeqCst), 1);
        assert_eq!(last_a.load(Ordering::SeqCst), 12);
        assert_eq!(last_b.load(Ordering::SeqCst), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn windows_do_not_overlap_and_slots_never_regress() {
        let (debouncer, registry) = setup(1_000);
        let deliveries: Arc<StdMutex<Vec<u64>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = deliveries.clone();
        let callback: SubscriptionCallback = Arc::new(move |payload| {
            if let NotificationPayload::Slot(info) = payload {
                sink.lock().unwrap().push(info.slot);
            }
            Ok(())
        });
        registry.lock().unwrap().insert(SubscriptionParams::Slot, callback);

        debouncer.offer(slot(50));
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        debouncer.offer(slot(51));
        debouncer.offer(slot(53));
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let seen = deliveries.lock().unwrap().clone();
        assert_eq!(seen, vec![50, 53]);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_immediate_delivery_is_dropped() {
        let (debouncer, registry) = setup(100);
        let (calls, last_slot) = counting_subscriber(&registry);

        debouncer.deliver_now(slot(40));
        debouncer.deliver_now(slot(35));
        debouncer.deliver_now(slot(41));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(last_slot.load(Ordering::SeqCst), 41);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_callback_does_not_affect_siblings() {
        let (debouncer, registry) = setup(100);

        let failing: SubscriptionCallback = Arc::new(|_| Err("subscriber exploded".into()));
        registry.lock().unwrap().insert(SubscriptionParams::Slot, failing);
        let (calls, _) = counting_subscriber(&registry);

        debouncer.offer(slot(9));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_pending_flushes() {
        let (debouncer, registry) = setup(1_000);
        let (calls, _) = counting_subscriber(&registry);

        debouncer.offer(slot(5));
        debouncer.shutdown();
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
