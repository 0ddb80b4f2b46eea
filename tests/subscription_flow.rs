//! End-to-end subscription service flows: streaming delivery, slot
//! debouncing, reconnect with resubscription, and the polling handover.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use solrelay::mock::{MockStreamConnector, MockTransport};
use solrelay::prelude::*;
use solrelay::types::{AccountData, AccountUpdate, SignatureStatus, SignatureUpdate};
use solrelay::{ChannelState, SubscriptionService};

const KEY: &str = "So11111111111111111111111111111111111111112";
const OWNER: &str = "11111111111111111111111111111111";
const SIG: &str = "1111111111111111111111111111111111111111111111111111111111111111";

struct Harness {
    service: SubscriptionService,
    connector: Arc<MockStreamConnector>,
    transport: Arc<MockTransport>,
}

fn harness() -> Harness {
    let mut config = SubscriptionConfig::new(vec![
        EndpointConfig::new("https://one", "one", 1).with_ws_url("wss://one"),
        EndpointConfig::new("https://two", "two", 2).with_ws_url("wss://two"),
    ]);
    config.heartbeat_interval_ms = 1_000;
    config.reconnect_base_delay_ms = 100;
    config.reconnect_max_delay_ms = 2_000;
    config.slot_debounce_ms = 2_000;
    config.poll_interval_ms = 1_000;
    config.channel_recovery_interval_ms = 60_000;

    let connector = Arc::new(MockStreamConnector::new());
    let transport = Arc::new(MockTransport::new("https://http"));
    let service = SubscriptionService::new(
        config,
        Arc::clone(&connector) as Arc<dyn StreamConnector>,
        Arc::clone(&transport) as Arc<dyn RpcTransport>,
    )
    .unwrap();
    Harness { service, connector, transport }
}

fn account(data: &[u8]) -> AccountInfo {
    AccountInfo {
        lamports: 10,
        owner: Pubkey::new(OWNER).unwrap(),
        data: AccountData::from_bytes(data),
        executable: false,
        rent_epoch: 0,
    }
}

fn slot_info(n: u64) -> SlotInfo {
    SlotInfo { slot: n, parent: n.saturating_sub(1), root: n.saturating_sub(32) }
}

#[tokio::test(start_paused = true)]
async fn account_notifications_reach_the_callback() {
    let h = harness();
    h.service.connect().await.unwrap();

    let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let pubkey = Pubkey::new(KEY).unwrap();
    h.service
        .subscribe_account(
            pubkey.clone(),
            Arc::new(move |payload| {
                if let NotificationPayload::Account(update) = payload {
                    sink.lock().unwrap().push(update.account.lamports);
                }
                Ok(())
            }),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let handle = h.connector.last_handle().unwrap();
    let params = solrelay::SubscriptionParams::Account { pubkey: pubkey.clone() };
    let remote = handle.remote_id_of(&params).unwrap();
    handle.push(
        remote,
        NotificationPayload::Account(AccountUpdate {
            pubkey: pubkey.clone(),
            account: account(b"abc"),
            slot: 11,
        }),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(seen.lock().unwrap().clone(), vec![10]);
}

#[tokio::test(start_paused = true)]
async fn slot_notifications_are_debounced_to_one_callback_per_window() {
    let h = harness();
    h.service.connect().await.unwrap();

    let calls_a = Arc::new(AtomicUsize::new(0));
    let last_a = Arc::new(AtomicU64::new(0));
    let (calls, last) = (calls_a.clone(), last_a.clone());
    h.service
        .subscribe_slot(Arc::new(move |payload| {
            if let NotificationPayload::Slot(info) = payload {
                calls.fetch_add(1, Ordering::SeqCst);
                last.store(info.slot, Ordering::SeqCst);
            }
            Ok(())
        }))
        .unwrap();

    let calls_b = Arc::new(AtomicUsize::new(0));
    let counted_b = calls_b.clone();
    h.service
        .subscribe_slot(Arc::new(move |_| {
            counted_b.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // A burst of five server notifications within 500ms.
    let handle = h.connector.last_handle().unwrap();
    for n in 100..=104 {
        handle.push_slot(slot_info(n));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // The debounce window (2s) has not elapsed: no deliveries.
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(calls_a.load(Ordering::SeqCst), 0);
    assert_eq!(calls_b.load(Ordering::SeqCst), 0);

    // Past the window: exactly one delivery per subscriber, latest slot.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(calls_a.load(Ordering::SeqCst), 1);
    assert_eq!(calls_b.load(Ordering::SeqCst), 1);
    assert_eq!(last_a.load(Ordering::SeqCst), 104);
}

#[tokio::test(start_paused = true)]
async fn signature_subscription_fires_exactly_once() {
    let h = harness();
    h.service.connect().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let signature = TxSignature::new(SIG).unwrap();
    let id = h
        .service
        .subscribe_signature(
            signature.clone(),
            Arc::new(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let handle = h.connector.last_handle().unwrap();
    let params = solrelay::SubscriptionParams::Signature { signature: signature.clone() };
    let remote = handle.remote_id_of(&params).unwrap();
    let update = NotificationPayload::Signature(SignatureUpdate {
        signature: signature.clone(),
        status: SignatureStatus {
            slot: 20,
            confirmations: Some(1),
            err: None,
            confirmation_level: Commitment::Confirmed,
        },
    });
    handle.push(remote, update.clone());
    handle.push(remote, update);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.service.active_subscriptions(), 0);
    assert!(!h.service.unsubscribe(id), "entry already removed");
}

#[tokio::test(start_paused = true)]
async fn reconnect_reinstalls_every_subscription_on_the_new_channel() {
    let h = harness();
    h.service.connect().await.unwrap();

    let pubkey = Pubkey::new(KEY).unwrap();
    h.service.subscribe_account(pubkey.clone(), Arc::new(|_| Ok(()))).unwrap();
    h.service.subscribe_slot(Arc::new(|_| Ok(()))).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let first = h.connector.last_handle().unwrap();
    assert_eq!(first.subscriptions().len(), 2);

    // Heartbeat failure forces an unclean reconnect.
    first.set_ping_failing(true);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    assert_eq!(h.service.state(), ChannelState::Connected);
    assert_eq!(h.connector.connect_count(), 2);

    let second = h.connector.last_handle().unwrap();
    assert_eq!(second.subscriptions().len(), 2, "both entries reinstalled");
    assert!(second
        .remote_id_of(&solrelay::SubscriptionParams::Account { pubkey })
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn polling_fallback_detects_account_changes_while_channel_is_down() {
    let h = harness();
    let mut events = h.service.events();
    h.service.connect().await.unwrap();

    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let pubkey = Pubkey::new(KEY).unwrap();
    h.service
        .subscribe_account(
            pubkey.clone(),
            Arc::new(move |payload| {
                if let NotificationPayload::Account(update) = payload {
                    sink.lock().unwrap().push(update.account.data.decode().unwrap_or_default());
                }
                Ok(())
            }),
        )
        .unwrap();
    h.transport.set_account(&pubkey, account(b"D1"));

    // Break the channel for good: every reconnect is refused.
    h.connector.fail_next_connects(u32::MAX);
    h.connector.last_handle().unwrap().disconnect();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.service.is_polling());

    // Two polls of identical data: baseline only, no callback.
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert!(seen.lock().unwrap().is_empty());

    // Data changes: exactly one callback with the new payload.
    h.transport.set_account(&pubkey, account(b"D2"));
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(seen.lock().unwrap().clone(), vec![b"D2".to_vec()]);

    // Lifecycle events appeared in order.
    let mut saw_disconnect = false;
    let mut saw_polling = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ChannelEvent::Disconnected { was_clean, .. } => {
                assert!(!was_clean);
                saw_disconnect = true;
            }
            ChannelEvent::PollingFallbackActivated { polling_interval_ms } => {
                assert_eq!(polling_interval_ms, 1_000);
                saw_polling = true;
            }
            _ => {}
        }
    }
    assert!(saw_disconnect && saw_polling);
}

#[tokio::test(start_paused = true)]
async fn channel_recovery_deactivates_polling_and_resubscribes() {
    let h = harness();
    h.service.connect().await.unwrap();
    h.service.subscribe_slot(Arc::new(|_| Ok(()))).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Two refused reconnects, then recovery.
    h.connector.fail_next_connects(2);
    h.connector.last_handle().unwrap().disconnect();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.service.is_polling());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.service.state(), ChannelState::Connected);
    assert!(!h.service.is_polling());

    let handle = h.connector.last_handle().unwrap();
    assert_eq!(handle.subscriptions().len(), 1, "slot entry back on the channel");
}

#[tokio::test(start_paused = true)]
async fn destroy_leaves_no_running_timers() {
    let h = harness();
    h.service.connect().await.unwrap();
    h.service.subscribe_slot(Arc::new(|_| Ok(()))).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    h.service.destroy();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let connects = h.connector.connect_count();

    // Nothing reconnects, heartbeats, or polls after destroy.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.connect_count(), connects);
    assert_eq!(h.transport.calls().len(), 0);
    assert!(h.service.connect().await.is_err());
}
