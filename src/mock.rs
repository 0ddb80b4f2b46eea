//! In-memory test doubles for the transport seams.
//!
//! [`MockTransport`] answers the JSON-RPC surface from scriptable
//! in-memory state, and [`MockStreamConnector`]/[`MockChannelHandle`]
//! simulate a streaming channel whose notifications, ping failures and
//! disconnects are driven by the test. The crate's own suites are built
//! on these; downstream crates can use them the same way.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::endpoint::EndpointConfig;
use crate::error::RpcError;
use crate::transport::{
    RpcTransport, StreamConnector, StreamNotification, StreamingChannel, SubscriptionParams,
    TransportFactory,
};
use crate::types::{
    AccountFilter, AccountInfo, Blockhash, Commitment, KeyedAccount, NotificationPayload, Pubkey,
    SignatureStatus, SlotInfo, TokenAccountsFilter, TxSignature,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct TransportState {
    slot: u64,
    blockhash: String,
    accounts: HashMap<String, AccountInfo>,
    program_accounts: HashMap<String, Vec<KeyedAccount>>,
    token_accounts: HashMap<String, Vec<KeyedAccount>>,
    signature_statuses: HashMap<String, SignatureStatus>,
    raw_responses: HashMap<String, serde_json::Value>,
    provider_healthy: bool,
    failure: Option<RpcError>,
    /// `None` while a failure is set means fail forever.
    fail_remaining: Option<u32>,
    delay: Option<Duration>,
    calls: Vec<String>,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            slot: 1_000,
            blockhash: "11111111111111111111111111111111".to_string(),
            accounts: HashMap::new(),
            program_accounts: HashMap::new(),
            token_accounts: HashMap::new(),
            signature_statuses: HashMap::new(),
            raw_responses: HashMap::new(),
            provider_healthy: true,
            failure: None,
            fail_remaining: None,
            delay: None,
            calls: Vec::new(),
        }
    }
}

/// Scriptable in-memory [`RpcTransport`].
#[derive(Clone)]
pub struct MockTransport {
    url: String,
    state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), state: Arc::new(Mutex::new(TransportState::default())) }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_slot(&self, slot: u64) {
        lock(&self.state).slot = slot;
    }

    pub fn advance_slot(&self, by: u64) {
        lock(&self.state).slot += by;
    }

    pub fn set_blockhash(&self, blockhash: impl Into<String>) {
        lock(&self.state).blockhash = blockhash.into();
    }

    pub fn set_account(&self, pubkey: &Pubkey, account: AccountInfo) {
        lock(&self.state).accounts.insert(pubkey.to_string(), account);
    }

    pub fn clear_account(&self, pubkey: &Pubkey) {
        lock(&self.state).accounts.remove(pubkey.as_str());
    }

    pub fn set_program_accounts(&self, program: &Pubkey, accounts: Vec<KeyedAccount>) {
        lock(&self.state).program_accounts.insert(program.to_string(), accounts);
    }

    pub fn set_token_accounts(&self, owner: &Pubkey, accounts: Vec<KeyedAccount>) {
        lock(&self.state).token_accounts.insert(owner.to_string(), accounts);
    }

    pub fn set_signature_status(&self, signature: &TxSignature, status: SignatureStatus) {
        lock(&self.state).signature_statuses.insert(signature.to_string(), status);
    }

    pub fn set_raw_response(&self, method: impl Into<String>, response: serde_json::Value) {
        lock(&self.state).raw_responses.insert(method.into(), response);
    }

    pub fn set_provider_healthy(&self, healthy: bool) {
        lock(&self.state).provider_healthy = healthy;
    }

    /// Fail every call with `error` until [`succeed`](Self::succeed).
    pub fn always_fail(&self, error: RpcError) {
        let mut state = lock(&self.state);
        state.failure = Some(error);
        state.fail_remaining = None;
    }

    /// Fail the next `times` calls with `error`, then recover.
    pub fn fail_times(&self, times: u32, error: RpcError) {
        let mut state = lock(&self.state);
        state.failure = Some(error);
        state.fail_remaining = Some(times);
    }

    pub fn succeed(&self) {
        let mut state = lock(&self.state);
        state.failure = None;
        state.fail_remaining = None;
    }

    /// Delay every call, to simulate a slow endpoint.
    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        lock(&self.state).calls.iter().filter(|m| m.as_str() == method).count()
    }

    /// Record the call, honor the failure script, and return any
    /// configured delay.
    fn gate(&self, method: &str) -> (Result<(), RpcError>, Option<Duration>) {
        let mut state = lock(&self.state);
        state.calls.push(method.to_string());
        let delay = state.delay;
        let scripted = state.failure.clone();
        let result = match (scripted, state.fail_remaining) {
            (Some(error), None) => Err(error),
            (Some(error), Some(remaining)) if remaining > 0 => {
                let remaining = remaining - 1;
                if remaining == 0 {
                    state.failure = None;
                    state.fail_remaining = None;
                } else {
                    state.fail_remaining = Some(remaining);
                }
                Err(error)
            }
            _ => Ok(()),
        };
        (result, delay)
    }

    async fn enter(&self, method: &str) -> Result<(), RpcError> {
        let (result, delay) = self.gate(method);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result.map_err(|e| e.with_endpoint(self.url.clone()).with_operation(method))
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn get_account_info(
        &self,
        pubkey: &Pubkey,
        _commitment: Commitment,
    ) -> Result<Option<AccountInfo>, RpcError> {
        self.enter("getAccountInfo").await?;
        Ok(lock(&self.state).accounts.get(pubkey.as_str()).cloned())
    }

    async fn get_multiple_accounts(
        &self,
        pubkeys: &[Pubkey],
        _commitment: Commitment,
    ) -> Result<Vec<Option<AccountInfo>>, RpcError> {
        self.enter("getMultipleAccounts").await?;
        let state = lock(&self.state);
        Ok(pubkeys.iter().map(|k| state.accounts.get(k.as_str()).cloned()).collect())
    }

    async fn get_program_accounts(
        &self,
        program: &Pubkey,
        filters: &[AccountFilter],
        _commitment: Commitment,
    ) -> Result<Vec<KeyedAccount>, RpcError> {
        self.enter("getProgramAccounts").await?;
        let state = lock(&self.state);
        let accounts = state.program_accounts.get(program.as_str()).cloned().unwrap_or_default();
        Ok(accounts
            .into_iter()
            .filter(|keyed| filters.iter().all(|f| filter_matches(f, &keyed.account)))
            .collect())
    }

    async fn get_token_accounts_by_owner(
        &self,
        owner: &Pubkey,
        _filter: &TokenAccountsFilter,
        _commitment: Commitment,
    ) -> Result<Vec<KeyedAccount>, RpcError> {
        self.enter("getTokenAccountsByOwner").await?;
        Ok(lock(&self.state).token_accounts.get(owner.as_str()).cloned().unwrap_or_default())
    }

    async fn get_slot(&self, _commitment: Commitment) -> Result<u64, RpcError> {
        self.enter("getSlot").await?;
        Ok(lock(&self.state).slot)
    }

    async fn get_latest_blockhash(&self, _commitment: Commitment) -> Result<Blockhash, RpcError> {
        self.enter("getLatestBlockhash").await?;
        Ok(Blockhash(lock(&self.state).blockhash.clone()))
    }

    async fn get_signature_status(
        &self,
        signature: &TxSignature,
    ) -> Result<Option<SignatureStatus>, RpcError> {
        self.enter("getSignatureStatuses").await?;
        Ok(lock(&self.state).signature_statuses.get(signature.as_str()).cloned())
    }

    async fn get_provider_health(&self) -> Result<(), RpcError> {
        self.enter("getHealth").await?;
        if lock(&self.state).provider_healthy {
            Ok(())
        } else {
            Err(RpcError::rpc(Some(-32005), "node is unhealthy")
                .with_endpoint(self.url.clone())
                .with_operation("getHealth"))
        }
    }

    async fn call_raw(
        &self,
        method: &str,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        self.enter(method).await?;
        lock(&self.state).raw_responses.get(method).cloned().ok_or_else(|| {
            RpcError::rpc(Some(-32601), format!("method not scripted: {}", method))
                .with_endpoint(self.url.clone())
                .with_operation(method)
        })
    }
}

fn filter_matches(filter: &AccountFilter, account: &AccountInfo) -> bool {
    match filter {
        AccountFilter::DataSize(size) => {
            account.data.decode().map(|d| d.len() as u64 == *size).unwrap_or(false)
        }
        AccountFilter::Memcmp { offset, bytes } => {
            let offset = *offset;
            let Ok(data) = account.data.decode() else { return false };
            let Ok(needle) = bs58::decode(bytes).into_vec() else { return false };
            data.len() >= offset + needle.len()
                && data[offset..offset + needle.len()] == needle[..]
        }
    }
}

/// Factory handing one shared [`MockTransport`] per endpoint URL.
#[derive(Default)]
pub struct MockTransportFactory {
    transports: Mutex<HashMap<String, Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport for `url`, created on first use.
    pub fn transport(&self, url: &str) -> Arc<MockTransport> {
        let mut transports = lock(&self.transports);
        Arc::clone(
            transports
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(MockTransport::new(url))),
        )
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn RpcTransport>, RpcError> {
        Ok(self.transport(&endpoint.url))
    }
}

struct ChannelShared {
    url: String,
    next_id: AtomicU64,
    subs: Mutex<Vec<(u64, SubscriptionParams)>>,
    unsubscribed: Mutex<Vec<u64>>,
    ping_failing: AtomicBool,
    subscribe_failing: AtomicBool,
    tx: Mutex<Option<mpsc::UnboundedSender<StreamNotification>>>,
}

/// Test-side controls of one mock streaming channel.
#[derive(Clone)]
pub struct MockChannelHandle {
    shared: Arc<ChannelShared>,
}

impl MockChannelHandle {
    pub fn url(&self) -> String {
        self.shared.url.clone()
    }

    /// Deliver a notification addressed to `remote_id`. Returns false when
    /// the channel has been disconnected.
    pub fn push(&self, remote_id: u64, payload: NotificationPayload) -> bool {
        match lock(&self.shared.tx).as_ref() {
            Some(tx) => tx.send(StreamNotification { remote_id, payload }).is_ok(),
            None => false,
        }
    }

    /// Deliver a slot notification to every live slot subscription.
    pub fn push_slot(&self, info: SlotInfo) {
        let slot_ids: Vec<u64> = lock(&self.shared.subs)
            .iter()
            .filter(|(_, params)| matches!(params, SubscriptionParams::Slot))
            .map(|(id, _)| *id)
            .collect();
        for id in slot_ids {
            self.push(id, NotificationPayload::Slot(info));
        }
    }

    /// The remote id the channel assigned to `params`, if subscribed.
    pub fn remote_id_of(&self, params: &SubscriptionParams) -> Option<u64> {
        lock(&self.shared.subs).iter().find(|(_, p)| p == params).map(|(id, _)| *id)
    }

    pub fn subscriptions(&self) -> Vec<(u64, SubscriptionParams)> {
        lock(&self.shared.subs).clone()
    }

    pub fn unsubscribed(&self) -> Vec<u64> {
        lock(&self.shared.unsubscribed).clone()
    }

    pub fn set_ping_failing(&self, failing: bool) {
        self.shared.ping_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_subscribe_failing(&self, failing: bool) {
        self.shared.subscribe_failing.store(failing, Ordering::SeqCst);
    }

    /// Sever the notification stream, as a dropped connection would.
    pub fn disconnect(&self) {
        lock(&self.shared.tx).take();
    }
}

struct MockChannel {
    shared: Arc<ChannelShared>,
    rx: Option<mpsc::UnboundedReceiver<StreamNotification>>,
}

#[async_trait]
impl StreamingChannel for MockChannel {
    async fn subscribe(
        &self,
        params: &SubscriptionParams,
        _commitment: Commitment,
    ) -> Result<u64, RpcError> {
        if self.shared.subscribe_failing.load(Ordering::SeqCst) {
            return Err(RpcError::network("subscribe refused", true)
                .with_endpoint(self.shared.url.clone()));
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.subs).push((id, params.clone()));
        Ok(id)
    }

    async fn unsubscribe(&self, remote_id: u64) -> Result<(), RpcError> {
        lock(&self.shared.subs).retain(|(id, _)| *id != remote_id);
        lock(&self.shared.unsubscribed).push(remote_id);
        Ok(())
    }

    async fn ping(&self) -> Result<(), RpcError> {
        if self.shared.ping_failing.load(Ordering::SeqCst) {
            Err(RpcError::network("heartbeat probe failed", true)
                .with_endpoint(self.shared.url.clone()))
        } else {
            Ok(())
        }
    }

    fn notifications(&mut self) -> Option<mpsc::UnboundedReceiver<StreamNotification>> {
        self.rx.take()
    }
}

struct ConnectorState {
    fail_remaining: u32,
    connects: Vec<String>,
    handles: Vec<MockChannelHandle>,
}

/// Scriptable [`StreamConnector`]: every successful connect produces a new
/// channel whose [`MockChannelHandle`] the test can drive.
pub struct MockStreamConnector {
    state: Mutex<ConnectorState>,
}

impl Default for MockStreamConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStreamConnector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectorState {
                fail_remaining: 0,
                connects: Vec::new(),
                handles: Vec::new(),
            }),
        }
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        lock(&self.state).fail_remaining = n;
    }

    /// URLs dialed, in order.
    pub fn connects(&self) -> Vec<String> {
        lock(&self.state).connects.clone()
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects.len()
    }

    /// Handle of the most recently created channel.
    pub fn last_handle(&self) -> Option<MockChannelHandle> {
        lock(&self.state).handles.last().cloned()
    }

    pub fn handles(&self) -> Vec<MockChannelHandle> {
        lock(&self.state).handles.clone()
    }
}

#[async_trait]
impl StreamConnector for MockStreamConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamingChannel>, RpcError> {
        let mut state = lock(&self.state);
        state.connects.push(url.to_string());
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(RpcError::network("connection refused", true).with_endpoint(url));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ChannelShared {
            url: url.to_string(),
            next_id: AtomicU64::new(1),
            subs: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            ping_failing: AtomicBool::new(false),
            subscribe_failing: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
        });
        state.handles.push(MockChannelHandle { shared: Arc::clone(&shared) });
        Ok(Box::new(MockChannel { shared, rx: Some(rx) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "So11111111111111111111111111111111111111112";

    #[tokio::test]
    async fn transport_serves_scripted_accounts() {
        let transport = MockTransport::new("https://a");
        let pubkey = Pubkey::new(KEY).unwrap();
        let account = AccountInfo {
            lamports: 5,
            owner: Pubkey::new("11111111111111111111111111111111").unwrap(),
            data: crate::types::AccountData::from_bytes(b"hello"),
            executable: false,
            rent_epoch: 0,
        };
        transport.set_account(&pubkey, account.clone());

        let got = transport.get_account_info(&pubkey, Commitment::Confirmed).await.unwrap();
        assert_eq!(got, Some(account));
        assert_eq!(transport.call_count("getAccountInfo"), 1);
    }

    #[tokio::test]
    async fn failure_script_recovers_after_n_calls() {
        let transport = MockTransport::new("https://a");
        transport.fail_times(2, RpcError::network("down", true));

        assert!(transport.get_slot(Commitment::Confirmed).await.is_err());
        assert!(transport.get_slot(Commitment::Confirmed).await.is_err());
        assert_eq!(transport.get_slot(Commitment::Confirmed).await.unwrap(), 1_000);
    }

    #[tokio::test]
    async fn channel_assigns_remote_ids_and_routes_pushes() {
        let connector = MockStreamConnector::new();
        let mut channel = connector.connect("wss://a").await.unwrap();
        let mut rx = channel.notifications().unwrap();
        let handle = connector.last_handle().unwrap();

        let id = channel.subscribe(&SubscriptionParams::Slot, Commitment::Confirmed).await.unwrap();
        assert_eq!(handle.remote_id_of(&SubscriptionParams::Slot), Some(id));

        handle.push_slot(SlotInfo { slot: 7, parent: 6, root: 5 });
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.remote_id, id);
        assert_eq!(notification.payload, NotificationPayload::Slot(SlotInfo { slot: 7, parent: 6, root: 5 }));

        handle.disconnect();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn connector_can_refuse_connections() {
        let connector = MockStreamConnector::new();
        connector.fail_next_connects(1);
        assert!(connector.connect("wss://a").await.is_err());
        assert!(connector.connect("wss://a").await.is_ok());
        assert_eq!(connector.connect_count(), 2);
    }
}
