//! Transport seams consumed by the fallback chain and the subscription
//! service.
//!
//! This crate performs no I/O of its own: concrete HTTP and WebSocket
//! implementations are collaborators supplied by the application. The
//! [`crate::mock`] module provides in-memory implementations used by the
//! test suites.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::endpoint::EndpointConfig;
use crate::error::RpcError;
use crate::types::{
    AccountFilter, AccountInfo, Blockhash, Commitment, KeyedAccount, NotificationPayload, Pubkey,
    SignatureStatus, TokenAccountsFilter, TxSignature,
};

/// Read-only JSON-RPC surface of a single endpoint.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn get_account_info(
        &self,
        pubkey: &Pubkey,
        commitment: Commitment,
    ) -> Result<Option<AccountInfo>, RpcError>;

    async fn get_multiple_accounts(
        &self,
        pubkeys: &[Pubkey],
        commitment: Commitment,
    ) -> Result<Vec<Option<AccountInfo>>, RpcError>;

    async fn get_program_accounts(
        &self,
        program: &Pubkey,
        filters: &[AccountFilter],
        commitment: Commitment,
    ) -> Result<Vec<KeyedAccount>, RpcError>;

    async fn get_token_accounts_by_owner(
        &self,
        owner: &Pubkey,
        filter: &TokenAccountsFilter,
        commitment: Commitment,
    ) -> Result<Vec<KeyedAccount>, RpcError>;

    async fn get_slot(&self, commitment: Commitment) -> Result<u64, RpcError>;

    async fn get_latest_blockhash(&self, commitment: Commitment) -> Result<Blockhash, RpcError>;

    async fn get_signature_status(
        &self,
        signature: &TxSignature,
    ) -> Result<Option<SignatureStatus>, RpcError>;

    /// Provider-specific health query. Capability-gated: only DAS-capable
    /// providers are expected to answer it.
    async fn get_provider_health(&self) -> Result<(), RpcError>;

    /// Method-addressed escape hatch for DAS and other reads the typed
    /// surface does not cover.
    async fn call_raw(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError>;
}

/// Builds one transport handle per endpoint at chain construction.
pub trait TransportFactory: Send + Sync {
    fn create(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn RpcTransport>, RpcError>;
}

/// Parameters of a live subscription, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionParams {
    Account { pubkey: Pubkey },
    TokenAccount { pubkey: Pubkey },
    Program { program: Pubkey, filters: Vec<AccountFilter> },
    Slot,
    Signature { signature: TxSignature },
}

impl SubscriptionParams {
    /// Short tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SubscriptionParams::Account { .. } => "account",
            SubscriptionParams::TokenAccount { .. } => "tokenAccount",
            SubscriptionParams::Program { .. } => "program",
            SubscriptionParams::Slot => "slot",
            SubscriptionParams::Signature { .. } => "signature",
        }
    }
}

/// Notification delivered by a streaming channel, addressed by the remote
/// subscription id the channel assigned at subscribe time.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamNotification {
    pub remote_id: u64,
    pub payload: NotificationPayload,
}

/// One live streaming connection.
///
/// The notification receiver is taken exactly once after connecting; the
/// channel owner routes incoming notifications by remote id. Dropping the
/// channel tears the connection down.
#[async_trait]
pub trait StreamingChannel: Send + Sync {
    /// Install a server-side subscription; returns the remote id.
    async fn subscribe(
        &self,
        params: &SubscriptionParams,
        commitment: Commitment,
    ) -> Result<u64, RpcError>;

    /// Remove a server-side subscription. Best-effort on a broken link.
    async fn unsubscribe(&self, remote_id: u64) -> Result<(), RpcError>;

    /// Lightweight liveness probe.
    async fn ping(&self) -> Result<(), RpcError>;

    /// Take the notification stream. Returns `None` after the first call.
    fn notifications(&mut self) -> Option<mpsc::UnboundedReceiver<StreamNotification>>;
}

/// Opens streaming channels; one per endpoint URL.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamingChannel>, RpcError>;
}
