//! Wire-shaped data types shared by the fallback chain and the
//! subscription service.
//!
//! Programs, mints and signatures are base58-encoded values (32 and 64
//! bytes respectively); account data travels base64-encoded; amounts are
//! unsigned 64-bit integers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RpcError;

/// Read-consistency level selected per call or subscription.
///
/// Ordered by strength: `Processed < Confirmed < Finalized`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Commitment::Processed => write!(f, "processed"),
            Commitment::Confirmed => write!(f, "confirmed"),
            Commitment::Finalized => write!(f, "finalized"),
        }
    }
}

fn check_base58(value: &str, expected_len: usize, what: &str) -> Result<(), RpcError> {
    let decoded = bs58::decode(value)
        .into_vec()
        .map_err(|_| RpcError::validation(format!("{} is not valid base58: {:?}", what, value)))?;
    if decoded.len() != expected_len {
        return Err(RpcError::validation(format!(
            "{} must decode to {} bytes, got {}",
            what,
            expected_len,
            decoded.len()
        )));
    }
    Ok(())
}

/// Base58-encoded 32-byte public key (account, program, mint, owner).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pubkey(String);

impl Pubkey {
    pub fn new(value: impl Into<String>) -> Result<Self, RpcError> {
        let value = value.into();
        check_base58(&value, 32, "public key")?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Pubkey {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Pubkey {
    type Error = RpcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Pubkey> for String {
    fn from(value: Pubkey) -> Self {
        value.0
    }
}

/// Base58-encoded 64-byte transaction signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxSignature(String);

impl TxSignature {
    pub fn new(value: impl Into<String>) -> Result<Self, RpcError> {
        let value = value.into();
        check_base58(&value, 64, "transaction signature")?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for TxSignature {
    type Error = RpcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TxSignature> for String {
    fn from(value: TxSignature) -> Self {
        value.0
    }
}

/// Base58-encoded 32-byte block hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blockhash(pub String);

impl fmt::Display for Blockhash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Base64-encoded account data payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AccountData(pub String);

impl AccountData {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(BASE64.encode(bytes))
    }

    pub fn decode(&self) -> Result<Vec<u8>, RpcError> {
        BASE64
            .decode(&self.0)
            .map_err(|e| RpcError::validation(format!("account data is not valid base64: {}", e)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Account state as returned by the info queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub lamports: u64,
    pub owner: Pubkey,
    pub data: AccountData,
    pub executable: bool,
    pub rent_epoch: u64,
}

/// An account paired with its address, as returned by program scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedAccount {
    pub pubkey: Pubkey,
    pub account: AccountInfo,
}

/// Filter applied to program-account scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccountFilter {
    /// Match accounts whose data contains `bytes` (base58) at `offset`.
    #[serde(rename_all = "camelCase")]
    Memcmp { offset: usize, bytes: String },
    /// Match accounts whose data is exactly this many bytes.
    DataSize(u64),
}

/// Selector for token-account-by-owner queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenAccountsFilter {
    /// All token accounts owned through the given token program.
    ByProgram(Pubkey),
    /// Token accounts for one specific mint.
    ByMint(Pubkey),
}

/// Status of a submitted transaction signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureStatus {
    pub slot: u64,
    /// Confirmation count; `None` once rooted.
    pub confirmations: Option<u64>,
    /// Error string when the transaction failed on-chain.
    pub err: Option<String>,
    pub confirmation_level: Commitment,
}

impl SignatureStatus {
    /// Whether this status satisfies the given commitment requirement.
    pub fn satisfies(&self, commitment: Commitment) -> bool {
        self.confirmation_level >= commitment
    }
}

/// Slot progression notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub slot: u64,
    pub parent: u64,
    pub root: u64,
}

/// Account-change notification payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub pubkey: Pubkey,
    pub account: AccountInfo,
    pub slot: u64,
}

/// Program-account-change notification payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramUpdate {
    pub program: Pubkey,
    pub keyed: KeyedAccount,
    pub slot: u64,
}

/// Signature-status notification payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureUpdate {
    pub signature: TxSignature,
    pub status: SignatureStatus,
}

/// Payload delivered to subscription callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationPayload {
    Account(AccountUpdate),
    Program(ProgramUpdate),
    Slot(SlotInfo),
    Signature(SignatureUpdate),
}
