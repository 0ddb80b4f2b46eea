//! Error taxonomy for RPC routing and streaming.
//!
//! Every fallible operation in this crate returns [`RpcError`]: a stable
//! category (`kind`), a human message, and a context bag recording the
//! originating endpoint and operation. Expected failures are values, never
//! panics; user-callback failures are logged and swallowed at the call
//! site, not propagated through the service.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::endpoint::Capability;

/// Error type returned by user-supplied subscription and cache callbacks.
///
/// Callback failures never influence the component that invoked them; they
/// are logged and dropped.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// JSON-RPC numeric codes retried by the default predicate.
pub const RETRYABLE_RPC_CODES: [i64; 7] = [-32000, -32005, -32603, 429, 502, 503, 504];

/// Context attached to an error as it propagates: the endpoint it came
/// from, the operation that produced it, and free-form details.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorContext {
    pub endpoint: Option<String>,
    pub operation: Option<String>,
    pub details: BTreeMap<String, Value>,
}

impl ErrorContext {
    fn is_empty(&self) -> bool {
        self.endpoint.is_none() && self.operation.is_none() && self.details.is_empty()
    }
}

/// Error category with a stable wire-level meaning.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    /// Malformed input or invalid configuration. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Transport-level failure (refused connection, broken stream, ...).
    #[error("network error: {message}")]
    Network { message: String, retryable: bool },
    /// A single attempt exceeded its deadline.
    #[error("operation timed out after {elapsed_ms}ms (limit {timeout_ms}ms)")]
    Timeout { elapsed_ms: u64, timeout_ms: u64 },
    /// The server answered with a protocol-level error.
    #[error("rpc error (code {code:?}): {message}")]
    Rpc { code: Option<i64>, message: String },
    /// The provider reported request throttling.
    #[error("rate limited: {message}")]
    RateLimit { message: String },
    /// The local circuit breaker rejected the call.
    #[error("circuit breaker open after {failure_count} failures; recover at {recover_at_millis}ms")]
    CircuitOpen { failure_count: u32, recover_at_millis: u64 },
    /// No endpoint in the pool satisfies the required capabilities.
    #[error("no eligible endpoint for capabilities {required:?}")]
    PoolExhausted { required: Vec<Capability> },
    /// The remote resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// The crate-wide error: a tagged [`ErrorKind`] plus [`ErrorContext`].
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    kind: ErrorKind,
    context: ErrorContext,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if self.context.is_empty() {
            return Ok(());
        }
        write!(f, " [")?;
        let mut sep = "";
        if let Some(op) = &self.context.operation {
            write!(f, "{}op={}", sep, op)?;
            sep = ", ";
        }
        if let Some(endpoint) = &self.context.endpoint {
            write!(f, "{}endpoint={}", sep, endpoint)?;
            sep = ", ";
        }
        if !self.context.details.is_empty() {
            write!(f, "{}details={}", sep, self.context.details.len())?;
        }
        write!(f, "]")
    }
}

impl std::error::Error for RpcError {}

impl From<ErrorKind> for RpcError {
    fn from(kind: ErrorKind) -> Self {
        Self { kind, context: ErrorContext::default() }
    }
}

impl RpcError {
    pub fn validation(message: impl Into<String>) -> Self {
        ErrorKind::Validation(message.into()).into()
    }

    pub fn network(message: impl Into<String>, retryable: bool) -> Self {
        ErrorKind::Network { message: message.into(), retryable }.into()
    }

    pub fn timeout(elapsed_ms: u64, timeout_ms: u64) -> Self {
        ErrorKind::Timeout { elapsed_ms, timeout_ms }.into()
    }

    pub fn rpc(code: Option<i64>, message: impl Into<String>) -> Self {
        ErrorKind::Rpc { code, message: message.into() }.into()
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        ErrorKind::RateLimit { message: message.into() }.into()
    }

    pub fn circuit_open(failure_count: u32, recover_at_millis: u64) -> Self {
        ErrorKind::CircuitOpen { failure_count, recover_at_millis }.into()
    }

    pub fn pool_exhausted(required: Vec<Capability>) -> Self {
        ErrorKind::PoolExhausted { required }.into()
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ErrorKind::NotFound(message.into()).into()
    }

    /// Attach the endpoint URL the error originated from.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.context.endpoint = Some(endpoint.into());
        self
    }

    /// Attach the logical operation name (e.g. `getAccountInfo`).
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.context.operation = Some(operation.into());
        self
    }

    /// Attach a free-form detail to the context bag.
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.details.insert(key.into(), value);
        self
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Stable category code for logs and classification.
    pub fn code(&self) -> &'static str {
        match self.kind {
            ErrorKind::Validation(_) => "validation",
            ErrorKind::Network { .. } => "network",
            ErrorKind::Timeout { .. } => "timeout",
            ErrorKind::Rpc { .. } => "rpc",
            ErrorKind::RateLimit { .. } => "rate-limit",
            ErrorKind::CircuitOpen { .. } => "circuit-open",
            ErrorKind::PoolExhausted { .. } => "pool-exhausted",
            ErrorKind::NotFound(_) => "not-found",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self.kind, ErrorKind::CircuitOpen { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::NotFound(_))
    }

    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self.kind, ErrorKind::PoolExhausted { .. })
    }

    /// The fixed retryable-error predicate.
    ///
    /// Validation, not-found, pool-exhausted and circuit-open errors are
    /// terminal: the first two are caller mistakes, the latter two are
    /// handled by routing (the chain advances) rather than by retrying the
    /// same endpoint.
    pub fn is_default_retryable(&self) -> bool {
        match &self.kind {
            ErrorKind::Network { retryable: true, .. } => true,
            ErrorKind::Network { message, retryable: false } => looks_transient(message),
            ErrorKind::Timeout { .. } => true,
            ErrorKind::RateLimit { .. } => true,
            ErrorKind::Rpc { code: None, .. } => true,
            ErrorKind::Rpc { code: Some(code), message } => {
                RETRYABLE_RPC_CODES.contains(code) || looks_transient(message)
            }
            ErrorKind::Validation(_)
            | ErrorKind::CircuitOpen { .. }
            | ErrorKind::PoolExhausted { .. }
            | ErrorKind::NotFound(_) => false,
        }
    }
}

/// Heuristic transient-failure sniff over a server-provided message.
fn looks_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    const NEEDLES: [&str; 10] = [
        "timeout",
        "network",
        "connection",
        "503",
        "502",
        "504",
        "429",
        "temporary",
        "transient",
        "rate limit",
    ];
    NEEDLES.iter().any(|n| lower.contains(n))
        || lower.contains("ratelimit")
        || lower.contains("rate-limit")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = RpcError::network("connection refused", true)
            .with_endpoint("https://rpc.example.com")
            .with_operation("getSlot");
        let msg = err.to_string();
        assert!(msg.contains("connection refused"));
        assert!(msg.contains("op=getSlot"));
        assert!(msg.contains("endpoint=https://rpc.example.com"));
    }

    #[test]
    fn display_without_context_is_bare() {
        let err = RpcError::not_found("account missing");
        assert_eq!(err.to_string(), "not found: account missing");
    }

    #[test]
    fn stable_codes() {
        assert_eq!(RpcError::validation("x").code(), "validation");
        assert_eq!(RpcError::timeout(10, 5).code(), "timeout");
        assert_eq!(RpcError::rate_limit("x").code(), "rate-limit");
        assert_eq!(RpcError::circuit_open(3, 99).code(), "circuit-open");
        assert_eq!(RpcError::pool_exhausted(vec![]).code(), "pool-exhausted");
    }

    #[test]
    fn retryable_network_and_timeout() {
        assert!(RpcError::network("refused", true).is_default_retryable());
        assert!(!RpcError::network("bad handshake", false).is_default_retryable());
        assert!(RpcError::timeout(5_001, 5_000).is_default_retryable());
        assert!(RpcError::rate_limit("slow down").is_default_retryable());
    }

    #[test]
    fn retryable_rpc_codes() {
        for code in RETRYABLE_RPC_CODES {
            assert!(RpcError::rpc(Some(code), "x").is_default_retryable(), "code {}", code);
        }
        assert!(RpcError::rpc(None, "no code supplied").is_default_retryable());
        assert!(!RpcError::rpc(Some(-32602), "invalid params").is_default_retryable());
    }

    #[test]
    fn transient_messages_are_retryable() {
        assert!(RpcError::rpc(Some(-1), "upstream Connection reset").is_default_retryable());
        assert!(RpcError::rpc(Some(-1), "Rate limit exceeded").is_default_retryable());
        assert!(RpcError::rpc(Some(-1), "temporary outage").is_default_retryable());
        assert!(RpcError::network("socket ratelimited", false).is_default_retryable());
        assert!(!RpcError::rpc(Some(-1), "account does not exist").is_default_retryable());
    }

    #[test]
    fn terminal_kinds_never_retry() {
        assert!(!RpcError::validation("bad pubkey").is_default_retryable());
        assert!(!RpcError::not_found("missing").is_default_retryable());
        assert!(!RpcError::circuit_open(5, 1_000).is_default_retryable());
        assert!(!RpcError::pool_exhausted(vec![Capability::Das]).is_default_retryable());
    }

    #[test]
    fn context_details_round_trip() {
        let err = RpcError::rpc(Some(429), "busy")
            .with_detail("attempt", serde_json::json!(2))
            .with_detail("method", serde_json::json!("getAssetsByOwner"));
        assert_eq!(err.context().details.len(), 2);
        assert_eq!(err.context().details["attempt"], serde_json::json!(2));
    }
}
