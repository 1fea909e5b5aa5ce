//! Transport-level error types.

use chainsync_core::SyncError;
use thiserror::Error;

use crate::request::JsonRpcError;

/// JSON-RPC error code used by several providers for "limit exceeded".
const RPC_LIMIT_EXCEEDED: i64 = -32005;

/// Errors that can occur while talking to an upstream endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, 5xx, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Rate limit exceeded; the caller should back off.
    #[error("Rate limit exceeded (provider: {provider})")]
    RateLimited { provider: String },

    /// Every endpoint in the pool has an open circuit.
    #[error("All providers unavailable")]
    AllProvidersDown,

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` for transient failures that count against an
    /// endpoint's health and are worth retrying elsewhere.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Timeout { .. } | Self::RateLimited { .. }
        )
    }

    /// Map a node error, recognising rate-limit responses.
    pub fn from_rpc(provider: &str, err: JsonRpcError) -> Self {
        let msg = err.message.to_ascii_lowercase();
        if err.code == RPC_LIMIT_EXCEEDED
            || err.code == 429
            || msg.contains("rate limit")
            || msg.contains("too many requests")
        {
            Self::RateLimited {
                provider: provider.to_string(),
            }
        } else {
            Self::Rpc(err)
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        SyncError::Transport(e.to_string())
    }
}
