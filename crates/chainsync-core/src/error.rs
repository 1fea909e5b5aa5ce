//! Error types for the chainsync pipeline.

use thiserror::Error;

/// Errors that can occur while syncing chain events into the store.
///
/// Only transport and storage failures abort a batch; decode and enrichment
/// problems are absorbed where they happen and never reach the loop.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Upstream RPC failure (timeout, connection, rate limit).
    #[error("RPC error: {0}")]
    Transport(String),

    /// A single log could not be decoded into a typed event.
    #[error("decode error for {event} at {location}: {reason}")]
    Decode {
        event: String,
        location: String,
        reason: String,
    },

    /// Reference data for a projection could not be resolved.
    #[error("enrichment lookup failed for {key}: {reason}")]
    Enrichment { key: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    /// Missing or invalid configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// One event family failed to fetch; the whole batch is failed with it.
    #[error("event family '{family}' failed: {reason}")]
    FamilyFailed { family: String, reason: String },

    #[error("checkpoint regression: last indexed block is {current}, refused to move to {attempted}")]
    CheckpointRegression { current: u64, attempted: u64 },

    #[error("Handler error in '{handler}': {reason}")]
    Handler { handler: String, reason: String },

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },
}

impl SyncError {
    /// Returns `true` for upstream transport failures (category a).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::FamilyFailed { .. })
    }

    /// Returns `true` if this error must fail the current batch so that the
    /// same range is retried unchanged.
    pub fn aborts_batch(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::FamilyFailed { .. }
                | Self::Storage(_)
                | Self::Handler { .. }
                | Self::CheckpointRegression { .. }
        )
    }

    /// Short label used in logs and the error history table.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Decode { .. } => "decode",
            Self::Enrichment { .. } => "enrichment",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::FamilyFailed { .. } => "family",
            Self::CheckpointRegression { .. } => "checkpoint",
            Self::Handler { .. } => "handler",
            Self::Aborted { .. } => "aborted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_and_storage_abort() {
        assert!(SyncError::Transport("timeout".into()).aborts_batch());
        assert!(SyncError::Storage("connection reset".into()).aborts_batch());
        assert!(SyncError::FamilyFailed {
            family: "markets".into(),
            reason: "429".into()
        }
        .aborts_batch());

        assert!(!SyncError::Decode {
            event: "PoolCreated".into(),
            location: "0xabc:3".into(),
            reason: "short data".into()
        }
        .aborts_batch());
        assert!(!SyncError::Enrichment {
            key: "0x01".into(),
            reason: "missing".into()
        }
        .aborts_batch());
    }

    #[test]
    fn family_failure_counts_as_transport() {
        let err = SyncError::FamilyFailed {
            family: "wagers".into(),
            reason: "connection refused".into(),
        };
        assert!(err.is_transport());
        assert_eq!(err.kind(), "family");
    }
}
