//! Indexer progress state.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::types::BlockRange;

/// Default capacity of the recent-error ring buffer.
pub const DEFAULT_ERROR_HISTORY: usize = 100;

/// One recorded batch failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Unix timestamp (seconds).
    pub at: i64,
    pub kind: String,
    pub message: String,
    /// The range that was being processed, if any.
    pub range: Option<BlockRange>,
}

impl ErrorEntry {
    pub fn from_error(err: &SyncError, range: Option<BlockRange>) -> Self {
        Self {
            at: chrono::Utc::now().timestamp(),
            kind: err.kind().to_string(),
            message: err.to_string(),
            range,
        }
    }
}

/// Process-wide indexing progress. One row per indexer, never deleted.
///
/// Only [`CheckpointManager`](crate::checkpoint::CheckpointManager) mutates
/// it; everything else reads a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerState {
    pub indexer_id: String,
    /// Highest block whose events are fully projected. Never decreases.
    pub last_indexed_block: u64,
    pub total_blocks_processed: u64,
    pub total_events_processed: u64,
    /// Most recent failures, oldest first.
    pub recent_errors: VecDeque<ErrorEntry>,
    pub last_error_at: Option<i64>,
    pub updated_at: i64,
}

impl IndexerState {
    /// A fresh state positioned just before the first block to index.
    pub fn seeded(indexer_id: impl Into<String>, last_indexed_block: u64) -> Self {
        Self {
            indexer_id: indexer_id.into(),
            last_indexed_block,
            total_blocks_processed: 0,
            total_events_processed: 0,
            recent_errors: VecDeque::new(),
            last_error_at: None,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// The first block not yet indexed.
    pub fn next_block(&self) -> u64 {
        self.last_indexed_block.saturating_add(1)
    }

    /// Return a copy advanced past `range`.
    ///
    /// Fails if the range would move `last_indexed_block` backwards.
    pub fn advanced(&self, range: BlockRange, events: u64) -> Result<Self, SyncError> {
        if range.to < self.last_indexed_block {
            return Err(SyncError::CheckpointRegression {
                current: self.last_indexed_block,
                attempted: range.to,
            });
        }
        let mut next = self.clone();
        next.last_indexed_block = range.to;
        next.total_blocks_processed += range.len();
        next.total_events_processed += events;
        next.updated_at = chrono::Utc::now().timestamp();
        Ok(next)
    }

    /// Append to the bounded error buffer, evicting the oldest entries.
    pub fn push_error(&mut self, entry: ErrorEntry, capacity: usize) {
        self.last_error_at = Some(entry.at);
        self.recent_errors.push_back(entry);
        while self.recent_errors.len() > capacity.max(1) {
            self.recent_errors.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_accumulates_counters() {
        let s = IndexerState::seeded("idx", 99);
        assert_eq!(s.next_block(), 100);

        let s = s.advanced(BlockRange::new(100, 199), 7).unwrap();
        assert_eq!(s.last_indexed_block, 199);
        assert_eq!(s.total_blocks_processed, 100);
        assert_eq!(s.total_events_processed, 7);

        let s = s.advanced(BlockRange::new(200, 204), 0).unwrap();
        assert_eq!(s.last_indexed_block, 204);
        assert_eq!(s.total_blocks_processed, 105);
    }

    #[test]
    fn advance_refuses_regression() {
        let s = IndexerState::seeded("idx", 500);
        let err = s.advanced(BlockRange::new(10, 20), 0).unwrap_err();
        assert!(matches!(
            err,
            SyncError::CheckpointRegression { current: 500, attempted: 20 }
        ));
    }

    #[test]
    fn error_buffer_is_bounded() {
        let mut s = IndexerState::seeded("idx", 0);
        for i in 0..150 {
            let err = SyncError::Transport(format!("boom {i}"));
            s.push_error(ErrorEntry::from_error(&err, None), DEFAULT_ERROR_HISTORY);
        }
        assert_eq!(s.recent_errors.len(), 100);
        assert!(s.recent_errors.front().unwrap().message.contains("boom 50"));
        assert!(s.recent_errors.back().unwrap().message.contains("boom 149"));
        assert!(s.last_error_at.is_some());
    }
}
