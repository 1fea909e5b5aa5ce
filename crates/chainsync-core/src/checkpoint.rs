//! Checkpoint manager, the single durability point of the engine.
//!
//! State is persisted once per successful batch, never mid-batch. On restart
//! the indexer resumes from `last_indexed_block` rather than re-indexing from
//! scratch.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::state::{ErrorEntry, IndexerState, DEFAULT_ERROR_HISTORY};
use crate::types::BlockRange;

/// A sparse marker that a block has been durably accounted for.
///
/// Written for every block that carried events and for every multiple of the
/// checkpoint interval. Operational visibility only; resuming uses
/// [`IndexerState::last_indexed_block`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointBlock {
    pub block_number: u64,
    pub event_count: u32,
    pub recorded_at: i64,
}

/// Trait for persisting indexer progress.
///
/// Implementations: `MemoryCheckpointStore` here, plus the in-memory, SQLite
/// and Postgres backends in `chainsync-storage`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_state(&self, indexer_id: &str) -> Result<Option<IndexerState>, SyncError>;

    /// Upsert the state row. Backends must never lower `last_indexed_block`.
    async fn save_state(&self, state: &IndexerState) -> Result<(), SyncError>;

    /// Append one entry to the error history.
    async fn append_error(&self, indexer_id: &str, entry: &ErrorEntry) -> Result<(), SyncError>;

    async fn record_checkpoint_blocks(
        &self,
        indexer_id: &str,
        blocks: &[CheckpointBlock],
    ) -> Result<(), SyncError>;

    /// Most recent checkpoint blocks, newest first.
    async fn recent_checkpoint_blocks(
        &self,
        indexer_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckpointBlock>, SyncError>;
}

/// When to write state and checkpoint blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistPolicy {
    /// Write a checkpoint block every N blocks (0 disables interval markers).
    pub checkpoint_block_interval: u64,
    /// 0 persists every batch. Otherwise a batch with no events is persisted
    /// only when its range crosses a multiple of this value; skipped batches
    /// are re-scanned after a crash.
    pub empty_batch_persist_interval: u64,
    /// Capacity of the recent-error ring buffer.
    pub error_history: usize,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self {
            checkpoint_block_interval: 100,
            empty_batch_persist_interval: 0,
            error_history: DEFAULT_ERROR_HISTORY,
        }
    }
}

/// Result of committing one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// State and checkpoint blocks were written.
    Persisted,
    /// State advanced in memory only; a later batch will persist it.
    Deferred,
}

/// Owns the [`IndexerState`] and decides when it reaches the store.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    policy: PersistPolicy,
    state: IndexerState,
    pending_blocks: Vec<CheckpointBlock>,
    dirty: bool,
}

impl CheckpointManager {
    /// Load the saved state, or seed a new one at `seed_last_indexed` and
    /// persist it immediately.
    pub async fn load_or_seed(
        store: Arc<dyn CheckpointStore>,
        indexer_id: &str,
        policy: PersistPolicy,
        seed_last_indexed: u64,
    ) -> Result<Self, SyncError> {
        let state = match store.load_state(indexer_id).await? {
            Some(state) => {
                debug!(
                    indexer_id,
                    last_indexed = state.last_indexed_block,
                    "resuming from saved state"
                );
                state
            }
            None => {
                let state = IndexerState::seeded(indexer_id, seed_last_indexed);
                store.save_state(&state).await?;
                debug!(indexer_id, seed_last_indexed, "seeded new indexer state");
                state
            }
        };
        Ok(Self {
            store,
            policy,
            state,
            pending_blocks: Vec::new(),
            dirty: false,
        })
    }

    /// Load the saved state without seeding (read-only callers).
    pub async fn load(
        store: &dyn CheckpointStore,
        indexer_id: &str,
    ) -> Result<Option<IndexerState>, SyncError> {
        store.load_state(indexer_id).await
    }

    pub fn state(&self) -> &IndexerState {
        &self.state
    }

    pub fn last_indexed_block(&self) -> u64 {
        self.state.last_indexed_block
    }

    /// Returns `true` if the in-memory state is ahead of the store.
    pub fn has_unpersisted_progress(&self) -> bool {
        self.dirty
    }

    /// Record a fully applied batch.
    ///
    /// `block_events` maps block number → number of events applied in it.
    /// The in-memory state only moves if the write (when one is due) succeeds,
    /// so a storage failure leaves the range to be retried.
    pub async fn commit_batch(
        &mut self,
        range: BlockRange,
        block_events: &BTreeMap<u64, u32>,
    ) -> Result<CommitOutcome, SyncError> {
        let events: u64 = block_events.values().map(|&n| u64::from(n)).sum();
        let next = self.state.advanced(range, events)?;

        let mut blocks = self.checkpoint_blocks_for(range, block_events);
        let persist = self.should_persist(range, events);

        if persist {
            let mut all = std::mem::take(&mut self.pending_blocks);
            all.append(&mut blocks);
            if let Err(e) = self.flush_state(&next, &all).await {
                self.pending_blocks = all;
                return Err(e);
            }
            self.state = next;
            self.dirty = false;
            Ok(CommitOutcome::Persisted)
        } else {
            self.pending_blocks.append(&mut blocks);
            self.state = next;
            self.dirty = true;
            Ok(CommitOutcome::Deferred)
        }
    }

    /// Write any deferred progress (called on shutdown).
    pub async fn flush(&mut self) -> Result<(), SyncError> {
        if !self.dirty {
            return Ok(());
        }
        let blocks = std::mem::take(&mut self.pending_blocks);
        let state = self.state.clone();
        if let Err(e) = self.flush_state(&state, &blocks).await {
            self.pending_blocks = blocks;
            return Err(e);
        }
        self.dirty = false;
        Ok(())
    }

    /// Record a batch failure in the ring buffer and the error history.
    ///
    /// History writes are best effort: a failing store must not mask the
    /// original error.
    pub async fn record_error(&mut self, err: &SyncError, range: Option<BlockRange>) {
        let entry = ErrorEntry::from_error(err, range);
        if let Err(store_err) = self
            .store
            .append_error(&self.state.indexer_id, &entry)
            .await
        {
            warn!(error = %store_err, "failed to append error history");
        }
        self.state.push_error(entry, self.policy.error_history);
    }

    async fn flush_state(
        &self,
        state: &IndexerState,
        blocks: &[CheckpointBlock],
    ) -> Result<(), SyncError> {
        if !blocks.is_empty() {
            self.store
                .record_checkpoint_blocks(&state.indexer_id, blocks)
                .await?;
        }
        self.store.save_state(state).await
    }

    fn should_persist(&self, range: BlockRange, events: u64) -> bool {
        let interval = self.policy.empty_batch_persist_interval;
        interval == 0 || events > 0 || range.crosses_multiple_of(interval)
    }

    fn checkpoint_blocks_for(
        &self,
        range: BlockRange,
        block_events: &BTreeMap<u64, u32>,
    ) -> Vec<CheckpointBlock> {
        let now = chrono::Utc::now().timestamp();
        let mut marks: BTreeMap<u64, u32> = block_events
            .iter()
            .filter(|(b, n)| **n > 0 && **b >= range.from && **b <= range.to)
            .map(|(b, n)| (*b, *n))
            .collect();

        let interval = self.policy.checkpoint_block_interval;
        if interval > 0 && range.crosses_multiple_of(interval) {
            let mut b = range.from.div_ceil(interval) * interval;
            while b <= range.to {
                marks.entry(b).or_insert(0);
                match b.checked_add(interval) {
                    Some(n) => b = n,
                    None => break,
                }
            }
        }

        marks
            .into_iter()
            .map(|(block_number, event_count)| CheckpointBlock {
                block_number,
                event_count,
                recorded_at: now,
            })
            .collect()
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory checkpoint store for tests and ephemeral indexers.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    states: Mutex<HashMap<String, IndexerState>>,
    errors: Mutex<HashMap<String, Vec<ErrorEntry>>>,
    blocks: Mutex<HashMap<String, BTreeMap<u64, CheckpointBlock>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full error history for an indexer, oldest first.
    pub fn error_history(&self, indexer_id: &str) -> Vec<ErrorEntry> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(indexer_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load_state(&self, indexer_id: &str) -> Result<Option<IndexerState>, SyncError> {
        Ok(self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(indexer_id)
            .cloned())
    }

    async fn save_state(&self, state: &IndexerState) -> Result<(), SyncError> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let mut row = state.clone();
        if let Some(prev) = states.get(&state.indexer_id) {
            row.last_indexed_block = row.last_indexed_block.max(prev.last_indexed_block);
        }
        states.insert(state.indexer_id.clone(), row);
        Ok(())
    }

    async fn append_error(&self, indexer_id: &str, entry: &ErrorEntry) -> Result<(), SyncError> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(indexer_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn record_checkpoint_blocks(
        &self,
        indexer_id: &str,
        blocks: &[CheckpointBlock],
    ) -> Result<(), SyncError> {
        let mut all = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = all.entry(indexer_id.to_string()).or_default();
        for b in blocks {
            entry.insert(b.block_number, b.clone());
        }
        Ok(())
    }

    async fn recent_checkpoint_blocks(
        &self,
        indexer_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckpointBlock>, SyncError> {
        Ok(self
            .blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(indexer_id)
            .map(|m| m.values().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(pairs: &[(u64, u32)]) -> BTreeMap<u64, u32> {
        pairs.iter().copied().collect()
    }

    #[tokio::test]
    async fn seeds_and_persists_on_first_run() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mgr = CheckpointManager::load_or_seed(store.clone(), "idx", PersistPolicy::default(), 999)
            .await
            .unwrap();
        assert_eq!(mgr.last_indexed_block(), 999);
        let saved = store.load_state("idx").await.unwrap().unwrap();
        assert_eq!(saved.last_indexed_block, 999);
    }

    #[tokio::test]
    async fn resumes_existing_state_instead_of_seed() {
        let store = Arc::new(MemoryCheckpointStore::new());
        store.save_state(&IndexerState::seeded("idx", 5_000)).await.unwrap();

        let mgr = CheckpointManager::load_or_seed(store, "idx", PersistPolicy::default(), 10)
            .await
            .unwrap();
        assert_eq!(mgr.last_indexed_block(), 5_000);
    }

    #[tokio::test]
    async fn commit_persists_state_and_marks() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut mgr = CheckpointManager::load_or_seed(store.clone(), "idx", PersistPolicy::default(), 149)
            .await
            .unwrap();

        let outcome = mgr
            .commit_batch(BlockRange::new(150, 249), &events(&[(170, 2), (171, 1)]))
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Persisted);

        let saved = store.load_state("idx").await.unwrap().unwrap();
        assert_eq!(saved.last_indexed_block, 249);
        assert_eq!(saved.total_blocks_processed, 100);
        assert_eq!(saved.total_events_processed, 3);

        let marks: Vec<u64> = store
            .recent_checkpoint_blocks("idx", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.block_number)
            .collect();
        assert_eq!(marks, vec![200, 171, 170]);
    }

    #[tokio::test]
    async fn empty_batches_deferred_until_interval() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let policy = PersistPolicy {
            empty_batch_persist_interval: 100,
            ..Default::default()
        };
        let mut mgr = CheckpointManager::load_or_seed(store.clone(), "idx", policy, 109)
            .await
            .unwrap();

        let outcome = mgr
            .commit_batch(BlockRange::new(110, 149), &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Deferred);
        assert_eq!(mgr.last_indexed_block(), 149);
        assert!(mgr.has_unpersisted_progress());
        // Store still has the seed: a crash here re-scans 110..=149.
        assert_eq!(store.load_state("idx").await.unwrap().unwrap().last_indexed_block, 109);

        // A batch with events is always persisted.
        let outcome = mgr
            .commit_batch(BlockRange::new(150, 159), &events(&[(155, 1)]))
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Persisted);
        assert_eq!(store.load_state("idx").await.unwrap().unwrap().last_indexed_block, 159);

        // An empty batch crossing block 200 is persisted.
        mgr.commit_batch(BlockRange::new(160, 169), &BTreeMap::new()).await.unwrap();
        let outcome = mgr
            .commit_batch(BlockRange::new(170, 209), &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Persisted);
        assert_eq!(store.load_state("idx").await.unwrap().unwrap().last_indexed_block, 209);
        assert!(!mgr.has_unpersisted_progress());
    }

    #[tokio::test]
    async fn flush_writes_deferred_progress() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let policy = PersistPolicy {
            empty_batch_persist_interval: 1_000,
            ..Default::default()
        };
        let mut mgr = CheckpointManager::load_or_seed(store.clone(), "idx", policy, 0)
            .await
            .unwrap();
        mgr.commit_batch(BlockRange::new(1, 50), &BTreeMap::new()).await.unwrap();
        mgr.flush().await.unwrap();
        assert_eq!(store.load_state("idx").await.unwrap().unwrap().last_indexed_block, 50);
    }

    #[tokio::test]
    async fn record_error_fills_history_and_buffer() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut mgr = CheckpointManager::load_or_seed(store.clone(), "idx", PersistPolicy::default(), 0)
            .await
            .unwrap();
        let err = SyncError::Transport("connection refused".into());
        mgr.record_error(&err, Some(BlockRange::new(1, 10))).await;

        assert_eq!(mgr.state().recent_errors.len(), 1);
        assert_eq!(store.error_history("idx").len(), 1);
        assert_eq!(store.error_history("idx")[0].kind, "transport");
    }

    #[tokio::test]
    async fn store_never_lowers_last_indexed() {
        let store = MemoryCheckpointStore::new();
        store.save_state(&IndexerState::seeded("idx", 800)).await.unwrap();
        store.save_state(&IndexerState::seeded("idx", 700)).await.unwrap();
        assert_eq!(store.load_state("idx").await.unwrap().unwrap().last_indexed_block, 800);
    }
}
