//! In-memory storage backend.
//!
//! Holds projections, the audit log and checkpoint state in RAM. Useful for
//! tests and short-lived indexers that don't need persistence.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chainsync_core::checkpoint::{CheckpointBlock, CheckpointStore, MemoryCheckpointStore};
use chainsync_core::error::SyncError;
use chainsync_core::projection::{
    CyclePatch, CycleRow, EnrichmentSource, FixtureInfo, PoolPatch, PoolRow, PoolTotals, PrizeClaimRow,
    ProjectionCounts, ProjectionStore, ProjectionWrite, ReputationActionRow, RewardClaimRow,
    SlipRow, StakeRow, UserReputationRow,
};
use chainsync_core::state::{ErrorEntry, IndexerState};
use chainsync_core::types::{EventKey, RawEventRecord};

#[derive(Debug, Default, PartialEq)]
struct Tables {
    pools: BTreeMap<String, PoolRow>,
    stakes: BTreeMap<(String, u32), StakeRow>,
    /// Stake keys per pool id.
    pool_stakes: BTreeMap<String, BTreeSet<(String, u32)>>,
    reward_claims: BTreeMap<(String, String), RewardClaimRow>,
    cycles: BTreeMap<String, CycleRow>,
    slips: BTreeMap<String, SlipRow>,
    prize_claims: BTreeMap<(String, String), PrizeClaimRow>,
    reputation_actions: BTreeMap<(String, u32), ReputationActionRow>,
    users: BTreeMap<String, UserReputationRow>,
    raw_events: BTreeMap<EventKey, RawEventRecord>,
}

/// What a commit changed, newest last, so a failed batch can be put back.
enum Undo {
    Pool(String, Option<PoolRow>),
    NewStake((String, u32)),
    RewardClaim((String, String), Option<RewardClaimRow>),
    Cycle(String, Option<CycleRow>),
    Slip(String, Option<SlipRow>),
    PrizeClaim((String, String), Option<PrizeClaimRow>),
    NewAction((String, u32)),
    User(String, Option<UserReputationRow>),
    NewRawEvent(EventKey),
}

fn restore<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, old: Option<V>) {
    match old {
        Some(row) => {
            map.insert(key, row);
        }
        None => {
            map.remove(&key);
        }
    }
}

impl Tables {
    fn apply(&mut self, write: &ProjectionWrite, undo: &mut Vec<Undo>) -> Result<(), SyncError> {
        match write {
            ProjectionWrite::Pool(patch) => {
                self.merge_pool(patch, undo);
            }
            ProjectionWrite::Stake(stake) => {
                let key = (stake.tx_hash.clone(), stake.log_index);
                let fresh = !self.stakes.contains_key(&key);
                let pool = self.merge_pool(&PoolPatch::touch(&stake.pool_id, stake.block_number), undo);
                if fresh {
                    let mut totals = PoolTotals::of(pool);
                    totals.add(stake)?;
                    totals.apply_to(pool);
                    self.pool_stakes
                        .entry(stake.pool_id.clone())
                        .or_default()
                        .insert(key.clone());
                    self.stakes.insert(key.clone(), stake.clone());
                    undo.push(Undo::NewStake(key));
                }
            }
            ProjectionWrite::RewardClaim(claim) => {
                let key = (claim.pool_id.clone(), claim.claimant.clone());
                let old = self.reward_claims.insert(key.clone(), claim.clone());
                undo.push(Undo::RewardClaim(key, old));
            }
            ProjectionWrite::Cycle(patch) => {
                self.merge_cycle(patch, undo);
            }
            ProjectionWrite::Slip(patch) => {
                let old = self.slips.remove(&patch.slip_id);
                let fresh = old.is_none();
                let row = SlipRow::merged(old.clone(), patch);
                let cycle_id = row.cycle_id.clone();
                self.slips.insert(patch.slip_id.clone(), row);
                undo.push(Undo::Slip(patch.slip_id.clone(), old));
                let cycle = self.merge_cycle(&CyclePatch::touch(cycle_id, patch.block_number), undo);
                if fresh {
                    cycle.slip_count += 1;
                }
            }
            ProjectionWrite::PrizeClaim(claim) => {
                let key = (claim.cycle_id.clone(), claim.player.clone());
                let old = self.prize_claims.insert(key.clone(), claim.clone());
                undo.push(Undo::PrizeClaim(key, old));
            }
            ProjectionWrite::ReputationAction(action) => {
                let key = (action.tx_hash.clone(), action.log_index);
                if self.reputation_actions.contains_key(&key) {
                    return Ok(());
                }
                let user = action.user_address.clone();
                let old = self.users.get(&user).cloned();
                let mut row = old.clone().unwrap_or_else(|| UserReputationRow::empty(&user));
                row.record(action)?;
                self.users.insert(user.clone(), row);
                undo.push(Undo::User(user, old));
                self.reputation_actions.insert(key.clone(), action.clone());
                undo.push(Undo::NewAction(key));
            }
            ProjectionWrite::RawEvent(record) => {
                if !self.raw_events.contains_key(&record.key) {
                    self.raw_events.insert(record.key.clone(), record.clone());
                    undo.push(Undo::NewRawEvent(record.key.clone()));
                }
            }
        }
        Ok(())
    }

    fn merge_pool(&mut self, patch: &PoolPatch, undo: &mut Vec<Undo>) -> &mut PoolRow {
        let old = self.pools.remove(&patch.pool_id);
        let row = PoolRow::merged(old.clone(), patch);
        undo.push(Undo::Pool(patch.pool_id.clone(), old));
        self.pools.entry(patch.pool_id.clone()).or_insert(row)
    }

    fn merge_cycle(&mut self, patch: &CyclePatch, undo: &mut Vec<Undo>) -> &mut CycleRow {
        let old = self.cycles.remove(&patch.cycle_id);
        let row = CycleRow::merged(old.clone(), patch);
        undo.push(Undo::Cycle(patch.cycle_id.clone(), old));
        self.cycles.entry(patch.cycle_id.clone()).or_insert(row)
    }

    fn rollback(&mut self, undo: Vec<Undo>) {
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Pool(key, old) => restore(&mut self.pools, key, old),
                Undo::NewStake(key) => {
                    let Some(stake) = self.stakes.remove(&key) else {
                        continue;
                    };
                    if let Some(keys) = self.pool_stakes.get_mut(&stake.pool_id) {
                        keys.remove(&key);
                        if keys.is_empty() {
                            self.pool_stakes.remove(&stake.pool_id);
                        }
                    }
                }
                Undo::RewardClaim(key, old) => restore(&mut self.reward_claims, key, old),
                Undo::Cycle(key, old) => restore(&mut self.cycles, key, old),
                Undo::Slip(key, old) => restore(&mut self.slips, key, old),
                Undo::PrizeClaim(key, old) => restore(&mut self.prize_claims, key, old),
                Undo::NewAction(key) => {
                    self.reputation_actions.remove(&key);
                }
                Undo::User(key, old) => restore(&mut self.users, key, old),
                Undo::NewRawEvent(key) => {
                    self.raw_events.remove(&key);
                }
            }
        }
    }

    fn counts(&self) -> ProjectionCounts {
        ProjectionCounts {
            pools: self.pools.len() as u64,
            bets: self.stakes.len() as u64,
            reward_claims: self.reward_claims.len() as u64,
            cycles: self.cycles.len() as u64,
            slips: self.slips.len() as u64,
            prize_claims: self.prize_claims.len() as u64,
            reputation_actions: self.reputation_actions.len() as u64,
            users: self.users.len() as u64,
            raw_events: self.raw_events.len() as u64,
        }
    }
}

/// In-memory projection, checkpoint and fixture storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: Mutex<Tables>,
    checkpoints: MemoryCheckpointStore,
    fixtures: Mutex<HashMap<String, FixtureInfo>>,
    failing_commits: AtomicU32,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register fixture metadata for a market id.
    pub fn insert_fixture(&self, market_id: impl Into<String>, fixture: FixtureInfo) {
        self.fixtures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(market_id.into(), fixture);
    }

    /// Make the next `n` commits fail with a storage error (fault injection).
    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Full error history for an indexer, oldest first.
    pub fn error_history(&self, indexer_id: &str) -> Vec<ErrorEntry> {
        self.checkpoints.error_history(indexer_id)
    }

    /// Every audit row in chain order.
    pub fn raw_events(&self) -> Vec<RawEventRecord> {
        self.tables().raw_events.values().cloned().collect()
    }

    /// Returns `true` if both stores hold identical projections.
    pub fn same_projections(&self, other: &InMemoryStorage) -> bool {
        *self.tables() == *other.tables()
    }
}

#[async_trait]
impl ProjectionStore for InMemoryStorage {
    async fn commit(&self, writes: &[ProjectionWrite]) -> Result<(), SyncError> {
        let pending = self.failing_commits.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_commits.store(pending - 1, Ordering::SeqCst);
            return Err(SyncError::Storage("injected commit failure".into()));
        }
        let mut tables = self.tables();
        let mut undo = Vec::new();
        for w in writes {
            if let Err(e) = tables.apply(w, &mut undo) {
                tables.rollback(undo);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn pool(&self, pool_id: &str) -> Result<Option<PoolRow>, SyncError> {
        Ok(self.tables().pools.get(pool_id).cloned())
    }

    async fn stakes_for_pool(&self, pool_id: &str) -> Result<Vec<StakeRow>, SyncError> {
        let tables = self.tables();
        Ok(tables
            .pool_stakes
            .get(pool_id)
            .into_iter()
            .flatten()
            .filter_map(|key| tables.stakes.get(key))
            .cloned()
            .collect())
    }

    async fn cycle(&self, cycle_id: &str) -> Result<Option<CycleRow>, SyncError> {
        Ok(self.tables().cycles.get(cycle_id).cloned())
    }

    async fn slip(&self, slip_id: &str) -> Result<Option<SlipRow>, SyncError> {
        Ok(self.tables().slips.get(slip_id).cloned())
    }

    async fn user_reputation(&self, user: &str) -> Result<Option<UserReputationRow>, SyncError> {
        Ok(self.tables().users.get(user).cloned())
    }

    async fn raw_event(&self, key: &EventKey) -> Result<Option<RawEventRecord>, SyncError> {
        Ok(self.tables().raw_events.get(key).cloned())
    }

    async fn counts(&self) -> Result<ProjectionCounts, SyncError> {
        Ok(self.tables().counts())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn load_state(&self, indexer_id: &str) -> Result<Option<IndexerState>, SyncError> {
        self.checkpoints.load_state(indexer_id).await
    }

    async fn save_state(&self, state: &IndexerState) -> Result<(), SyncError> {
        self.checkpoints.save_state(state).await
    }

    async fn append_error(&self, indexer_id: &str, entry: &ErrorEntry) -> Result<(), SyncError> {
        self.checkpoints.append_error(indexer_id, entry).await
    }

    async fn record_checkpoint_blocks(
        &self,
        indexer_id: &str,
        blocks: &[CheckpointBlock],
    ) -> Result<(), SyncError> {
        self.checkpoints
            .record_checkpoint_blocks(indexer_id, blocks)
            .await
    }

    async fn recent_checkpoint_blocks(
        &self,
        indexer_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckpointBlock>, SyncError> {
        self.checkpoints
            .recent_checkpoint_blocks(indexer_id, limit)
            .await
    }
}

#[async_trait]
impl EnrichmentSource for InMemoryStorage {
    async fn fixture_for_market(&self, market_id: &str) -> Result<Option<FixtureInfo>, SyncError> {
        Ok(self
            .fixtures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(market_id)
            .cloned())
    }
}
