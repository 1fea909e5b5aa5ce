//! Projection rows, planned writes and the store traits behind them.
//!
//! Handlers never touch a database directly. They turn one
//! [`RawEventRecord`] into a list of [`ProjectionWrite`]s; a
//! [`ProjectionStore`] then commits the writes of a whole batch at once.
//!
//! Merge rules shared by every backend:
//! - patches only fill or overwrite the fields they carry (`None` keeps the
//!   stored value), so a late creation event merges into an earlier row
//! - a terminal pool status (settled / refunded) is never replaced
//! - aggregates (pool stakes, cycle slip counts, user reputation) change
//!   only when a child row is stored for the first time, so replaying a
//!   batch leaves them untouched

use alloy_primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::types::{EventKey, RawEventRecord};

// ─── Pools ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Created,
    Settled,
    Refunded,
}

impl PoolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Settled => "settled",
            Self::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "settled" => Some(Self::Settled),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created)
    }

    /// Status after applying `incoming` on top of `self`.
    pub fn merge(self, incoming: PoolStatus) -> PoolStatus {
        if self.is_terminal() {
            self
        } else {
            incoming
        }
    }
}

/// Partial update of a pool row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolPatch {
    pub pool_id: String,
    pub status: Option<PoolStatus>,
    pub creator: Option<String>,
    pub odds: Option<String>,
    pub creator_stake: Option<String>,
    pub event_start_time: Option<u64>,
    pub event_end_time: Option<u64>,
    pub market_id: Option<String>,
    pub predicted_outcome: Option<String>,
    pub title: Option<String>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub league: Option<String>,
    pub result: Option<String>,
    pub creator_side_won: Option<bool>,
    pub settled_at: Option<u64>,
    pub refund_reason: Option<String>,
    pub created_block: Option<u64>,
    pub created_tx: Option<String>,
    /// Block of the event producing this patch.
    pub block_number: u64,
}

impl PoolPatch {
    /// A patch that only guarantees the row exists.
    pub fn touch(pool_id: impl Into<String>, block_number: u64) -> Self {
        Self {
            pool_id: pool_id.into(),
            block_number,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRow {
    pub pool_id: String,
    pub status: PoolStatus,
    pub creator: Option<String>,
    pub odds: Option<String>,
    pub creator_stake: Option<String>,
    pub event_start_time: Option<u64>,
    pub event_end_time: Option<u64>,
    pub market_id: Option<String>,
    pub predicted_outcome: Option<String>,
    pub title: Option<String>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub league: Option<String>,
    pub result: Option<String>,
    pub creator_side_won: Option<bool>,
    pub settled_at: Option<u64>,
    pub refund_reason: Option<String>,
    pub created_block: Option<u64>,
    pub created_tx: Option<String>,
    /// Sum of `BetPlaced` amounts.
    pub total_bettor_stake: String,
    /// Sum of `LiquidityAdded` amounts.
    pub total_liquidity: String,
    pub bet_count: u64,
    pub last_block: u64,
}

impl PoolRow {
    /// Apply `patch` on top of `existing` (or on top of an empty row).
    pub fn merged(existing: Option<PoolRow>, patch: &PoolPatch) -> PoolRow {
        let mut row = existing.unwrap_or_else(|| PoolRow {
            pool_id: patch.pool_id.clone(),
            status: PoolStatus::Created,
            creator: None,
            odds: None,
            creator_stake: None,
            event_start_time: None,
            event_end_time: None,
            market_id: None,
            predicted_outcome: None,
            title: None,
            home_team: None,
            away_team: None,
            league: None,
            result: None,
            creator_side_won: None,
            settled_at: None,
            refund_reason: None,
            created_block: None,
            created_tx: None,
            total_bettor_stake: "0".into(),
            total_liquidity: "0".into(),
            bet_count: 0,
            last_block: patch.block_number,
        });

        if let Some(status) = patch.status {
            row.status = row.status.merge(status);
        }
        fill(&mut row.creator, &patch.creator);
        fill(&mut row.odds, &patch.odds);
        fill(&mut row.creator_stake, &patch.creator_stake);
        fill(&mut row.event_start_time, &patch.event_start_time);
        fill(&mut row.event_end_time, &patch.event_end_time);
        fill(&mut row.market_id, &patch.market_id);
        fill(&mut row.predicted_outcome, &patch.predicted_outcome);
        fill(&mut row.title, &patch.title);
        fill(&mut row.home_team, &patch.home_team);
        fill(&mut row.away_team, &patch.away_team);
        fill(&mut row.league, &patch.league);
        fill(&mut row.result, &patch.result);
        fill(&mut row.creator_side_won, &patch.creator_side_won);
        fill(&mut row.settled_at, &patch.settled_at);
        fill(&mut row.refund_reason, &patch.refund_reason);
        fill(&mut row.created_block, &patch.created_block);
        fill(&mut row.created_tx, &patch.created_tx);
        row.last_block = row.last_block.max(patch.block_number);
        row
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if value.is_some() {
        slot.clone_from(value);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeKind {
    Bet,
    Liquidity,
}

impl StakeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bet => "bet",
            Self::Liquidity => "liquidity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bet" => Some(Self::Bet),
            "liquidity" => Some(Self::Liquidity),
            _ => None,
        }
    }
}

/// A bet or liquidity deposit. Keyed by `(tx_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeRow {
    pub tx_hash: String,
    pub log_index: u32,
    pub block_number: u64,
    pub pool_id: String,
    pub account: String,
    pub amount: String,
    pub kind: StakeKind,
}

/// Keyed by `(pool_id, claimant)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardClaimRow {
    pub pool_id: String,
    pub claimant: String,
    pub amount: String,
    pub block_number: u64,
    pub tx_hash: String,
}

/// Totals derived from the stake rows of one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTotals {
    pub total_bettor_stake: String,
    pub total_liquidity: String,
    pub bet_count: u64,
}

impl Default for PoolTotals {
    fn default() -> Self {
        Self {
            total_bettor_stake: "0".into(),
            total_liquidity: "0".into(),
            bet_count: 0,
        }
    }
}

impl PoolTotals {
    /// Totals currently stored on `pool`.
    pub fn of(pool: &PoolRow) -> Self {
        Self {
            total_bettor_stake: pool.total_bettor_stake.clone(),
            total_liquidity: pool.total_liquidity.clone(),
            bet_count: pool.bet_count,
        }
    }

    pub fn from_stakes<'a>(
        stakes: impl IntoIterator<Item = &'a StakeRow>,
    ) -> Result<Self, SyncError> {
        let mut totals = Self::default();
        for s in stakes {
            totals.add(s)?;
        }
        Ok(totals)
    }

    /// Fold in a stake row that was not counted before.
    pub fn add(&mut self, stake: &StakeRow) -> Result<(), SyncError> {
        match stake.kind {
            StakeKind::Bet => {
                self.total_bettor_stake = add_amount(&self.total_bettor_stake, &stake.amount)?;
                self.bet_count += 1;
            }
            StakeKind::Liquidity => {
                self.total_liquidity = add_amount(&self.total_liquidity, &stake.amount)?;
            }
        }
        Ok(())
    }

    pub fn apply_to(self, pool: &mut PoolRow) {
        pool.total_bettor_stake = self.total_bettor_stake;
        pool.total_liquidity = self.total_liquidity;
        pool.bet_count = self.bet_count;
    }
}

// ─── Cycles ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CyclePatch {
    pub cycle_id: String,
    pub end_time: Option<u64>,
    pub prize_pool: Option<String>,
    /// Sets the resolved flag; never clears it.
    pub resolved: bool,
    pub started_block: Option<u64>,
    pub block_number: u64,
}

impl CyclePatch {
    pub fn touch(cycle_id: impl Into<String>, block_number: u64) -> Self {
        Self {
            cycle_id: cycle_id.into(),
            block_number,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRow {
    pub cycle_id: String,
    pub end_time: Option<u64>,
    pub prize_pool: Option<String>,
    pub resolved: bool,
    pub started_block: Option<u64>,
    pub slip_count: u64,
    pub last_block: u64,
}

impl CycleRow {
    pub fn merged(existing: Option<CycleRow>, patch: &CyclePatch) -> CycleRow {
        let mut row = existing.unwrap_or_else(|| CycleRow {
            cycle_id: patch.cycle_id.clone(),
            end_time: None,
            prize_pool: None,
            resolved: false,
            started_block: None,
            slip_count: 0,
            last_block: patch.block_number,
        });
        fill(&mut row.end_time, &patch.end_time);
        fill(&mut row.prize_pool, &patch.prize_pool);
        fill(&mut row.started_block, &patch.started_block);
        row.resolved |= patch.resolved;
        row.last_block = row.last_block.max(patch.block_number);
        row
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlipPatch {
    pub slip_id: String,
    pub cycle_id: String,
    pub player: String,
    pub placed_block: Option<u64>,
    pub placed_tx: Option<String>,
    pub correct_count: Option<u8>,
    pub final_score: Option<String>,
    /// Sets the evaluated flag; never clears it.
    pub evaluated: bool,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlipRow {
    pub slip_id: String,
    pub cycle_id: String,
    pub player: String,
    pub placed_block: Option<u64>,
    pub placed_tx: Option<String>,
    pub correct_count: Option<u8>,
    pub final_score: Option<String>,
    pub evaluated: bool,
    pub last_block: u64,
}

impl SlipRow {
    pub fn merged(existing: Option<SlipRow>, patch: &SlipPatch) -> SlipRow {
        let mut row = existing.unwrap_or_else(|| SlipRow {
            slip_id: patch.slip_id.clone(),
            cycle_id: patch.cycle_id.clone(),
            player: patch.player.clone(),
            placed_block: None,
            placed_tx: None,
            correct_count: None,
            final_score: None,
            evaluated: false,
            last_block: patch.block_number,
        });
        fill(&mut row.placed_block, &patch.placed_block);
        fill(&mut row.placed_tx, &patch.placed_tx);
        fill(&mut row.correct_count, &patch.correct_count);
        fill(&mut row.final_score, &patch.final_score);
        row.evaluated |= patch.evaluated;
        row.last_block = row.last_block.max(patch.block_number);
        row
    }
}

/// Keyed by `(cycle_id, player)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrizeClaimRow {
    pub cycle_id: String,
    pub player: String,
    pub rank: u64,
    pub amount: String,
    pub block_number: u64,
    pub tx_hash: String,
}

// ─── Reputation ───────────────────────────────────────────────────────────────

/// Keyed by `(tx_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationActionRow {
    pub tx_hash: String,
    pub log_index: u32,
    pub block_number: u64,
    pub user_address: String,
    pub action: u8,
    pub value: i64,
    pub reference_id: String,
    pub occurred_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserReputationRow {
    pub user_address: String,
    pub total: i64,
    pub action_count: u64,
    pub last_block: u64,
}

impl UserReputationRow {
    pub fn empty(user_address: &str) -> Self {
        Self {
            user_address: user_address.to_string(),
            total: 0,
            action_count: 0,
            last_block: 0,
        }
    }

    /// Rebuild a user's totals from all of their actions.
    pub fn from_actions<'a>(
        user_address: &str,
        actions: impl IntoIterator<Item = &'a ReputationActionRow>,
    ) -> Result<Self, SyncError> {
        let mut row = Self::empty(user_address);
        for a in actions {
            row.record(a)?;
        }
        Ok(row)
    }

    /// Count an action that was not counted before.
    pub fn record(&mut self, action: &ReputationActionRow) -> Result<(), SyncError> {
        self.total = self
            .total
            .checked_add(action.value)
            .ok_or_else(|| SyncError::Handler {
                handler: "reputation".into(),
                reason: format!("reputation total of {} overflows i64", self.user_address),
            })?;
        self.action_count += 1;
        self.last_block = self.last_block.max(action.block_number);
        Ok(())
    }
}

// ─── Writes ───────────────────────────────────────────────────────────────────

/// One planned write. A batch's writes are committed together.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionWrite {
    Pool(PoolPatch),
    Stake(StakeRow),
    RewardClaim(RewardClaimRow),
    Cycle(CyclePatch),
    Slip(SlipPatch),
    PrizeClaim(PrizeClaimRow),
    ReputationAction(ReputationActionRow),
    /// Audit row; ignored if the key already exists.
    RawEvent(RawEventRecord),
}

impl ProjectionWrite {
    /// Table the write lands in.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Pool(_) => "pools",
            Self::Stake(_) => "bets",
            Self::RewardClaim(_) => "reward_claims",
            Self::Cycle(_) => "cycles",
            Self::Slip(_) => "slips",
            Self::PrizeClaim(_) => "prize_claims",
            Self::ReputationAction(_) => "reputation_actions",
            Self::RawEvent(_) => "raw_events",
        }
    }
}

/// Row counts per table, for status output and replay checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionCounts {
    pub pools: u64,
    pub bets: u64,
    pub reward_claims: u64,
    pub cycles: u64,
    pub slips: u64,
    pub prize_claims: u64,
    pub reputation_actions: u64,
    pub users: u64,
    pub raw_events: u64,
}

/// Storage for domain projections and the raw-event audit log.
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Apply `writes` in order as one unit. Either all land or none do.
    async fn commit(&self, writes: &[ProjectionWrite]) -> Result<(), SyncError>;

    async fn pool(&self, pool_id: &str) -> Result<Option<PoolRow>, SyncError>;

    async fn stakes_for_pool(&self, pool_id: &str) -> Result<Vec<StakeRow>, SyncError>;

    async fn cycle(&self, cycle_id: &str) -> Result<Option<CycleRow>, SyncError>;

    async fn slip(&self, slip_id: &str) -> Result<Option<SlipRow>, SyncError>;

    async fn user_reputation(&self, user: &str) -> Result<Option<UserReputationRow>, SyncError>;

    async fn raw_event(&self, key: &EventKey) -> Result<Option<RawEventRecord>, SyncError>;

    async fn counts(&self) -> Result<ProjectionCounts, SyncError>;
}

// ─── Enrichment ───────────────────────────────────────────────────────────────

/// Reference data about the fixture behind a market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureInfo {
    pub home_team: String,
    pub away_team: String,
    pub league: String,
}

impl FixtureInfo {
    /// Substituted when the lookup misses or fails.
    pub fn placeholder() -> Self {
        Self {
            home_team: "TBD".into(),
            away_team: "TBD".into(),
            league: "Unknown".into(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        *self == Self::placeholder()
    }

    /// Human-readable market title.
    pub fn title(&self, market_id: &str) -> String {
        if self.is_placeholder() {
            let short: String = market_id.chars().take(10).collect();
            format!("Market {short}")
        } else {
            format!("{} vs {}", self.home_team, self.away_team)
        }
    }
}

/// Read-only source of fixture metadata.
#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    /// `Ok(None)` when the market is unknown.
    async fn fixture_for_market(&self, market_id: &str) -> Result<Option<FixtureInfo>, SyncError>;
}

/// An enrichment source that never knows anything.
pub struct NoEnrichment;

#[async_trait]
impl EnrichmentSource for NoEnrichment {
    async fn fixture_for_market(&self, _market_id: &str) -> Result<Option<FixtureInfo>, SyncError> {
        Ok(None)
    }
}

// ─── Amounts ──────────────────────────────────────────────────────────────────

fn amount_error(reason: String) -> SyncError {
    SyncError::Handler {
        handler: "amounts".into(),
        reason,
    }
}

/// Parse a base-10 uint256 token amount.
pub fn parse_amount(raw: &str) -> Result<U256, SyncError> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(amount_error(format!("{raw:?} is not a base-10 amount")));
    }
    U256::from_str_radix(raw, 10)
        .map_err(|_| amount_error(format!("{raw} does not fit in uint256")))
}

/// `total + amount`, both base-10 uint256 strings.
pub fn add_amount(total: &str, amount: &str) -> Result<String, SyncError> {
    parse_amount(total)?
        .checked_add(parse_amount(amount)?)
        .map(|sum| sum.to_string())
        .ok_or_else(|| amount_error(format!("{total} + {amount} overflows uint256")))
}

/// Sum base-10 uint256 token amounts.
pub fn sum_amounts<'a>(amounts: impl IntoIterator<Item = &'a str>) -> Result<String, SyncError> {
    let mut total = U256::ZERO;
    for a in amounts {
        total = total
            .checked_add(parse_amount(a)?)
            .ok_or_else(|| amount_error("sum of amounts overflows uint256".into()))?;
    }
    Ok(total.to_string())
}
