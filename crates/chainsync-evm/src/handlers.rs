//! Projection handlers: one per event family, turning a decoded event into
//! the idempotent writes it implies.
//!
//! Handlers only plan. Nothing is written until the dispatcher commits the
//! batch, so a failing handler leaves no trace of the batch behind.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use chainsync_core::error::SyncError;
use chainsync_core::event::{
    ChainEvent, CycleEvent, EventFamily, MarketEvent, ReputationEvent, WagerEvent,
};
use chainsync_core::projection::{
    CyclePatch, EnrichmentSource, FixtureInfo, PoolPatch, PoolStatus, PrizeClaimRow,
    ProjectionWrite, ReputationActionRow, RewardClaimRow, SlipPatch, StakeKind, StakeRow,
};
use chainsync_core::types::RawEventRecord;

/// Plans the projection writes for the events of one family.
#[async_trait]
pub trait ProjectionHandler: Send + Sync {
    /// Name used in error reports.
    fn name(&self) -> &str;

    fn family(&self) -> EventFamily;

    /// Writes implied by `record`. Must be deterministic for a given record
    /// so replays converge.
    async fn plan(&self, record: &RawEventRecord) -> Result<Vec<ProjectionWrite>, SyncError>;
}

/// Handlers keyed by event family.
pub struct HandlerRegistry {
    handlers: HashMap<EventFamily, Vec<Arc<dyn ProjectionHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The four built-in handlers.
    pub fn with_defaults(enrichment: Arc<dyn EnrichmentSource>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MarketHandler::new(enrichment)));
        registry.register(Arc::new(WagerHandler));
        registry.register(Arc::new(CycleHandler));
        registry.register(Arc::new(ReputationHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn ProjectionHandler>) {
        self.handlers
            .entry(handler.family())
            .or_default()
            .push(handler);
    }

    pub fn handlers_for(&self, family: EventFamily) -> &[Arc<dyn ProjectionHandler>] {
        self.handlers
            .get(&family)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn unexpected(handler: &str, record: &RawEventRecord) -> SyncError {
    SyncError::Handler {
        handler: handler.to_string(),
        reason: format!("unexpected {} event at {}", record.event_type(), record.key),
    }
}

// ─── Markets ──────────────────────────────────────────────────────────────────

/// Pool lifecycle: created → settled | refunded.
pub struct MarketHandler {
    enrichment: Arc<dyn EnrichmentSource>,
}

impl MarketHandler {
    pub fn new(enrichment: Arc<dyn EnrichmentSource>) -> Self {
        Self { enrichment }
    }

    /// Fixture metadata for `market_id`, or the placeholder.
    async fn fixture(&self, market_id: &str) -> FixtureInfo {
        match self.enrichment.fixture_for_market(market_id).await {
            Ok(Some(fixture)) => fixture,
            Ok(None) => {
                debug!(market_id, "no fixture for market, using placeholder");
                FixtureInfo::placeholder()
            }
            Err(e) => {
                warn!(market_id, error = %e, "fixture lookup failed, using placeholder");
                FixtureInfo::placeholder()
            }
        }
    }
}

#[async_trait]
impl ProjectionHandler for MarketHandler {
    fn name(&self) -> &str {
        "markets"
    }

    fn family(&self) -> EventFamily {
        EventFamily::Markets
    }

    async fn plan(&self, record: &RawEventRecord) -> Result<Vec<ProjectionWrite>, SyncError> {
        let block = record.key.block_number;
        let ChainEvent::Market(event) = &record.event else {
            return Err(unexpected(self.name(), record));
        };
        let patch = match event {
            MarketEvent::PoolCreated {
                pool_id,
                creator,
                odds,
                creator_stake,
                event_start_time,
                event_end_time,
                market_id,
                predicted_outcome,
            } => {
                let fixture = self.fixture(market_id).await;
                PoolPatch {
                    pool_id: pool_id.clone(),
                    status: Some(PoolStatus::Created),
                    creator: Some(creator.clone()),
                    odds: Some(odds.clone()),
                    creator_stake: Some(creator_stake.clone()),
                    event_start_time: Some(*event_start_time),
                    event_end_time: Some(*event_end_time),
                    market_id: Some(market_id.clone()),
                    predicted_outcome: Some(predicted_outcome.clone()),
                    title: Some(fixture.title(market_id)),
                    home_team: Some(fixture.home_team),
                    away_team: Some(fixture.away_team),
                    league: Some(fixture.league),
                    created_block: Some(block),
                    created_tx: Some(record.key.tx_hash.clone()),
                    block_number: block,
                    ..Default::default()
                }
            }
            MarketEvent::PoolSettled {
                pool_id,
                result,
                creator_side_won,
                settled_at,
            } => PoolPatch {
                status: Some(PoolStatus::Settled),
                result: Some(result.clone()),
                creator_side_won: Some(*creator_side_won),
                settled_at: Some(*settled_at),
                ..PoolPatch::touch(pool_id.clone(), block)
            },
            MarketEvent::PoolRefunded { pool_id, reason } => PoolPatch {
                status: Some(PoolStatus::Refunded),
                refund_reason: Some(reason.clone()),
                ..PoolPatch::touch(pool_id.clone(), block)
            },
        };
        Ok(vec![ProjectionWrite::Pool(patch)])
    }
}

// ─── Wagers ───────────────────────────────────────────────────────────────────

/// Bets, liquidity and reward claims. Pool totals are derived by the store.
pub struct WagerHandler;

#[async_trait]
impl ProjectionHandler for WagerHandler {
    fn name(&self) -> &str {
        "wagers"
    }

    fn family(&self) -> EventFamily {
        EventFamily::Wagers
    }

    async fn plan(&self, record: &RawEventRecord) -> Result<Vec<ProjectionWrite>, SyncError> {
        let key = &record.key;
        let ChainEvent::Wager(event) = &record.event else {
            return Err(unexpected(self.name(), record));
        };
        let stake = |pool_id: &str, account: &str, amount: &str, kind| StakeRow {
            tx_hash: key.tx_hash.clone(),
            log_index: key.log_index,
            block_number: key.block_number,
            pool_id: pool_id.to_string(),
            account: account.to_string(),
            amount: amount.to_string(),
            kind,
        };
        let writes = match event {
            WagerEvent::BetPlaced {
                pool_id,
                bettor,
                amount,
            } => vec![ProjectionWrite::Stake(stake(pool_id, bettor, amount, StakeKind::Bet))],
            WagerEvent::LiquidityAdded {
                pool_id,
                provider,
                amount,
            } => vec![ProjectionWrite::Stake(stake(
                pool_id,
                provider,
                amount,
                StakeKind::Liquidity,
            ))],
            WagerEvent::RewardClaimed {
                pool_id,
                claimant,
                amount,
            } => vec![
                ProjectionWrite::Pool(PoolPatch::touch(pool_id.clone(), key.block_number)),
                ProjectionWrite::RewardClaim(RewardClaimRow {
                    pool_id: pool_id.clone(),
                    claimant: claimant.clone(),
                    amount: amount.clone(),
                    block_number: key.block_number,
                    tx_hash: key.tx_hash.clone(),
                }),
            ],
        };
        Ok(writes)
    }
}

// ─── Cycles ───────────────────────────────────────────────────────────────────

/// Daily cycles, their slips and prize claims.
pub struct CycleHandler;

#[async_trait]
impl ProjectionHandler for CycleHandler {
    fn name(&self) -> &str {
        "cycles"
    }

    fn family(&self) -> EventFamily {
        EventFamily::Cycles
    }

    async fn plan(&self, record: &RawEventRecord) -> Result<Vec<ProjectionWrite>, SyncError> {
        let key = &record.key;
        let block = key.block_number;
        let ChainEvent::Cycle(event) = &record.event else {
            return Err(unexpected(self.name(), record));
        };
        let writes = match event {
            CycleEvent::CycleStarted { cycle_id, end_time } => {
                vec![ProjectionWrite::Cycle(CyclePatch {
                    end_time: Some(*end_time),
                    started_block: Some(block),
                    ..CyclePatch::touch(cycle_id.clone(), block)
                })]
            }
            CycleEvent::SlipPlaced {
                cycle_id,
                player,
                slip_id,
            } => vec![ProjectionWrite::Slip(SlipPatch {
                slip_id: slip_id.clone(),
                cycle_id: cycle_id.clone(),
                player: player.clone(),
                placed_block: Some(block),
                placed_tx: Some(key.tx_hash.clone()),
                block_number: block,
                ..Default::default()
            })],
            CycleEvent::SlipEvaluated {
                slip_id,
                player,
                cycle_id,
                correct_count,
                final_score,
            } => vec![ProjectionWrite::Slip(SlipPatch {
                slip_id: slip_id.clone(),
                cycle_id: cycle_id.clone(),
                player: player.clone(),
                correct_count: Some(*correct_count),
                final_score: Some(final_score.clone()),
                evaluated: true,
                block_number: block,
                ..Default::default()
            })],
            CycleEvent::CycleResolved {
                cycle_id,
                prize_pool,
            } => vec![ProjectionWrite::Cycle(CyclePatch {
                prize_pool: Some(prize_pool.clone()),
                resolved: true,
                ..CyclePatch::touch(cycle_id.clone(), block)
            })],
            CycleEvent::PrizeClaimed {
                cycle_id,
                player,
                rank,
                amount,
            } => vec![
                ProjectionWrite::Cycle(CyclePatch::touch(cycle_id.clone(), block)),
                ProjectionWrite::PrizeClaim(PrizeClaimRow {
                    cycle_id: cycle_id.clone(),
                    player: player.clone(),
                    rank: *rank,
                    amount: amount.clone(),
                    block_number: block,
                    tx_hash: key.tx_hash.clone(),
                }),
            ],
        };
        Ok(writes)
    }
}

// ─── Reputation ───────────────────────────────────────────────────────────────

pub struct ReputationHandler;

#[async_trait]
impl ProjectionHandler for ReputationHandler {
    fn name(&self) -> &str {
        "reputation"
    }

    fn family(&self) -> EventFamily {
        EventFamily::Reputation
    }

    async fn plan(&self, record: &RawEventRecord) -> Result<Vec<ProjectionWrite>, SyncError> {
        let ChainEvent::Reputation(event) = &record.event else {
            return Err(unexpected(self.name(), record));
        };
        let ReputationEvent::ReputationActionOccurred {
            user,
            action,
            value,
            reference_id,
            timestamp,
        } = event;
        Ok(vec![ProjectionWrite::ReputationAction(ReputationActionRow {
            tx_hash: record.key.tx_hash.clone(),
            log_index: record.key.log_index,
            block_number: record.key.block_number,
            user_address: user.clone(),
            action: *action,
            value: *value,
            reference_id: reference_id.clone(),
            occurred_at: *timestamp,
        })])
    }
}
