//! SQLite storage backend for ChainSync.
//!
//! Persists projections, the raw-event audit log, indexer state and
//! checkpoint blocks to a single SQLite file. Each batch of projection writes
//! runs in one transaction.
//!
//! # Usage
//! ```rust,no_run
//! use chainsync_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./chainsync.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainsync_core::checkpoint::{CheckpointBlock, CheckpointStore};
use chainsync_core::error::SyncError;
use chainsync_core::event::ChainEvent;
use chainsync_core::projection::{
    CyclePatch, CycleRow, EnrichmentSource, FixtureInfo, PoolPatch, PoolRow, PoolStatus,
    PoolTotals, ProjectionCounts, ProjectionStore, ProjectionWrite, ReputationActionRow,
    SlipPatch, SlipRow, StakeKind, StakeRow, UserReputationRow,
};
use chainsync_core::state::{ErrorEntry, IndexerState};
use chainsync_core::types::{BlockRange, EventKey, RawEventRecord};

fn storage_err(e: sqlx::Error) -> SyncError {
    SyncError::Storage(e.to_string())
}

fn json_err(e: serde_json::Error) -> SyncError {
    SyncError::Storage(format!("json column: {e}"))
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS pools (
        pool_id            TEXT    PRIMARY KEY,
        status             TEXT    NOT NULL,
        creator            TEXT,
        odds               TEXT,
        creator_stake      TEXT,
        event_start_time   INTEGER,
        event_end_time     INTEGER,
        market_id          TEXT,
        predicted_outcome  TEXT,
        title              TEXT,
        home_team          TEXT,
        away_team          TEXT,
        league             TEXT,
        result             TEXT,
        creator_side_won   INTEGER,
        settled_at         INTEGER,
        refund_reason      TEXT,
        created_block      INTEGER,
        created_tx         TEXT,
        total_bettor_stake TEXT    NOT NULL DEFAULT '0',
        total_liquidity    TEXT    NOT NULL DEFAULT '0',
        bet_count          INTEGER NOT NULL DEFAULT 0,
        last_block         INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_pools_created_block ON pools (created_block)",
    "CREATE INDEX IF NOT EXISTS idx_pools_created_tx ON pools (created_tx)",
    "CREATE TABLE IF NOT EXISTS bets (
        tx_hash      TEXT    NOT NULL,
        log_index    INTEGER NOT NULL,
        block_number INTEGER NOT NULL,
        pool_id      TEXT    NOT NULL,
        account      TEXT    NOT NULL,
        amount       TEXT    NOT NULL,
        kind         TEXT    NOT NULL,
        PRIMARY KEY (tx_hash, log_index)
    )",
    "CREATE INDEX IF NOT EXISTS idx_bets_block ON bets (block_number)",
    "CREATE INDEX IF NOT EXISTS idx_bets_pool ON bets (pool_id)",
    "CREATE TABLE IF NOT EXISTS reward_claims (
        pool_id      TEXT    NOT NULL,
        claimant     TEXT    NOT NULL,
        amount       TEXT    NOT NULL,
        block_number INTEGER NOT NULL,
        tx_hash      TEXT    NOT NULL,
        PRIMARY KEY (pool_id, claimant)
    )",
    "CREATE INDEX IF NOT EXISTS idx_reward_claims_block ON reward_claims (block_number)",
    "CREATE INDEX IF NOT EXISTS idx_reward_claims_tx ON reward_claims (tx_hash)",
    "CREATE TABLE IF NOT EXISTS cycles (
        cycle_id      TEXT    PRIMARY KEY,
        end_time      INTEGER,
        prize_pool    TEXT,
        resolved      INTEGER NOT NULL DEFAULT 0,
        started_block INTEGER,
        slip_count    INTEGER NOT NULL DEFAULT 0,
        last_block    INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_cycles_started_block ON cycles (started_block)",
    "CREATE TABLE IF NOT EXISTS slips (
        slip_id       TEXT    PRIMARY KEY,
        cycle_id      TEXT    NOT NULL,
        player        TEXT    NOT NULL,
        placed_block  INTEGER,
        placed_tx     TEXT,
        correct_count INTEGER,
        final_score   TEXT,
        evaluated     INTEGER NOT NULL DEFAULT 0,
        last_block    INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_slips_cycle ON slips (cycle_id)",
    "CREATE INDEX IF NOT EXISTS idx_slips_block ON slips (placed_block)",
    "CREATE INDEX IF NOT EXISTS idx_slips_tx ON slips (placed_tx)",
    "CREATE TABLE IF NOT EXISTS prize_claims (
        cycle_id     TEXT    NOT NULL,
        player       TEXT    NOT NULL,
        rank         INTEGER NOT NULL,
        amount       TEXT    NOT NULL,
        block_number INTEGER NOT NULL,
        tx_hash      TEXT    NOT NULL,
        PRIMARY KEY (cycle_id, player)
    )",
    "CREATE INDEX IF NOT EXISTS idx_prize_claims_block ON prize_claims (block_number)",
    "CREATE INDEX IF NOT EXISTS idx_prize_claims_tx ON prize_claims (tx_hash)",
    "CREATE TABLE IF NOT EXISTS reputation_actions (
        tx_hash      TEXT    NOT NULL,
        log_index    INTEGER NOT NULL,
        block_number INTEGER NOT NULL,
        user_address TEXT    NOT NULL,
        action       INTEGER NOT NULL,
        value        INTEGER NOT NULL,
        reference_id TEXT    NOT NULL,
        occurred_at  INTEGER NOT NULL,
        PRIMARY KEY (tx_hash, log_index)
    )",
    "CREATE INDEX IF NOT EXISTS idx_reputation_actions_block ON reputation_actions (block_number)",
    "CREATE INDEX IF NOT EXISTS idx_reputation_actions_user ON reputation_actions (user_address)",
    "CREATE TABLE IF NOT EXISTS user_reputation (
        user_address TEXT    PRIMARY KEY,
        total        INTEGER NOT NULL,
        action_count INTEGER NOT NULL,
        last_block   INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS raw_events (
        block_number     INTEGER NOT NULL,
        tx_hash          TEXT    NOT NULL,
        log_index        INTEGER NOT NULL,
        contract_address TEXT    NOT NULL,
        family           TEXT    NOT NULL,
        event_type       TEXT    NOT NULL,
        decoded_args     TEXT    NOT NULL,
        event_json       TEXT    NOT NULL,
        PRIMARY KEY (block_number, tx_hash, log_index)
    )",
    "CREATE INDEX IF NOT EXISTS idx_raw_events_tx ON raw_events (tx_hash)",
    "CREATE INDEX IF NOT EXISTS idx_raw_events_type ON raw_events (event_type)",
    "CREATE TABLE IF NOT EXISTS indexer_state (
        indexer_id             TEXT    PRIMARY KEY,
        last_indexed_block     INTEGER NOT NULL,
        total_blocks_processed INTEGER NOT NULL,
        total_events_processed INTEGER NOT NULL,
        recent_errors          TEXT    NOT NULL,
        last_error_at          INTEGER,
        updated_at             INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS indexer_errors (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        indexer_id TEXT    NOT NULL,
        at         INTEGER NOT NULL,
        kind       TEXT    NOT NULL,
        message    TEXT    NOT NULL,
        range_from INTEGER,
        range_to   INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_indexer_errors_indexer ON indexer_errors (indexer_id, id)",
    "CREATE TABLE IF NOT EXISTS checkpoint_blocks (
        indexer_id   TEXT    NOT NULL,
        block_number INTEGER NOT NULL,
        event_count  INTEGER NOT NULL,
        recorded_at  INTEGER NOT NULL,
        PRIMARY KEY (indexer_id, block_number)
    )",
    "CREATE TABLE IF NOT EXISTS fixtures (
        market_id TEXT PRIMARY KEY,
        home_team TEXT NOT NULL,
        away_team TEXT NOT NULL,
        league    TEXT NOT NULL
    )",
];

/// SQLite-backed projection, checkpoint and fixture storage.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./chainsync.db"`) or a full
    /// SQLite URL (`"sqlite:./chainsync.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, SyncError> {
        Self::open_with(path, 5).await
    }

    pub async fn open_with(path: &str, max_connections: u32) -> Result<Self, SyncError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(&url)
            .await
            .map_err(storage_err)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database. All data is lost when dropped.
    pub async fn in_memory() -> Result<Self, SyncError> {
        // Every in-memory connection is a separate database, so keep exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), SyncError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    /// Insert or replace fixture metadata used for market enrichment.
    pub async fn upsert_fixture(&self, market_id: &str, fixture: &FixtureInfo) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT INTO fixtures (market_id, home_team, away_team, league) VALUES (?, ?, ?, ?)
             ON CONFLICT(market_id) DO UPDATE SET
                home_team = excluded.home_team,
                away_team = excluded.away_team,
                league    = excluded.league",
        )
        .bind(market_id)
        .bind(&fixture.home_team)
        .bind(&fixture.away_team)
        .bind(&fixture.league)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    /// Most recent entries of the append-only error history, newest first.
    pub async fn error_history(&self, indexer_id: &str, limit: usize) -> Result<Vec<ErrorEntry>, SyncError> {
        let rows = sqlx::query(
            "SELECT at, kind, message, range_from, range_to FROM indexer_errors
             WHERE indexer_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(indexer_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|r| {
                let from: Option<i64> = r.try_get("range_from").map_err(storage_err)?;
                let to: Option<i64> = r.try_get("range_to").map_err(storage_err)?;
                Ok(ErrorEntry {
                    at: r.try_get("at").map_err(storage_err)?,
                    kind: r.try_get("kind").map_err(storage_err)?,
                    message: r.try_get("message").map_err(storage_err)?,
                    range: from.zip(to).map(|(f, t)| BlockRange::new(f as u64, t as u64)),
                })
            })
            .collect()
    }
}

// ─── Write path ───────────────────────────────────────────────────────────────

async fn apply_write(conn: &mut SqliteConnection, write: &ProjectionWrite) -> Result<(), SyncError> {
    match write {
        ProjectionWrite::Pool(patch) => upsert_pool(conn, patch).await,
        ProjectionWrite::Stake(stake) => {
            let inserted = sqlx::query(
                "INSERT INTO bets (tx_hash, log_index, block_number, pool_id, account, amount, kind)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(tx_hash, log_index) DO NOTHING",
            )
            .bind(&stake.tx_hash)
            .bind(i64::from(stake.log_index))
            .bind(stake.block_number as i64)
            .bind(&stake.pool_id)
            .bind(&stake.account)
            .bind(&stake.amount)
            .bind(stake.kind.as_str())
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?
            .rows_affected()
                == 1;
            upsert_pool(conn, &PoolPatch::touch(&stake.pool_id, stake.block_number)).await?;
            if inserted {
                add_stake_to_pool(conn, stake).await?;
            }
            Ok(())
        }
        ProjectionWrite::RewardClaim(claim) => {
            sqlx::query(
                "INSERT INTO reward_claims (pool_id, claimant, amount, block_number, tx_hash)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(pool_id, claimant) DO UPDATE SET
                    amount       = excluded.amount,
                    block_number = excluded.block_number,
                    tx_hash      = excluded.tx_hash",
            )
            .bind(&claim.pool_id)
            .bind(&claim.claimant)
            .bind(&claim.amount)
            .bind(claim.block_number as i64)
            .bind(&claim.tx_hash)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;
            Ok(())
        }
        ProjectionWrite::Cycle(patch) => upsert_cycle(conn, patch).await,
        ProjectionWrite::Slip(patch) => {
            let known = sqlx::query("SELECT 1 FROM slips WHERE slip_id = ?")
                .bind(&patch.slip_id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(storage_err)?
                .is_some();
            upsert_slip(conn, patch).await?;
            upsert_cycle(conn, &CyclePatch::touch(&patch.cycle_id, patch.block_number)).await?;
            if !known {
                sqlx::query("UPDATE cycles SET slip_count = slip_count + 1 WHERE cycle_id = ?")
                    .bind(&patch.cycle_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(storage_err)?;
            }
            Ok(())
        }
        ProjectionWrite::PrizeClaim(claim) => {
            sqlx::query(
                "INSERT INTO prize_claims (cycle_id, player, rank, amount, block_number, tx_hash)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(cycle_id, player) DO UPDATE SET
                    rank         = excluded.rank,
                    amount       = excluded.amount,
                    block_number = excluded.block_number,
                    tx_hash      = excluded.tx_hash",
            )
            .bind(&claim.cycle_id)
            .bind(&claim.player)
            .bind(claim.rank as i64)
            .bind(&claim.amount)
            .bind(claim.block_number as i64)
            .bind(&claim.tx_hash)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;
            Ok(())
        }
        ProjectionWrite::ReputationAction(action) => {
            let inserted = sqlx::query(
                "INSERT INTO reputation_actions
                    (tx_hash, log_index, block_number, user_address, action, value, reference_id, occurred_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(tx_hash, log_index) DO NOTHING",
            )
            .bind(&action.tx_hash)
            .bind(i64::from(action.log_index))
            .bind(action.block_number as i64)
            .bind(&action.user_address)
            .bind(i64::from(action.action))
            .bind(action.value)
            .bind(&action.reference_id)
            .bind(action.occurred_at as i64)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?
            .rows_affected()
                == 1;
            if inserted {
                add_user_action(conn, action).await?;
            }
            Ok(())
        }
        ProjectionWrite::RawEvent(record) => {
            let args = serde_json::to_string(&record.decoded_args()).map_err(json_err)?;
            let event = serde_json::to_string(&record.event).map_err(json_err)?;
            sqlx::query(
                "INSERT INTO raw_events
                    (block_number, tx_hash, log_index, contract_address, family, event_type, decoded_args, event_json)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(block_number, tx_hash, log_index) DO NOTHING",
            )
            .bind(record.key.block_number as i64)
            .bind(&record.key.tx_hash)
            .bind(i64::from(record.key.log_index))
            .bind(&record.contract_address)
            .bind(record.family().as_str())
            .bind(record.event_type())
            .bind(&args)
            .bind(&event)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;
            Ok(())
        }
    }
}

async fn upsert_pool(conn: &mut SqliteConnection, p: &PoolPatch) -> Result<(), SyncError> {
    sqlx::query(
        "INSERT INTO pools (
            pool_id, status, creator, odds, creator_stake, event_start_time, event_end_time,
            market_id, predicted_outcome, title, home_team, away_team, league, result,
            creator_side_won, settled_at, refund_reason, created_block, created_tx, last_block
         ) VALUES (?, COALESCE(?, 'created'), ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(pool_id) DO UPDATE SET
            status = CASE WHEN pools.status IN ('settled', 'refunded')
                          THEN pools.status ELSE excluded.status END,
            creator           = COALESCE(excluded.creator, pools.creator),
            odds              = COALESCE(excluded.odds, pools.odds),
            creator_stake     = COALESCE(excluded.creator_stake, pools.creator_stake),
            event_start_time  = COALESCE(excluded.event_start_time, pools.event_start_time),
            event_end_time    = COALESCE(excluded.event_end_time, pools.event_end_time),
            market_id         = COALESCE(excluded.market_id, pools.market_id),
            predicted_outcome = COALESCE(excluded.predicted_outcome, pools.predicted_outcome),
            title             = COALESCE(excluded.title, pools.title),
            home_team         = COALESCE(excluded.home_team, pools.home_team),
            away_team         = COALESCE(excluded.away_team, pools.away_team),
            league            = COALESCE(excluded.league, pools.league),
            result            = COALESCE(excluded.result, pools.result),
            creator_side_won  = COALESCE(excluded.creator_side_won, pools.creator_side_won),
            settled_at        = COALESCE(excluded.settled_at, pools.settled_at),
            refund_reason     = COALESCE(excluded.refund_reason, pools.refund_reason),
            created_block     = COALESCE(excluded.created_block, pools.created_block),
            created_tx        = COALESCE(excluded.created_tx, pools.created_tx),
            last_block        = MAX(pools.last_block, excluded.last_block)",
    )
    .bind(&p.pool_id)
    .bind(p.status.map(|s| s.as_str()))
    .bind(&p.creator)
    .bind(&p.odds)
    .bind(&p.creator_stake)
    .bind(p.event_start_time.map(|v| v as i64))
    .bind(p.event_end_time.map(|v| v as i64))
    .bind(&p.market_id)
    .bind(&p.predicted_outcome)
    .bind(&p.title)
    .bind(&p.home_team)
    .bind(&p.away_team)
    .bind(&p.league)
    .bind(&p.result)
    .bind(p.creator_side_won)
    .bind(p.settled_at.map(|v| v as i64))
    .bind(&p.refund_reason)
    .bind(p.created_block.map(|v| v as i64))
    .bind(&p.created_tx)
    .bind(p.block_number as i64)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(())
}

/// Fold a newly stored stake into its pool's totals.
async fn add_stake_to_pool(conn: &mut SqliteConnection, stake: &StakeRow) -> Result<(), SyncError> {
    let row = sqlx::query(
        "SELECT total_bettor_stake, total_liquidity, bet_count FROM pools WHERE pool_id = ?",
    )
    .bind(&stake.pool_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(storage_err)?;
    let mut totals = PoolTotals {
        total_bettor_stake: get_str(&row, "total_bettor_stake")?,
        total_liquidity: get_str(&row, "total_liquidity")?,
        bet_count: get_u64(&row, "bet_count")?,
    };
    totals.add(stake)?;
    sqlx::query(
        "UPDATE pools SET total_bettor_stake = ?, total_liquidity = ?, bet_count = ?
         WHERE pool_id = ?",
    )
    .bind(&totals.total_bettor_stake)
    .bind(&totals.total_liquidity)
    .bind(totals.bet_count as i64)
    .bind(&stake.pool_id)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(())
}

async fn upsert_cycle(conn: &mut SqliteConnection, c: &CyclePatch) -> Result<(), SyncError> {
    sqlx::query(
        "INSERT INTO cycles (cycle_id, end_time, prize_pool, resolved, started_block, last_block)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(cycle_id) DO UPDATE SET
            end_time      = COALESCE(excluded.end_time, cycles.end_time),
            prize_pool    = COALESCE(excluded.prize_pool, cycles.prize_pool),
            resolved      = MAX(cycles.resolved, excluded.resolved),
            started_block = COALESCE(excluded.started_block, cycles.started_block),
            last_block    = MAX(cycles.last_block, excluded.last_block)",
    )
    .bind(&c.cycle_id)
    .bind(c.end_time.map(|v| v as i64))
    .bind(&c.prize_pool)
    .bind(c.resolved)
    .bind(c.started_block.map(|v| v as i64))
    .bind(c.block_number as i64)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(())
}

async fn upsert_slip(conn: &mut SqliteConnection, s: &SlipPatch) -> Result<(), SyncError> {
    sqlx::query(
        "INSERT INTO slips (slip_id, cycle_id, player, placed_block, placed_tx, correct_count,
                            final_score, evaluated, last_block)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(slip_id) DO UPDATE SET
            placed_block  = COALESCE(excluded.placed_block, slips.placed_block),
            placed_tx     = COALESCE(excluded.placed_tx, slips.placed_tx),
            correct_count = COALESCE(excluded.correct_count, slips.correct_count),
            final_score   = COALESCE(excluded.final_score, slips.final_score),
            evaluated     = MAX(slips.evaluated, excluded.evaluated),
            last_block    = MAX(slips.last_block, excluded.last_block)",
    )
    .bind(&s.slip_id)
    .bind(&s.cycle_id)
    .bind(&s.player)
    .bind(s.placed_block.map(|v| v as i64))
    .bind(&s.placed_tx)
    .bind(s.correct_count.map(i64::from))
    .bind(&s.final_score)
    .bind(s.evaluated)
    .bind(s.block_number as i64)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(())
}

/// Count a newly stored reputation action against its user.
async fn add_user_action(
    conn: &mut SqliteConnection,
    action: &ReputationActionRow,
) -> Result<(), SyncError> {
    let user = &action.user_address;
    let row = sqlx::query(
        "SELECT total, action_count, last_block FROM user_reputation WHERE user_address = ?",
    )
    .bind(user)
    .fetch_optional(&mut *conn)
    .await
    .map_err(storage_err)?;
    let mut totals = match row {
        Some(r) => UserReputationRow {
            user_address: user.clone(),
            total: r.try_get("total").map_err(storage_err)?,
            action_count: get_u64(&r, "action_count")?,
            last_block: get_u64(&r, "last_block")?,
        },
        None => UserReputationRow::empty(user),
    };
    totals.record(action)?;

    sqlx::query(
        "INSERT INTO user_reputation (user_address, total, action_count, last_block)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(user_address) DO UPDATE SET
            total        = excluded.total,
            action_count = excluded.action_count,
            last_block   = excluded.last_block",
    )
    .bind(user)
    .bind(totals.total)
    .bind(totals.action_count as i64)
    .bind(totals.last_block as i64)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(())
}

async fn fetch_stakes(conn: &mut SqliteConnection, pool_id: &str) -> Result<Vec<StakeRow>, SyncError> {
    let rows = sqlx::query(
        "SELECT tx_hash, log_index, block_number, pool_id, account, amount, kind
         FROM bets WHERE pool_id = ? ORDER BY block_number, log_index",
    )
    .bind(pool_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(storage_err)?;
    rows.iter().map(stake_from_row).collect()
}

// ─── Row mapping ──────────────────────────────────────────────────────────────

fn opt_u64(r: &SqliteRow, col: &str) -> Result<Option<u64>, SyncError> {
    Ok(r.try_get::<Option<i64>, _>(col)
        .map_err(storage_err)?
        .map(|v| v as u64))
}

fn get_u64(r: &SqliteRow, col: &str) -> Result<u64, SyncError> {
    Ok(r.try_get::<i64, _>(col).map_err(storage_err)? as u64)
}

fn get_str(r: &SqliteRow, col: &str) -> Result<String, SyncError> {
    r.try_get(col).map_err(storage_err)
}

fn opt_str(r: &SqliteRow, col: &str) -> Result<Option<String>, SyncError> {
    r.try_get(col).map_err(storage_err)
}

fn pool_from_row(r: &SqliteRow) -> Result<PoolRow, SyncError> {
    let status = get_str(r, "status")?;
    Ok(PoolRow {
        pool_id: get_str(r, "pool_id")?,
        status: PoolStatus::parse(&status)
            .ok_or_else(|| SyncError::Storage(format!("unknown pool status '{status}'")))?,
        creator: opt_str(r, "creator")?,
        odds: opt_str(r, "odds")?,
        creator_stake: opt_str(r, "creator_stake")?,
        event_start_time: opt_u64(r, "event_start_time")?,
        event_end_time: opt_u64(r, "event_end_time")?,
        market_id: opt_str(r, "market_id")?,
        predicted_outcome: opt_str(r, "predicted_outcome")?,
        title: opt_str(r, "title")?,
        home_team: opt_str(r, "home_team")?,
        away_team: opt_str(r, "away_team")?,
        league: opt_str(r, "league")?,
        result: opt_str(r, "result")?,
        creator_side_won: r.try_get("creator_side_won").map_err(storage_err)?,
        settled_at: opt_u64(r, "settled_at")?,
        refund_reason: opt_str(r, "refund_reason")?,
        created_block: opt_u64(r, "created_block")?,
        created_tx: opt_str(r, "created_tx")?,
        total_bettor_stake: get_str(r, "total_bettor_stake")?,
        total_liquidity: get_str(r, "total_liquidity")?,
        bet_count: get_u64(r, "bet_count")?,
        last_block: get_u64(r, "last_block")?,
    })
}

fn stake_from_row(r: &SqliteRow) -> Result<StakeRow, SyncError> {
    let kind = get_str(r, "kind")?;
    Ok(StakeRow {
        tx_hash: get_str(r, "tx_hash")?,
        log_index: get_u64(r, "log_index")? as u32,
        block_number: get_u64(r, "block_number")?,
        pool_id: get_str(r, "pool_id")?,
        account: get_str(r, "account")?,
        amount: get_str(r, "amount")?,
        kind: StakeKind::parse(&kind)
            .ok_or_else(|| SyncError::Storage(format!("unknown stake kind '{kind}'")))?,
    })
}

fn cycle_from_row(r: &SqliteRow) -> Result<CycleRow, SyncError> {
    Ok(CycleRow {
        cycle_id: get_str(r, "cycle_id")?,
        end_time: opt_u64(r, "end_time")?,
        prize_pool: opt_str(r, "prize_pool")?,
        resolved: r.try_get("resolved").map_err(storage_err)?,
        started_block: opt_u64(r, "started_block")?,
        slip_count: get_u64(r, "slip_count")?,
        last_block: get_u64(r, "last_block")?,
    })
}

fn slip_from_row(r: &SqliteRow) -> Result<SlipRow, SyncError> {
    Ok(SlipRow {
        slip_id: get_str(r, "slip_id")?,
        cycle_id: get_str(r, "cycle_id")?,
        player: get_str(r, "player")?,
        placed_block: opt_u64(r, "placed_block")?,
        placed_tx: opt_str(r, "placed_tx")?,
        correct_count: opt_u64(r, "correct_count")?.map(|v| v as u8),
        final_score: opt_str(r, "final_score")?,
        evaluated: r.try_get("evaluated").map_err(storage_err)?,
        last_block: get_u64(r, "last_block")?,
    })
}

// ─── ProjectionStore impl ─────────────────────────────────────────────────────

#[async_trait]
impl ProjectionStore for SqliteStorage {
    async fn commit(&self, writes: &[ProjectionWrite]) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for w in writes {
            apply_write(&mut *tx, w).await?;
        }
        tx.commit().await.map_err(storage_err)?;
        debug!(writes = writes.len(), "projection batch committed");
        Ok(())
    }

    async fn pool(&self, pool_id: &str) -> Result<Option<PoolRow>, SyncError> {
        let row = sqlx::query("SELECT * FROM pools WHERE pool_id = ?")
            .bind(pool_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(pool_from_row).transpose()
    }

    async fn stakes_for_pool(&self, pool_id: &str) -> Result<Vec<StakeRow>, SyncError> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        fetch_stakes(&mut *conn, pool_id).await
    }

    async fn cycle(&self, cycle_id: &str) -> Result<Option<CycleRow>, SyncError> {
        let row = sqlx::query("SELECT * FROM cycles WHERE cycle_id = ?")
            .bind(cycle_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(cycle_from_row).transpose()
    }

    async fn slip(&self, slip_id: &str) -> Result<Option<SlipRow>, SyncError> {
        let row = sqlx::query("SELECT * FROM slips WHERE slip_id = ?")
            .bind(slip_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(slip_from_row).transpose()
    }

    async fn user_reputation(&self, user: &str) -> Result<Option<UserReputationRow>, SyncError> {
        let row = sqlx::query("SELECT * FROM user_reputation WHERE user_address = ?")
            .bind(user)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|r| {
            Ok(UserReputationRow {
                user_address: get_str(&r, "user_address")?,
                total: r.try_get("total").map_err(storage_err)?,
                action_count: get_u64(&r, "action_count")?,
                last_block: get_u64(&r, "last_block")?,
            })
        })
        .transpose()
    }

    async fn raw_event(&self, key: &EventKey) -> Result<Option<RawEventRecord>, SyncError> {
        let row = sqlx::query(
            "SELECT contract_address, event_json FROM raw_events
             WHERE block_number = ? AND tx_hash = ? AND log_index = ?",
        )
        .bind(key.block_number as i64)
        .bind(&key.tx_hash)
        .bind(i64::from(key.log_index))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.map(|r| {
            let event: ChainEvent =
                serde_json::from_str(&get_str(&r, "event_json")?).map_err(json_err)?;
            Ok(RawEventRecord {
                key: key.clone(),
                contract_address: get_str(&r, "contract_address")?,
                event,
            })
        })
        .transpose()
    }

    async fn counts(&self) -> Result<ProjectionCounts, SyncError> {
        let r = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM pools)              AS pools,
                (SELECT COUNT(*) FROM bets)               AS bets,
                (SELECT COUNT(*) FROM reward_claims)      AS reward_claims,
                (SELECT COUNT(*) FROM cycles)             AS cycles,
                (SELECT COUNT(*) FROM slips)              AS slips,
                (SELECT COUNT(*) FROM prize_claims)       AS prize_claims,
                (SELECT COUNT(*) FROM reputation_actions) AS reputation_actions,
                (SELECT COUNT(*) FROM user_reputation)    AS users,
                (SELECT COUNT(*) FROM raw_events)         AS raw_events",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(ProjectionCounts {
            pools: get_u64(&r, "pools")?,
            bets: get_u64(&r, "bets")?,
            reward_claims: get_u64(&r, "reward_claims")?,
            cycles: get_u64(&r, "cycles")?,
            slips: get_u64(&r, "slips")?,
            prize_claims: get_u64(&r, "prize_claims")?,
            reputation_actions: get_u64(&r, "reputation_actions")?,
            users: get_u64(&r, "users")?,
            raw_events: get_u64(&r, "raw_events")?,
        })
    }
}

// ─── CheckpointStore impl ─────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load_state(&self, indexer_id: &str) -> Result<Option<IndexerState>, SyncError> {
        let row = sqlx::query("SELECT * FROM indexer_state WHERE indexer_id = ?")
            .bind(indexer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|r| {
            let errors: VecDeque<ErrorEntry> =
                serde_json::from_str(&get_str(&r, "recent_errors")?).map_err(json_err)?;
            Ok(IndexerState {
                indexer_id: get_str(&r, "indexer_id")?,
                last_indexed_block: get_u64(&r, "last_indexed_block")?,
                total_blocks_processed: get_u64(&r, "total_blocks_processed")?,
                total_events_processed: get_u64(&r, "total_events_processed")?,
                recent_errors: errors,
                last_error_at: r.try_get("last_error_at").map_err(storage_err)?,
                updated_at: r.try_get("updated_at").map_err(storage_err)?,
            })
        })
        .transpose()
    }

    async fn save_state(&self, state: &IndexerState) -> Result<(), SyncError> {
        let errors = serde_json::to_string(&state.recent_errors).map_err(json_err)?;
        sqlx::query(
            "INSERT INTO indexer_state
                (indexer_id, last_indexed_block, total_blocks_processed, total_events_processed,
                 recent_errors, last_error_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(indexer_id) DO UPDATE SET
                last_indexed_block     = MAX(indexer_state.last_indexed_block, excluded.last_indexed_block),
                total_blocks_processed = excluded.total_blocks_processed,
                total_events_processed = excluded.total_events_processed,
                recent_errors          = excluded.recent_errors,
                last_error_at          = excluded.last_error_at,
                updated_at             = excluded.updated_at",
        )
        .bind(&state.indexer_id)
        .bind(state.last_indexed_block as i64)
        .bind(state.total_blocks_processed as i64)
        .bind(state.total_events_processed as i64)
        .bind(&errors)
        .bind(state.last_error_at)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(
            indexer_id = %state.indexer_id,
            block = state.last_indexed_block,
            "indexer state saved"
        );
        Ok(())
    }

    async fn append_error(&self, indexer_id: &str, entry: &ErrorEntry) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT INTO indexer_errors (indexer_id, at, kind, message, range_from, range_to)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(indexer_id)
        .bind(entry.at)
        .bind(&entry.kind)
        .bind(&entry.message)
        .bind(entry.range.map(|r| r.from as i64))
        .bind(entry.range.map(|r| r.to as i64))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn record_checkpoint_blocks(
        &self,
        indexer_id: &str,
        blocks: &[CheckpointBlock],
    ) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for b in blocks {
            sqlx::query(
                "INSERT INTO checkpoint_blocks (indexer_id, block_number, event_count, recorded_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(indexer_id, block_number) DO UPDATE SET
                    event_count = excluded.event_count,
                    recorded_at = excluded.recorded_at",
            )
            .bind(indexer_id)
            .bind(b.block_number as i64)
            .bind(i64::from(b.event_count))
            .bind(b.recorded_at)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn recent_checkpoint_blocks(
        &self,
        indexer_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckpointBlock>, SyncError> {
        let rows = sqlx::query(
            "SELECT block_number, event_count, recorded_at FROM checkpoint_blocks
             WHERE indexer_id = ? ORDER BY block_number DESC LIMIT ?",
        )
        .bind(indexer_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter()
            .map(|r| {
                Ok(CheckpointBlock {
                    block_number: get_u64(r, "block_number")?,
                    event_count: get_u64(r, "event_count")? as u32,
                    recorded_at: r.try_get("recorded_at").map_err(storage_err)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl EnrichmentSource for SqliteStorage {
    async fn fixture_for_market(&self, market_id: &str) -> Result<Option<FixtureInfo>, SyncError> {
        let row = sqlx::query("SELECT home_team, away_team, league FROM fixtures WHERE market_id = ?")
            .bind(market_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Enrichment {
                key: market_id.to_string(),
                reason: e.to_string(),
            })?;
        row.map(|r| {
            Ok(FixtureInfo {
                home_team: get_str(&r, "home_team")?,
                away_team: get_str(&r, "away_team")?,
                league: get_str(&r, "league")?,
            })
        })
        .transpose()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
