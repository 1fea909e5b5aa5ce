mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, I256, U256};
use alloy_sol_types::SolEvent;
use tokio::sync::watch;

use chainsync_core::checkpoint::{CheckpointStore, CommitOutcome, MemoryCheckpointStore};
use chainsync_core::error::SyncError;
use chainsync_core::projection::{PoolStatus, ProjectionStore};
use chainsync_core::types::{BlockRange, RawLog};
use chainsync_evm::abi::{
    BetPlaced, CycleResolved, CycleStarted, LiquidityAdded, PoolCreated, PrizeClaimed,
    ReputationActionOccurred, RewardClaimed, SlipEvaluated, SlipPlaced,
};
use chainsync_evm::Step;
use chainsync_storage::InMemoryStorage;

use common::*;

fn seed_activity(chain: &ScriptedChain) {
    let bettor = Address::repeat_byte(0xB1);
    let player = Address::repeat_byte(0xA1);

    chain.emit(&pool_created(1, 0x10), POOL_CORE, 1_005, 0);
    chain.emit(
        &BetPlaced {
            poolId: U256::from(1u64),
            bettor,
            amount: U256::from(250u64),
        },
        POOL_CORE,
        1_010,
        1,
    );
    chain.emit(
        &LiquidityAdded {
            poolId: U256::from(1u64),
            provider: Address::repeat_byte(0xB2),
            amount: U256::from(900u64),
        },
        POOL_CORE,
        1_010,
        2,
    );
    chain.emit(&CycleStarted { cycleId: U256::from(4u64), endTime: U256::from(1_700_200_000u64) }, ODDYSSEY, 1_020, 0);
    chain.emit(
        &SlipPlaced {
            cycleId: U256::from(4u64),
            player,
            slipId: U256::from(40u64),
        },
        ODDYSSEY,
        1_030,
        0,
    );
    chain.emit(&pool_settled(1), POOL_CORE, 1_120, 0);
    chain.emit(
        &RewardClaimed {
            poolId: U256::from(1u64),
            user: bettor,
            amount: U256::from(400u64),
        },
        POOL_CORE,
        1_130,
        0,
    );
    chain.emit(
        &SlipEvaluated {
            slipId: U256::from(40u64),
            player,
            cycleId: U256::from(4u64),
            correctCount: 7,
            finalScore: U256::from(3_150u64),
        },
        ODDYSSEY,
        1_140,
        0,
    );
    chain.emit(&CycleResolved { cycleId: U256::from(4u64), prizePool: U256::from(10_000u64) }, ODDYSSEY, 1_140, 1);
    chain.emit(
        &PrizeClaimed {
            cycleId: U256::from(4u64),
            player,
            rank: U256::from(1u64),
            amount: U256::from(6_000u64),
        },
        ODDYSSEY,
        1_150,
        0,
    );
    for (i, value) in [20i64, -5].into_iter().enumerate() {
        chain.emit(
            &ReputationActionOccurred {
                user: bettor,
                action: 2,
                value: I256::try_from(value).unwrap(),
                referenceId: "1".into(),
                timestamp: U256::from(1_700_000_000u64),
            },
            REPUTATION,
            1_160,
            i as u32,
        );
    }
}

#[tokio::test]
async fn cold_start_indexes_first_steady_batch() {
    let chain = ScriptedChain::new(1_500);
    let storage = Arc::new(InMemoryStorage::new());
    let mut engine = builder(chain.clone(), 1_000)
        .storage(storage.clone())
        .build()
        .await
        .unwrap();

    match engine.step(None).await.unwrap() {
        Step::Committed { range, outcome, .. } => {
            assert_eq!(range, BlockRange::new(1_000, 1_099));
            assert_eq!(outcome, CommitOutcome::Persisted);
        }
        other => panic!("unexpected step {other:?}"),
    }

    let state = storage.load_state("test").await.unwrap().unwrap();
    assert_eq!(state.last_indexed_block, 1_099);
    assert_eq!(state.total_blocks_processed, 100);
    assert_eq!(engine.stats().snapshot().last_indexed_block, 1_099);
}

#[tokio::test]
async fn replaying_a_range_is_idempotent() {
    let chain = ScriptedChain::new(1_500);
    seed_activity(&chain);

    let once = Arc::new(InMemoryStorage::new());
    builder(chain.clone(), 1_000)
        .storage(once.clone())
        .build()
        .await
        .unwrap()
        .run_until(1_199)
        .await
        .unwrap();

    let twice = Arc::new(InMemoryStorage::new());
    for _ in 0..2 {
        // Fresh checkpoint each time, so the same range is applied again.
        builder(chain.clone(), 1_000)
            .projection_store(twice.clone())
            .checkpoint_store(Arc::new(MemoryCheckpointStore::new()))
            .build()
            .await
            .unwrap()
            .run_until(1_199)
            .await
            .unwrap();
    }

    assert!(once.same_projections(&twice));
    let counts = twice.counts().await.unwrap();
    assert_eq!(counts.raw_events, 12);
    assert_eq!(counts.bets, 2);
    assert_eq!(counts.slips, 1);
    assert_eq!(counts.reputation_actions, 2);

    let pool = twice.pool("1").await.unwrap().unwrap();
    assert_eq!(pool.total_bettor_stake, "250");
    assert_eq!(pool.total_liquidity, "900");
    assert_eq!(pool.bet_count, 1);

    let cycle = twice.cycle("4").await.unwrap().unwrap();
    assert_eq!(cycle.slip_count, 1);
    assert!(cycle.resolved);
    let slip = twice.slip("40").await.unwrap().unwrap();
    assert!(slip.evaluated);
    assert_eq!(slip.placed_block, Some(1_030));

    let user = format!("{:#x}", Address::repeat_byte(0xB1));
    let rep = twice.user_reputation(&user).await.unwrap().unwrap();
    assert_eq!(rep.total, 15);
    assert_eq!(rep.action_count, 2);
}

#[tokio::test]
async fn family_failure_blocks_the_checkpoint_and_retry_refetches_everything() {
    let chain = ScriptedChain::new(1_500);
    chain.emit(&pool_created(1, 0x10), POOL_CORE, 1_005, 0);
    chain.emit(&CycleStarted { cycleId: U256::from(1u64), endTime: U256::from(9u64) }, ODDYSSEY, 1_010, 0);
    chain.fail_event::<CycleStarted>(1);

    let storage = Arc::new(InMemoryStorage::new());
    let mut engine = builder(chain.clone(), 1_000)
        .storage(storage.clone())
        .build()
        .await
        .unwrap();

    match engine.step(None).await.unwrap() {
        Step::Failed { error, range, .. } => {
            assert!(matches!(error, SyncError::FamilyFailed { ref family, .. } if family == "cycles"));
            assert_eq!(range, Some(BlockRange::new(1_000, 1_099)));
        }
        other => panic!("unexpected step {other:?}"),
    }
    assert_eq!(engine.checkpoint().last_indexed_block(), 999);
    assert_eq!(storage.load_state("test").await.unwrap().unwrap().last_indexed_block, 999);
    assert_eq!(storage.counts().await.unwrap().raw_events, 0);
    assert_eq!(engine.checkpoint().state().recent_errors.len(), 1);
    assert_eq!(storage.error_history("test").len(), 1);

    let before = chain.queries().len();
    assert!(matches!(
        engine.step(None).await.unwrap(),
        Step::Committed { events: 2, .. }
    ));
    let retried: HashSet<String> = chain.queries()[before..]
        .iter()
        .filter(|(_, from, to)| (*from, *to) == (1_000, 1_099))
        .map(|(topic, _, _)| topic.clone())
        .collect();
    assert_eq!(retried.len(), 12);
    assert_eq!(engine.failures().consecutive_failures(), 0);
}

#[tokio::test]
async fn created_then_settled_leaves_one_terminal_row() {
    let chain = ScriptedChain::new(1_500);
    seed_activity(&chain);
    let storage = Arc::new(InMemoryStorage::new());
    let mut engine = builder(chain, 1_000)
        .storage(storage.clone())
        .build()
        .await
        .unwrap();
    engine.run_until(1_199).await.unwrap();

    let pool = storage.pool("1").await.unwrap().unwrap();
    assert_eq!(pool.status, PoolStatus::Settled);
    assert_eq!(pool.creator_side_won, Some(false));
    assert_eq!(pool.created_block, Some(1_005));
    assert_eq!(pool.odds.as_deref(), Some("175"));
    assert_eq!(pool.home_team.as_deref(), Some("TBD"));
    assert_eq!(storage.counts().await.unwrap().pools, 1);
}

#[tokio::test]
async fn progress_survives_restart_and_never_regresses() {
    let chain = ScriptedChain::new(1_500);
    let storage = Arc::new(InMemoryStorage::new());

    let mut first = builder(chain.clone(), 1_000)
        .storage(storage.clone())
        .build()
        .await
        .unwrap();
    first.run_until(1_299).await.unwrap();
    drop(first);

    let mut second = builder(chain.clone(), 1_000)
        .storage(storage.clone())
        .build()
        .await
        .unwrap();
    assert_eq!(second.checkpoint().last_indexed_block(), 1_299);
    second.run_until(1_399).await.unwrap();

    let state = storage.load_state("test").await.unwrap().unwrap();
    assert_eq!(state.last_indexed_block, 1_399);
    assert_eq!(state.total_blocks_processed, 400);

    let third = builder(chain, 5_000)
        .storage(storage.clone())
        .build()
        .await
        .unwrap();
    assert_eq!(third.checkpoint().last_indexed_block(), 1_399);
}

#[tokio::test]
async fn empty_batches_are_deferred_until_flush() {
    let chain = ScriptedChain::new(1_500);
    chain.emit(&pool_created(3, 0x30), POOL_CORE, 1_150, 0);
    let storage = Arc::new(InMemoryStorage::new());
    let mut engine = builder(chain, 1_001)
        .empty_batch_persist_interval(1_000)
        .storage(storage.clone())
        .build()
        .await
        .unwrap();
    let persisted = |s: Arc<InMemoryStorage>| async move {
        s.load_state("test").await.unwrap().unwrap().last_indexed_block
    };

    assert!(matches!(
        engine.step(None).await.unwrap(),
        Step::Committed { outcome: CommitOutcome::Deferred, .. }
    ));
    assert!(engine.checkpoint().has_unpersisted_progress());
    assert_eq!(engine.checkpoint().last_indexed_block(), 1_100);
    assert_eq!(persisted(storage.clone()).await, 1_000);

    assert!(matches!(
        engine.step(None).await.unwrap(),
        Step::Committed { outcome: CommitOutcome::Persisted, events: 1, .. }
    ));
    assert_eq!(persisted(storage.clone()).await, 1_200);

    assert!(matches!(
        engine.step(None).await.unwrap(),
        Step::Committed { outcome: CommitOutcome::Deferred, .. }
    ));
    engine.run_until(1_300).await.unwrap();
    assert_eq!(persisted(storage.clone()).await, 1_300);
    assert!(!engine.checkpoint().has_unpersisted_progress());
}

#[tokio::test]
async fn repeated_failures_rotate_the_provider() {
    let chain = ScriptedChain::new(1_500);
    chain.fail_queries(1_000);
    let storage = Arc::new(InMemoryStorage::new());
    let mut engine = builder(chain.clone(), 1_000)
        .failover_threshold(3)
        .storage(storage.clone())
        .build()
        .await
        .unwrap();

    let mut delays = Vec::new();
    for _ in 0..3 {
        match engine.step(None).await.unwrap() {
            Step::Failed { retry_in, .. } => delays.push(retry_in),
            other => panic!("unexpected step {other:?}"),
        }
    }

    assert_eq!(delays[0], Duration::from_millis(1));
    assert_eq!(delays[1], Duration::from_millis(2));
    assert_eq!(chain.rotations(), 1);
    assert_eq!(engine.failures().failovers(), 1);
    assert_eq!(engine.failures().consecutive_failures(), 0);
    assert_eq!(engine.checkpoint().last_indexed_block(), 999);
    assert_eq!(storage.error_history("test").len(), 3);
}

#[tokio::test]
async fn storage_failure_retries_the_same_range() {
    let chain = ScriptedChain::new(1_500);
    chain.emit(&pool_created(5, 0x50), POOL_CORE, 1_050, 0);
    let storage = Arc::new(InMemoryStorage::new());
    let mut engine = builder(chain, 1_000)
        .storage(storage.clone())
        .build()
        .await
        .unwrap();

    storage.fail_next_commits(1);
    assert!(matches!(
        engine.step(None).await.unwrap(),
        Step::Failed { error: SyncError::Storage(_), .. }
    ));
    assert_eq!(engine.checkpoint().last_indexed_block(), 999);

    match engine.step(None).await.unwrap() {
        Step::Committed { range, events, .. } => {
            assert_eq!(range, BlockRange::new(1_000, 1_099));
            assert_eq!(events, 1);
        }
        other => panic!("unexpected step {other:?}"),
    }
    assert!(storage.pool("5").await.unwrap().is_some());
}

#[tokio::test]
async fn failed_range_is_retried_unchanged_after_the_head_moves() {
    let chain = ScriptedChain::new(1_500);
    chain.emit(&pool_created(5, 0x50), POOL_CORE, 1_050, 0);
    let storage = Arc::new(InMemoryStorage::new());
    let mut engine = builder(chain.clone(), 1_000)
        .storage(storage.clone())
        .build()
        .await
        .unwrap();

    storage.fail_next_commits(1);
    match engine.step(None).await.unwrap() {
        Step::Failed { range, .. } => assert_eq!(range, Some(BlockRange::new(1_000, 1_099))),
        other => panic!("unexpected step {other:?}"),
    }

    // A fresh plan at this lag would span max_batch_size blocks.
    chain.set_head(50_000);
    match engine.step(None).await.unwrap() {
        Step::Committed { range, events, .. } => {
            assert_eq!(range, BlockRange::new(1_000, 1_099));
            assert_eq!(events, 1);
        }
        other => panic!("unexpected step {other:?}"),
    }

    match engine.step(None).await.unwrap() {
        Step::Committed { range, .. } => assert_eq!(range, BlockRange::new(1_100, 3_099)),
        other => panic!("unexpected step {other:?}"),
    }
}

#[tokio::test]
async fn malformed_logs_are_skipped() {
    let chain = ScriptedChain::new(1_500);
    chain.emit(&pool_created(8, 0x80), POOL_CORE, 1_030, 0);
    chain.push(RawLog {
        address: POOL_CORE.into(),
        topics: vec![format!("{:#x}", PoolCreated::SIGNATURE_HASH)],
        data: "0xdead".into(),
        block_number: format!("{:#x}", 1_020u64),
        block_hash: None,
        tx_hash: "0xbad".into(),
        log_index: "0x0".into(),
        removed: None,
    });

    let storage = Arc::new(InMemoryStorage::new());
    let mut engine = builder(chain, 1_000)
        .storage(storage.clone())
        .build()
        .await
        .unwrap();

    assert!(matches!(
        engine.step(None).await.unwrap(),
        Step::Committed { events: 1, .. }
    ));
    assert_eq!(storage.raw_events().len(), 1);
    assert_eq!(engine.failures().total_failures(), 0);
}

#[tokio::test]
async fn caught_up_engine_stops_on_shutdown() {
    let chain = ScriptedChain::new(1_500);
    let (tx, rx) = watch::channel(false);
    let mut engine = builder(chain, 1_489)
        .shutdown(rx)
        .build()
        .await
        .unwrap();

    assert!(matches!(
        engine.step(None).await.unwrap(),
        Step::CaughtUp { head: 1_500 }
    ));

    let handle = tokio::spawn(async move {
        engine.run().await.unwrap();
        engine
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    tx.send(true).unwrap();

    let engine = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("loop did not stop")
        .unwrap();
    assert_eq!(engine.checkpoint().last_indexed_block(), 1_488);
    assert_eq!(engine.stats().snapshot().batches, 0);
}

#[tokio::test]
async fn shutdown_before_start_runs_no_batch() {
    let chain = ScriptedChain::new(1_500);
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let mut engine = builder(chain.clone(), 1_000)
        .shutdown(rx)
        .build()
        .await
        .unwrap();

    engine.run().await.unwrap();
    assert_eq!(engine.checkpoint().last_indexed_block(), 999);
    assert!(chain.queries().is_empty());
}
