//! Raw log → [`RawEventRecord`] decoding.
//!
//! Decoding failures are a data-quality problem, not a batch failure: the
//! offending log is logged and skipped.

use std::str::FromStr;

use alloy_primitives::{Address, B256, I256, U256};
use alloy_sol_types::SolEvent;
use tracing::{debug, warn};

use chainsync_core::error::SyncError;
use chainsync_core::event::{ChainEvent, CycleEvent, EventFamily, MarketEvent, ReputationEvent, WagerEvent};
use chainsync_core::types::{EventKey, RawEventRecord, RawLog};

use crate::abi::{
    BetPlaced, CycleResolved, CycleStarted, LiquidityAdded, PoolCreated, PoolRefunded,
    PoolSettled, PrizeClaimed, ReputationActionOccurred, RewardClaimed, SlipEvaluated, SlipPlaced,
};

/// Result of decoding the logs of one family.
#[derive(Debug, Default)]
pub struct Decoded {
    pub records: Vec<RawEventRecord>,
    /// Logs flagged `removed` by the node.
    pub removed: usize,
    /// Logs that could not be decoded.
    pub malformed: usize,
}

/// Decode every log, skipping removed and malformed ones.
pub fn decode_logs(family: EventFamily, logs: &[RawLog]) -> Decoded {
    let mut out = Decoded::default();
    for log in logs {
        match decode_log(log) {
            Ok(Some(record)) => out.records.push(record),
            Ok(None) => {
                debug!(family = %family, log = %log.location(), "skipping removed log");
                out.removed += 1;
            }
            Err(e) => {
                warn!(family = %family, error = %e, "skipping undecodable log");
                out.malformed += 1;
            }
        }
    }
    out
}

/// Decode one log. Returns `Ok(None)` for logs removed by a reorg.
pub fn decode_log(log: &RawLog) -> Result<Option<RawEventRecord>, SyncError> {
    if log.is_removed() {
        return Ok(None);
    }

    let fail = |event: &str, reason: String| SyncError::Decode {
        event: event.to_string(),
        location: log.location(),
        reason,
    };

    let block_number = log
        .block_number_u64()
        .ok_or_else(|| fail("unknown", format!("bad blockNumber '{}'", log.block_number)))?;
    let log_index = log
        .log_index_u32()
        .ok_or_else(|| fail("unknown", format!("bad logIndex '{}'", log.log_index)))?;

    let topics = log
        .topics
        .iter()
        .map(|t| B256::from_str(t).map_err(|e| fail("unknown", format!("bad topic '{t}': {e}"))))
        .collect::<Result<Vec<_>, _>>()?;
    let topic0 = *topics
        .first()
        .ok_or_else(|| fail("unknown", "log has no topics".into()))?;
    let data = hex::decode(log.data.strip_prefix("0x").unwrap_or(&log.data))
        .map_err(|e| fail("unknown", format!("bad data: {e}")))?;

    let event = decode_event(topic0, &topics, &data).map_err(|(event, reason)| fail(event, reason))?;

    Ok(Some(RawEventRecord {
        key: EventKey {
            block_number,
            tx_hash: log.tx_hash.to_lowercase(),
            log_index,
        },
        contract_address: log.address.to_lowercase(),
        event,
    }))
}

type DecodeResult<T> = Result<T, (&'static str, String)>;

fn raw<E: SolEvent>(name: &'static str, topics: &[B256], data: &[u8]) -> DecodeResult<E> {
    E::decode_raw_log(topics.iter().copied(), data, true).map_err(|e| (name, e.to_string()))
}

fn small(name: &'static str, field: &str, v: U256) -> DecodeResult<u64> {
    u64::try_from(v).map_err(|_| (name, format!("{field} out of range: {v}")))
}

fn addr(a: Address) -> String {
    format!("{a:#x}")
}

fn word(w: B256) -> String {
    format!("{w:#x}")
}

fn decode_event(topic0: B256, topics: &[B256], data: &[u8]) -> DecodeResult<ChainEvent> {
    let event = match topic0 {
        t if t == PoolCreated::SIGNATURE_HASH => {
            let n = "PoolCreated";
            let e: PoolCreated = raw(n, topics, data)?;
            ChainEvent::Market(MarketEvent::PoolCreated {
                pool_id: e.poolId.to_string(),
                creator: addr(e.creator),
                odds: e.odds.to_string(),
                creator_stake: e.creatorStake.to_string(),
                event_start_time: small(n, "eventStartTime", e.eventStartTime)?,
                event_end_time: small(n, "eventEndTime", e.eventEndTime)?,
                market_id: word(e.marketId),
                predicted_outcome: word(e.predictedOutcome),
            })
        }
        t if t == PoolSettled::SIGNATURE_HASH => {
            let n = "PoolSettled";
            let e: PoolSettled = raw(n, topics, data)?;
            ChainEvent::Market(MarketEvent::PoolSettled {
                pool_id: e.poolId.to_string(),
                result: word(e.result),
                creator_side_won: e.creatorSideWon,
                settled_at: small(n, "timestamp", e.timestamp)?,
            })
        }
        t if t == PoolRefunded::SIGNATURE_HASH => {
            let e: PoolRefunded = raw("PoolRefunded", topics, data)?;
            ChainEvent::Market(MarketEvent::PoolRefunded {
                pool_id: e.poolId.to_string(),
                reason: e.reason,
            })
        }
        t if t == BetPlaced::SIGNATURE_HASH => {
            let e: BetPlaced = raw("BetPlaced", topics, data)?;
            ChainEvent::Wager(WagerEvent::BetPlaced {
                pool_id: e.poolId.to_string(),
                bettor: addr(e.bettor),
                amount: e.amount.to_string(),
            })
        }
        t if t == LiquidityAdded::SIGNATURE_HASH => {
            let e: LiquidityAdded = raw("LiquidityAdded", topics, data)?;
            ChainEvent::Wager(WagerEvent::LiquidityAdded {
                pool_id: e.poolId.to_string(),
                provider: addr(e.provider),
                amount: e.amount.to_string(),
            })
        }
        t if t == RewardClaimed::SIGNATURE_HASH => {
            let e: RewardClaimed = raw("RewardClaimed", topics, data)?;
            ChainEvent::Wager(WagerEvent::RewardClaimed {
                pool_id: e.poolId.to_string(),
                claimant: addr(e.user),
                amount: e.amount.to_string(),
            })
        }
        t if t == CycleStarted::SIGNATURE_HASH => {
            let n = "CycleStarted";
            let e: CycleStarted = raw(n, topics, data)?;
            ChainEvent::Cycle(CycleEvent::CycleStarted {
                cycle_id: e.cycleId.to_string(),
                end_time: small(n, "endTime", e.endTime)?,
            })
        }
        t if t == SlipPlaced::SIGNATURE_HASH => {
            let e: SlipPlaced = raw("SlipPlaced", topics, data)?;
            ChainEvent::Cycle(CycleEvent::SlipPlaced {
                cycle_id: e.cycleId.to_string(),
                player: addr(e.player),
                slip_id: e.slipId.to_string(),
            })
        }
        t if t == SlipEvaluated::SIGNATURE_HASH => {
            let e: SlipEvaluated = raw("SlipEvaluated", topics, data)?;
            ChainEvent::Cycle(CycleEvent::SlipEvaluated {
                slip_id: e.slipId.to_string(),
                player: addr(e.player),
                cycle_id: e.cycleId.to_string(),
                correct_count: e.correctCount,
                final_score: e.finalScore.to_string(),
            })
        }
        t if t == CycleResolved::SIGNATURE_HASH => {
            let e: CycleResolved = raw("CycleResolved", topics, data)?;
            ChainEvent::Cycle(CycleEvent::CycleResolved {
                cycle_id: e.cycleId.to_string(),
                prize_pool: e.prizePool.to_string(),
            })
        }
        t if t == PrizeClaimed::SIGNATURE_HASH => {
            let n = "PrizeClaimed";
            let e: PrizeClaimed = raw(n, topics, data)?;
            ChainEvent::Cycle(CycleEvent::PrizeClaimed {
                cycle_id: e.cycleId.to_string(),
                player: addr(e.player),
                rank: small(n, "rank", e.rank)?,
                amount: e.amount.to_string(),
            })
        }
        t if t == ReputationActionOccurred::SIGNATURE_HASH => {
            let n = "ReputationActionOccurred";
            let e: ReputationActionOccurred = raw(n, topics, data)?;
            let value: I256 = e.value;
            ChainEvent::Reputation(ReputationEvent::ReputationActionOccurred {
                user: addr(e.user),
                action: e.action,
                value: i64::try_from(value).map_err(|_| (n, format!("value out of range: {value}")))?,
                reference_id: e.referenceId,
                timestamp: small(n, "timestamp", e.timestamp)?,
            })
        }
        other => return Err(("unknown", format!("unknown event signature {other:#x}"))),
    };
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::encode_log;

    #[test]
    fn decodes_pool_created() {
        let ev = PoolCreated {
            poolId: U256::from(42u64),
            creator: Address::repeat_byte(0xAB),
            odds: U256::from(180u64),
            creatorStake: U256::from(10u64).pow(U256::from(21u64)),
            eventStartTime: U256::from(1_700_000_000u64),
            eventEndTime: U256::from(1_700_007_200u64),
            marketId: B256::repeat_byte(0x11),
            predictedOutcome: B256::repeat_byte(0x01),
        };
        let log = encode_log(&ev, "0xPOOL", 120, "0xTX", 4);
        let record = decode_log(&log).unwrap().unwrap();

        assert_eq!(record.key.block_number, 120);
        assert_eq!(record.key.log_index, 4);
        assert_eq!(record.key.tx_hash, "0xtx");
        assert_eq!(record.contract_address, "0xpool");
        match record.event {
            ChainEvent::Market(MarketEvent::PoolCreated {
                pool_id,
                creator,
                creator_stake,
                event_end_time,
                market_id,
                ..
            }) => {
                assert_eq!(pool_id, "42");
                assert_eq!(creator, format!("0x{}", "ab".repeat(20)));
                assert_eq!(creator_stake, "1000000000000000000000");
                assert_eq!(event_end_time, 1_700_007_200);
                assert_eq!(market_id, format!("0x{}", "11".repeat(32)));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn decodes_negative_reputation() {
        let ev = ReputationActionOccurred {
            user: Address::repeat_byte(0x02),
            action: 3,
            value: I256::try_from(-25i64).unwrap(),
            referenceId: "slip-9".into(),
            timestamp: U256::from(1_700_000_123u64),
        };
        let record = decode_log(&encode_log(&ev, "0xrep", 5, "0xt", 0)).unwrap().unwrap();
        assert_eq!(
            record.event,
            ChainEvent::Reputation(ReputationEvent::ReputationActionOccurred {
                user: format!("0x{}", "02".repeat(20)),
                action: 3,
                value: -25,
                reference_id: "slip-9".into(),
                timestamp: 1_700_000_123,
            })
        );
    }

    #[test]
    fn removed_logs_are_skipped() {
        let ev = CycleStarted {
            cycleId: U256::from(1u64),
            endTime: U256::from(2u64),
        };
        let mut log = encode_log(&ev, "0xodd", 1, "0xt", 0);
        log.removed = Some(true);
        assert!(decode_log(&log).unwrap().is_none());

        let decoded = decode_logs(EventFamily::Cycles, &[log]);
        assert!(decoded.records.is_empty());
        assert_eq!(decoded.removed, 1);
    }

    #[test]
    fn malformed_logs_are_counted_not_fatal() {
        let good = CycleResolved {
            cycleId: U256::from(3u64),
            prizePool: U256::from(500u64),
        };
        let good_log = encode_log(&good, "0xodd", 9, "0xt", 1);
        let mut truncated = good_log.clone();
        truncated.data = "0x1234".into();
        let mut unknown = good_log.clone();
        unknown.topics[0] = format!("{:#x}", B256::repeat_byte(0xEE));

        let err = decode_log(&truncated).unwrap_err();
        assert!(matches!(err, SyncError::Decode { ref event, .. } if event == "CycleResolved"));
        assert!(!err.aborts_batch());

        let decoded = decode_logs(EventFamily::Cycles, &[truncated, good_log, unknown]);
        assert_eq!(decoded.records.len(), 1);
        assert_eq!(decoded.malformed, 2);
    }

    #[test]
    fn oversized_timestamp_is_a_decode_error() {
        let ev = CycleStarted {
            cycleId: U256::from(1u64),
            endTime: U256::MAX,
        };
        let err = decode_log(&encode_log(&ev, "0xodd", 1, "0xt", 0)).unwrap_err();
        assert!(err.to_string().contains("endTime out of range"));
    }
}
