//! Typed chain events.
//!
//! Every decoded log becomes one variant of [`ChainEvent`], grouped by the
//! family it is fetched with. Handlers match on these exhaustively, so adding
//! an event forces every dispatch site to deal with it.
//!
//! Token amounts and 256-bit identifiers are carried as base-10 strings.

use serde::{Deserialize, Serialize};

/// A group of events fetched together for one block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFamily {
    /// Pool creation and settlement.
    Markets,
    /// Bets, liquidity and reward claims against pools.
    Wagers,
    /// Daily cycles and slips.
    Cycles,
    Reputation,
}

impl EventFamily {
    pub const ALL: [EventFamily; 4] = [
        EventFamily::Markets,
        EventFamily::Wagers,
        EventFamily::Cycles,
        EventFamily::Reputation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Markets => "markets",
            Self::Wagers => "wagers",
            Self::Cycles => "cycles",
            Self::Reputation => "reputation",
        }
    }
}

impl std::fmt::Display for EventFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool (market) lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MarketEvent {
    PoolCreated {
        pool_id: String,
        creator: String,
        odds: String,
        creator_stake: String,
        event_start_time: u64,
        event_end_time: u64,
        /// `0x`-prefixed bytes32 identifying the underlying fixture.
        market_id: String,
        predicted_outcome: String,
    },
    PoolSettled {
        pool_id: String,
        result: String,
        creator_side_won: bool,
        settled_at: u64,
    },
    PoolRefunded {
        pool_id: String,
        reason: String,
    },
}

/// Activity against an existing pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WagerEvent {
    BetPlaced {
        pool_id: String,
        bettor: String,
        amount: String,
    },
    LiquidityAdded {
        pool_id: String,
        provider: String,
        amount: String,
    },
    RewardClaimed {
        pool_id: String,
        claimant: String,
        amount: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CycleEvent {
    CycleStarted {
        cycle_id: String,
        end_time: u64,
    },
    SlipPlaced {
        cycle_id: String,
        player: String,
        slip_id: String,
    },
    SlipEvaluated {
        slip_id: String,
        player: String,
        cycle_id: String,
        correct_count: u8,
        final_score: String,
    },
    CycleResolved {
        cycle_id: String,
        prize_pool: String,
    },
    PrizeClaimed {
        cycle_id: String,
        player: String,
        rank: u64,
        amount: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReputationEvent {
    ReputationActionOccurred {
        user: String,
        action: u8,
        value: i64,
        reference_id: String,
        timestamp: u64,
    },
}

/// A decoded event, discriminated by family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", content = "event", rename_all = "snake_case")]
pub enum ChainEvent {
    Market(MarketEvent),
    Wager(WagerEvent),
    Cycle(CycleEvent),
    Reputation(ReputationEvent),
}

impl ChainEvent {
    pub fn family(&self) -> EventFamily {
        match self {
            Self::Market(_) => EventFamily::Markets,
            Self::Wager(_) => EventFamily::Wagers,
            Self::Cycle(_) => EventFamily::Cycles,
            Self::Reputation(_) => EventFamily::Reputation,
        }
    }

    /// The on-chain event name, e.g. `"PoolCreated"`.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Market(MarketEvent::PoolCreated { .. }) => "PoolCreated",
            Self::Market(MarketEvent::PoolSettled { .. }) => "PoolSettled",
            Self::Market(MarketEvent::PoolRefunded { .. }) => "PoolRefunded",
            Self::Wager(WagerEvent::BetPlaced { .. }) => "BetPlaced",
            Self::Wager(WagerEvent::LiquidityAdded { .. }) => "LiquidityAdded",
            Self::Wager(WagerEvent::RewardClaimed { .. }) => "RewardClaimed",
            Self::Cycle(CycleEvent::CycleStarted { .. }) => "CycleStarted",
            Self::Cycle(CycleEvent::SlipPlaced { .. }) => "SlipPlaced",
            Self::Cycle(CycleEvent::SlipEvaluated { .. }) => "SlipEvaluated",
            Self::Cycle(CycleEvent::CycleResolved { .. }) => "CycleResolved",
            Self::Cycle(CycleEvent::PrizeClaimed { .. }) => "PrizeClaimed",
            Self::Reputation(ReputationEvent::ReputationActionOccurred { .. }) => {
                "ReputationActionOccurred"
            }
        }
    }

    /// Event arguments as a flat JSON object (including a `type` field).
    pub fn args_json(&self) -> serde_json::Value {
        let value = match self {
            Self::Market(e) => serde_json::to_value(e),
            Self::Wager(e) => serde_json::to_value(e),
            Self::Cycle(e) => serde_json::to_value(e),
            Self::Reputation(e) => serde_json::to_value(e),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_and_family() {
        let ev = ChainEvent::Wager(WagerEvent::BetPlaced {
            pool_id: "7".into(),
            bettor: "0xabc".into(),
            amount: "1000".into(),
        });
        assert_eq!(ev.event_type(), "BetPlaced");
        assert_eq!(ev.family(), EventFamily::Wagers);
    }

    #[test]
    fn args_json_is_flat() {
        let ev = ChainEvent::Market(MarketEvent::PoolRefunded {
            pool_id: "3".into(),
            reason: "no bettors".into(),
        });
        let args = ev.args_json();
        assert_eq!(args["type"], "PoolRefunded");
        assert_eq!(args["pool_id"], "3");
        assert_eq!(args["reason"], "no bettors");
    }

    #[test]
    fn family_names() {
        let names: Vec<_> = EventFamily::ALL.iter().map(|f| f.as_str()).collect();
        assert_eq!(names, vec!["markets", "wagers", "cycles", "reputation"]);
    }
}
