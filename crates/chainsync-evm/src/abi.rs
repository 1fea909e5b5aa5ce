//! Contract event ABIs and the log queries issued for each event family.

use alloy_primitives::B256;
use alloy_sol_types::{sol, SolEvent};

use chainsync_core::config::ContractsConfig;
use chainsync_core::event::EventFamily;
use chainsync_core::types::RawLog;

sol! {
    // ── pool core: market lifecycle ──
    event PoolCreated(
        uint256 indexed poolId,
        address indexed creator,
        uint256 odds,
        uint256 creatorStake,
        uint256 eventStartTime,
        uint256 eventEndTime,
        bytes32 marketId,
        bytes32 predictedOutcome
    );
    event PoolSettled(uint256 indexed poolId, bytes32 result, bool creatorSideWon, uint256 timestamp);
    event PoolRefunded(uint256 indexed poolId, string reason);

    // ── pool core: wagers ──
    event BetPlaced(uint256 indexed poolId, address indexed bettor, uint256 amount);
    event LiquidityAdded(uint256 indexed poolId, address indexed provider, uint256 amount);
    event RewardClaimed(uint256 indexed poolId, address indexed user, uint256 amount);

    // ── oddyssey: daily cycles ──
    event CycleStarted(uint256 indexed cycleId, uint256 endTime);
    event SlipPlaced(uint256 indexed cycleId, address indexed player, uint256 indexed slipId);
    event SlipEvaluated(
        uint256 indexed slipId,
        address indexed player,
        uint256 indexed cycleId,
        uint8 correctCount,
        uint256 finalScore
    );
    event CycleResolved(uint256 indexed cycleId, uint256 prizePool);
    event PrizeClaimed(uint256 indexed cycleId, address indexed player, uint256 rank, uint256 amount);

    // ── reputation ──
    event ReputationActionOccurred(
        address indexed user,
        uint8 action,
        int256 value,
        string referenceId,
        uint256 timestamp
    );
}

/// One `eth_getLogs` filter: a contract and an event signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub family: EventFamily,
    /// Event name, e.g. `"PoolCreated"`.
    pub event: &'static str,
    pub contract: String,
    pub topic0: B256,
}

impl LogQuery {
    /// `topic0` as a `0x`-prefixed hex string.
    pub fn topic0_hex(&self) -> String {
        format!("{:#x}", self.topic0)
    }
}

fn signature<E: SolEvent>() -> (&'static str, B256) {
    let name = E::SIGNATURE.split('(').next().unwrap_or(E::SIGNATURE);
    (name, E::SIGNATURE_HASH)
}

/// `(name, topic0)` of every event fetched with `family`.
pub fn family_events(family: EventFamily) -> Vec<(&'static str, B256)> {
    match family {
        EventFamily::Markets => vec![
            signature::<PoolCreated>(),
            signature::<PoolSettled>(),
            signature::<PoolRefunded>(),
        ],
        EventFamily::Wagers => vec![
            signature::<BetPlaced>(),
            signature::<LiquidityAdded>(),
            signature::<RewardClaimed>(),
        ],
        EventFamily::Cycles => vec![
            signature::<CycleStarted>(),
            signature::<SlipPlaced>(),
            signature::<SlipEvaluated>(),
            signature::<CycleResolved>(),
            signature::<PrizeClaimed>(),
        ],
        EventFamily::Reputation => vec![signature::<ReputationActionOccurred>()],
    }
}

/// Contract that emits `family`, if configured.
pub fn contract_for(family: EventFamily, contracts: &ContractsConfig) -> Option<&str> {
    match family {
        EventFamily::Markets | EventFamily::Wagers => contracts.pool_core.as_deref(),
        EventFamily::Cycles => contracts.oddyssey.as_deref(),
        EventFamily::Reputation => contracts.reputation.as_deref(),
    }
}

/// Every query for the configured contracts. Families without a contract are
/// left out.
pub fn log_queries(contracts: &ContractsConfig) -> Vec<LogQuery> {
    EventFamily::ALL
        .iter()
        .filter_map(|&family| contract_for(family, contracts).map(|c| (family, c)))
        .flat_map(|(family, contract)| {
            family_events(family)
                .into_iter()
                .map(move |(event, topic0)| LogQuery {
                    family,
                    event,
                    contract: contract.to_lowercase(),
                    topic0,
                })
        })
        .collect()
}

/// Encode `event` as the log a node would return for it.
///
/// Used to build replay fixtures and scripted chains.
pub fn encode_log<E: SolEvent>(
    event: &E,
    contract: &str,
    block_number: u64,
    tx_hash: &str,
    log_index: u32,
) -> RawLog {
    let data = event.encode_log_data();
    RawLog {
        address: contract.to_string(),
        topics: data.topics().iter().map(|t| format!("{t:#x}")).collect(),
        data: format!("0x{}", hex::encode(&data.data)),
        block_number: format!("{block_number:#x}"),
        block_hash: None,
        tx_hash: tx_hash.to_string(),
        log_index: format!("{log_index:#x}"),
        removed: Some(false),
    }
}
