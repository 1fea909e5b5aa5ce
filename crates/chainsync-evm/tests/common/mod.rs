//! Scripted chain shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::SolEvent;
use async_trait::async_trait;

use chainsync_core::config::ContractsConfig;
use chainsync_core::types::{BlockHeader, RawLog};
use chainsync_evm::abi::{encode_log, PoolCreated, PoolSettled};
use chainsync_evm::SyncEngineBuilder;
use chainsync_rpc::{ChainClient, ProviderHealth, TransportError};

pub const POOL_CORE: &str = "0x1111111111111111111111111111111111111111";
pub const ODDYSSEY: &str = "0x2222222222222222222222222222222222222222";
pub const REPUTATION: &str = "0x3333333333333333333333333333333333333333";

/// An in-process chain: a head, a set of logs, and scripted failures.
#[derive(Default)]
pub struct ScriptedChain {
    head: AtomicU64,
    logs: Mutex<Vec<RawLog>>,
    topic_failures: Mutex<HashMap<String, usize>>,
    query_failures: AtomicUsize,
    queries: Mutex<Vec<(String, u64, u64)>>,
    rotations: AtomicUsize,
}

impl ScriptedChain {
    pub fn new(head: u64) -> Arc<Self> {
        let chain = Self::default();
        chain.head.store(head, Ordering::SeqCst);
        Arc::new(chain)
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn emit<E: SolEvent>(&self, event: &E, contract: &str, block: u64, log_index: u32) {
        let tx = format!("0x{:064x}", block * 1_000 + u64::from(log_index));
        self.push(encode_log(event, contract, block, &tx, log_index));
    }

    pub fn push(&self, log: RawLog) {
        self.logs.lock().unwrap().push(log);
    }

    /// Fail the next `times` queries for event `E`.
    pub fn fail_event<E: SolEvent>(&self, times: usize) {
        self.topic_failures
            .lock()
            .unwrap()
            .insert(format!("{:#x}", E::SIGNATURE_HASH), times);
    }

    /// Fail the next `times` log queries of any kind.
    pub fn fail_queries(&self, times: usize) {
        self.query_failures.store(times, Ordering::SeqCst);
    }

    /// `(topic0, from, to)` of every successful query, in call order.
    pub fn queries(&self) -> Vec<(String, u64, u64)> {
        self.queries.lock().unwrap().clone()
    }

    pub fn rotations(&self) -> usize {
        self.rotations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn current_height(&self) -> Result<u64, TransportError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_block(&self, number: u64) -> Result<BlockHeader, TransportError> {
        Ok(BlockHeader {
            number,
            hash: format!("0x{number:064x}"),
            parent_hash: format!("0x{:064x}", number.saturating_sub(1)),
            timestamp: 1_700_000_000 + number as i64,
        })
    }

    async fn query_logs(
        &self,
        contract: &str,
        topic0: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, TransportError> {
        let pending = self.query_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.query_failures.store(pending - 1, Ordering::SeqCst);
            return Err(TransportError::Http("503 service unavailable".into()));
        }
        if let Some(left) = self.topic_failures.lock().unwrap().get_mut(topic0) {
            if *left > 0 {
                *left -= 1;
                return Err(TransportError::Http("connection reset by peer".into()));
            }
        }
        self.queries
            .lock()
            .unwrap()
            .push((topic0.to_string(), from, to));
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.address.eq_ignore_ascii_case(contract))
            .filter(|l| l.topics.first().map(String::as_str) == Some(topic0))
            .filter(|l| l.block_number_u64().is_some_and(|b| b >= from && b <= to))
            .cloned()
            .collect())
    }

    fn force_rotate(&self) {
        self.rotations.fetch_add(1, Ordering::SeqCst);
    }

    fn health(&self) -> Vec<ProviderHealth> {
        Vec::new()
    }
}

pub fn all_contracts() -> ContractsConfig {
    ContractsConfig {
        pool_core: Some(POOL_CORE.into()),
        oddyssey: Some(ODDYSSEY.into()),
        reputation: Some(REPUTATION.into()),
    }
}

/// Builder with test-friendly timings and every contract configured.
pub fn builder(chain: Arc<ScriptedChain>, start_block: u64) -> SyncEngineBuilder {
    SyncEngineBuilder::new()
        .id("test")
        .start_block(start_block)
        .confirmation_depth(12)
        .delays(Duration::ZERO, Duration::from_millis(5))
        .backoff(Duration::from_millis(1), Duration::from_millis(5))
        .contracts(all_contracts())
        .client(chain)
}

pub fn pool_created(pool_id: u64, market: u8) -> PoolCreated {
    PoolCreated {
        poolId: U256::from(pool_id),
        creator: Address::repeat_byte(0xC0),
        odds: U256::from(175u64),
        creatorStake: U256::from(5_000_000_000_000_000_000u128),
        eventStartTime: U256::from(1_700_100_000u64),
        eventEndTime: U256::from(1_700_107_200u64),
        marketId: B256::repeat_byte(market),
        predictedOutcome: B256::repeat_byte(0x01),
    }
}

pub fn pool_settled(pool_id: u64) -> PoolSettled {
    PoolSettled {
        poolId: U256::from(pool_id),
        result: B256::repeat_byte(0x02),
        creatorSideWon: false,
        timestamp: U256::from(1_700_108_000u64),
    }
}
