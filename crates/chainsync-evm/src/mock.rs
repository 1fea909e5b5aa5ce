//! In-process chain double for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use alloy_sol_types::SolEvent;
use async_trait::async_trait;

use chainsync_core::types::{BlockHeader, RawLog};
use chainsync_rpc::{ChainClient, ProviderHealth, TransportError};

use crate::abi::encode_log;

pub struct MockChain {
    head: AtomicU64,
    logs: Mutex<Vec<RawLog>>,
    /// topic0 → number of calls left to fail.
    failures: Mutex<HashMap<String, usize>>,
    queries: AtomicUsize,
    rotations: AtomicUsize,
}

impl MockChain {
    pub fn new(head: u64) -> Self {
        Self {
            head: AtomicU64::new(head),
            logs: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            queries: AtomicUsize::new(0),
            rotations: AtomicUsize::new(0),
        }
    }

    pub fn emit<E: SolEvent>(&self, event: &E, contract: &str, block: u64, log_index: u32) {
        let tx = format!("0x{block:064x}");
        self.logs
            .lock()
            .unwrap()
            .push(encode_log(event, contract, block, &tx, log_index));
    }

    pub fn push_raw(&self, log: RawLog) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn fail_topic<E: SolEvent>(&self, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert(format!("{:#x}", E::SIGNATURE_HASH), times);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn rotations(&self) -> usize {
        self.rotations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn current_height(&self) -> Result<u64, TransportError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_block(&self, number: u64) -> Result<BlockHeader, TransportError> {
        Ok(BlockHeader {
            number,
            hash: format!("0x{number:064x}"),
            parent_hash: format!("0x{:064x}", number.saturating_sub(1)),
            timestamp: number as i64,
        })
    }

    async fn query_logs(
        &self,
        contract: &str,
        topic0: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, TransportError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(left) = self.failures.lock().unwrap().get_mut(topic0) {
            if *left > 0 {
                *left -= 1;
                return Err(TransportError::Http("connection reset".into()));
            }
        }
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.address.eq_ignore_ascii_case(contract))
            .filter(|l| l.topics.first().map(String::as_str) == Some(topic0))
            .filter(|l| {
                l.block_number_u64()
                    .is_some_and(|b| b >= from && b <= to)
            })
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
