//! `ChainClient`: the chain reads the sync engine needs.

use async_trait::async_trait;
use chainsync_core::types::{parse_hex_u64, BlockHeader, RawLog};
use serde::Deserialize;
use serde_json::Value;

use crate::error::TransportError;
use crate::pool::{ChainClientPool, ProviderHealth};
use crate::request::{block_param, LogFilter};

/// Upstream chain reads, plus the hooks the failure controller uses.
///
/// Implemented by [`ChainClientPool`]; tests substitute scripted clients.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn current_height(&self) -> Result<u64, TransportError>;

    async fn get_block(&self, number: u64) -> Result<BlockHeader, TransportError>;

    /// Logs emitted by `contract` with first topic `topic0` in `[from, to]`.
    async fn query_logs(
        &self,
        contract: &str,
        topic0: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, TransportError>;

    /// Move traffic away from the endpoint that served the last call.
    fn force_rotate(&self);

    fn health(&self) -> Vec<ProviderHealth>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
    number: String,
    hash: String,
    parent_hash: String,
    timestamp: String,
}

impl RpcBlock {
    fn into_header(self) -> Result<BlockHeader, TransportError> {
        let bad = |field: &str, v: &str| TransportError::Other(format!("block {field} is not hex: {v}"));
        Ok(BlockHeader {
            number: parse_hex_u64(&self.number).ok_or_else(|| bad("number", &self.number))?,
            timestamp: parse_hex_u64(&self.timestamp).ok_or_else(|| bad("timestamp", &self.timestamp))?
                as i64,
            hash: self.hash,
            parent_hash: self.parent_hash,
        })
    }
}

#[async_trait]
impl ChainClient for ChainClientPool {
    async fn current_height(&self) -> Result<u64, TransportError> {
        let hex: String = self.invoke_with_failover("eth_blockNumber", vec![]).await?;
        parse_hex_u64(&hex).ok_or_else(|| TransportError::Other(format!("bad block number: {hex}")))
    }

    async fn get_block(&self, number: u64) -> Result<BlockHeader, TransportError> {
        let block: Option<RpcBlock> = self
            .invoke_with_failover(
                "eth_getBlockByNumber",
                vec![block_param(number), Value::Bool(false)],
            )
            .await?;
        block
            .ok_or_else(|| TransportError::Other(format!("block {number} not found")))?
            .into_header()
    }

    async fn query_logs(
        &self,
        contract: &str,
        topic0: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, TransportError> {
        let filter = LogFilter::new(contract, topic0, from, to);
        self.invoke_with_failover("eth_getLogs", vec![filter.into_param()]).await
    }

    fn force_rotate(&self) {
        ChainClientPool::force_rotate(self)
    }

    fn health(&self) -> Vec<ProviderHealth> {
        ChainClientPool::health(self)
    }
}
