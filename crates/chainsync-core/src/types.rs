//! Shared types for the sync pipeline.

use serde::{Deserialize, Serialize};

use crate::event::{ChainEvent, EventFamily};

// ─── BlockHeader ──────────────────────────────────────────────────────────────

/// The subset of a block header the engine needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
}

// ─── RawLog ───────────────────────────────────────────────────────────────────

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash", default)]
    pub block_hash: Option<String>,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Option<u64> {
        parse_hex_u64(&self.block_number)
    }

    pub fn log_index_u32(&self) -> Option<u32> {
        parse_hex_u64(&self.log_index).and_then(|v| u32::try_from(v).ok())
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    /// `tx_hash:log_index`, used to point at a log in warnings.
    pub fn location(&self) -> String {
        format!("{}:{}", self.tx_hash, self.log_index)
    }
}

/// Parse a hex-encoded quantity (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

// ─── EventKey / RawEventRecord ────────────────────────────────────────────────

/// Natural key of a log: `(block_number, tx_hash, log_index)`.
///
/// Every downstream write is keyed on this triple so redelivered logs are
/// applied at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u32,
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.block_number, self.tx_hash, self.log_index)
    }
}

/// One decoded log. Immutable once produced by the decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEventRecord {
    pub key: EventKey,
    pub contract_address: String,
    pub event: ChainEvent,
}

impl RawEventRecord {
    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }

    pub fn family(&self) -> EventFamily {
        self.event.family()
    }

    /// The decoded arguments as JSON, as stored in the audit log.
    pub fn decoded_args(&self) -> serde_json::Value {
        self.event.args_json()
    }
}

// ─── BlockRange ───────────────────────────────────────────────────────────────

/// An inclusive block range processed as one atomic batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    /// Number of blocks in the range.
    pub fn len(&self) -> u64 {
        if self.to < self.from {
            0
        } else {
            self.to - self.from + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split into consecutive sub-ranges of at most `max_len` blocks.
    pub fn chunks(&self, max_len: u64) -> Vec<BlockRange> {
        let max_len = max_len.max(1);
        let mut out = Vec::new();
        let mut start = self.from;
        while start <= self.to {
            let end = start.saturating_add(max_len - 1).min(self.to);
            out.push(BlockRange::new(start, end));
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }
        out
    }

    /// Returns `true` if some block in the range is a multiple of `interval`.
    pub fn crosses_multiple_of(&self, interval: u64) -> bool {
        if interval == 0 || self.is_empty() {
            return false;
        }
        let first = self.from.div_ceil(interval) * interval;
        first <= self.to
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_quantities() {
        assert_eq!(parse_hex_u64("0x1"), Some(1));
        assert_eq!(parse_hex_u64("0xff"), Some(255));
        assert_eq!(parse_hex_u64("1234"), Some(0x1234));
        assert_eq!(parse_hex_u64("0x"), None);
        assert_eq!(parse_hex_u64("0xzz"), None);
    }

    #[test]
    fn raw_log_from_rpc_json() {
        let log: RawLog = serde_json::from_value(serde_json::json!({
            "address": "0x00000000000000000000000000000000000000aa",
            "topics": ["0x01"],
            "data": "0x",
            "blockNumber": "0x12a05f200",
            "blockHash": "0xbb",
            "transactionHash": "0xcc",
            "logIndex": "0x5",
            "removed": false
        }))
        .unwrap();
        assert_eq!(log.block_number_u64(), Some(5_000_000_000));
        assert_eq!(log.log_index_u32(), Some(5));
        assert!(!log.is_removed());
        assert_eq!(log.location(), "0xcc:0x5");
    }

    #[test]
    fn range_len_and_chunks() {
        let r = BlockRange::new(100, 349);
        assert_eq!(r.len(), 250);
        let chunks = r.chunks(100);
        assert_eq!(
            chunks,
            vec![
                BlockRange::new(100, 199),
                BlockRange::new(200, 299),
                BlockRange::new(300, 349)
            ]
        );
        assert!(BlockRange::new(5, 4).is_empty());
    }

    #[test]
    fn range_crosses_interval() {
        assert!(BlockRange::new(95, 105).crosses_multiple_of(100));
        assert!(BlockRange::new(100, 100).crosses_multiple_of(100));
        assert!(!BlockRange::new(101, 199).crosses_multiple_of(100));
        assert!(!BlockRange::new(1, 10).crosses_multiple_of(0));
    }

    #[test]
    fn event_keys_order_by_block_then_tx() {
        let a = EventKey { block_number: 10, tx_hash: "0xb".into(), log_index: 0 };
        let b = EventKey { block_number: 11, tx_hash: "0xa".into(), log_index: 0 };
        assert!(a < b);
        assert_eq!(a.to_string(), "10/0xb:0");
    }
}
