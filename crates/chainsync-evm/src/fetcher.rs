//! Concurrent per-family log fetcher.
//!
//! For one block range every event family is fetched in parallel (one future
//! per family). Inside a family, each `(contract, topic0)` pair is queried in
//! turn, split into `max_logs_range` chunks since providers reject wide
//! `eth_getLogs` spans. A family failure fails the whole range: the caller
//! must retry it with every family, not just the one that failed.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use chainsync_core::config::ContractsConfig;
use chainsync_core::error::SyncError;
use chainsync_core::event::EventFamily;
use chainsync_core::types::{BlockRange, RawEventRecord};
use chainsync_rpc::ChainClient;

use crate::abi::{log_queries, LogQuery};
use crate::decoder::decode_logs;

/// The queries issued for one family.
#[derive(Debug, Clone)]
pub struct FamilyQueries {
    pub family: EventFamily,
    pub queries: Vec<LogQuery>,
}

/// Decoded events of one range, in chain order.
#[derive(Debug, Clone)]
pub struct FetchedBatch {
    pub range: BlockRange,
    /// Sorted by `(block_number, log_index)`, one record per key.
    pub records: Vec<RawEventRecord>,
    pub family_counts: BTreeMap<EventFamily, usize>,
    /// Logs skipped because they could not be decoded.
    pub malformed: usize,
}

impl FetchedBatch {
    pub fn total_events(&self) -> usize {
        self.records.len()
    }

    /// Number of events per block, for checkpoint markers.
    pub fn block_events(&self) -> BTreeMap<u64, u32> {
        let mut out = BTreeMap::new();
        for r in &self.records {
            *out.entry(r.key.block_number).or_insert(0u32) += 1;
        }
        out
    }
}

struct FamilyFetch {
    records: Vec<RawEventRecord>,
    malformed: usize,
}

pub struct EventFetcher {
    client: Arc<dyn ChainClient>,
    families: Vec<FamilyQueries>,
    max_logs_range: u64,
}

impl EventFetcher {
    pub fn new(client: Arc<dyn ChainClient>, queries: Vec<LogQuery>, max_logs_range: u64) -> Self {
        let mut families: Vec<FamilyQueries> = Vec::new();
        for q in queries {
            match families.iter_mut().find(|f| f.family == q.family) {
                Some(f) => f.queries.push(q),
                None => families.push(FamilyQueries {
                    family: q.family,
                    queries: vec![q],
                }),
            }
        }
        Self {
            client,
            families,
            max_logs_range: max_logs_range.max(1),
        }
    }

    /// Fetcher for every family whose contract is configured.
    pub fn from_contracts(
        client: Arc<dyn ChainClient>,
        contracts: &ContractsConfig,
        max_logs_range: u64,
    ) -> Self {
        Self::new(client, log_queries(contracts), max_logs_range)
    }

    pub fn families(&self) -> Vec<EventFamily> {
        self.families.iter().map(|f| f.family).collect()
    }

    /// Fetch and decode every family over `range`.
    pub async fn fetch_range(&self, range: BlockRange) -> Result<FetchedBatch, SyncError> {
        let results = join_all(
            self.families
                .iter()
                .map(|f| async move { (f.family, self.fetch_family(f, range).await) }),
        )
        .await;

        let mut records = Vec::new();
        let mut family_counts = BTreeMap::new();
        let mut malformed = 0;
        let mut failed: Vec<(EventFamily, SyncError)> = Vec::new();

        for (family, result) in results {
            match result {
                Ok(fetch) => {
                    family_counts.insert(family, fetch.records.len());
                    malformed += fetch.malformed;
                    records.extend(fetch.records);
                }
                Err(e) => {
                    warn!(family = %family, %range, error = %e, "family fetch failed");
                    failed.push((family, e));
                }
            }
        }

        if let Some((_, first)) = failed.first() {
            let names: Vec<&str> = failed.iter().map(|(f, _)| f.as_str()).collect();
            return Err(SyncError::FamilyFailed {
                family: names.join(","),
                reason: first.to_string(),
            });
        }

        records.sort_by(|a, b| {
            (a.key.block_number, a.key.log_index).cmp(&(b.key.block_number, b.key.log_index))
        });
        records.dedup_by(|a, b| a.key == b.key);

        debug!(%range, events = records.len(), malformed, "range fetched");
        Ok(FetchedBatch {
            range,
            records,
            family_counts,
            malformed,
        })
    }

    async fn fetch_family(
        &self,
        family: &FamilyQueries,
        range: BlockRange,
    ) -> Result<FamilyFetch, SyncError> {
        let mut logs = Vec::new();
        for q in &family.queries {
            let topic0 = q.topic0_hex();
            for chunk in range.chunks(self.max_logs_range) {
                let batch = self
                    .client
                    .query_logs(&q.contract, &topic0, chunk.from, chunk.to)
                    .await?;
                logs.extend(batch);
            }
        }
        let decoded = decode_logs(family.family, &logs);
        Ok(FamilyFetch {
            records: decoded.records,
            malformed: decoded.malformed,
        })
    }
}
