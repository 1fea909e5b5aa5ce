//! Fluent builder for the sync engine.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainsync_core::config::ContractsConfig;
//! use chainsync_evm::SyncEngineBuilder;
//! # async fn demo(client: Arc<dyn chainsync_rpc::ChainClient>) -> Result<(), chainsync_core::SyncError> {
//! let mut engine = SyncEngineBuilder::new()
//!     .id("mainnet")
//!     .start_block(164_000_000)
//!     .confirmation_depth(12)
//!     .contracts(ContractsConfig {
//!         pool_core: Some("0x5f3c...".into()),
//!         ..Default::default()
//!     })
//!     .client(client)
//!     .build()
//!     .await?;
//! engine.run().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use chainsync_core::checkpoint::{CheckpointManager, CheckpointStore, PersistPolicy};
use chainsync_core::config::{
    ChainSyncConfig, ContractsConfig, FailureSection, IndexerConfig, StartPosition,
};
use chainsync_core::error::SyncError;
use chainsync_core::failure::FailureController;
use chainsync_core::projection::{EnrichmentSource, ProjectionStore};
use chainsync_core::scheduler::BatchScheduler;
use chainsync_rpc::ChainClient;
use chainsync_storage::InMemoryStorage;

use crate::abi::log_queries;
use crate::dispatcher::Dispatcher;
use crate::fetcher::EventFetcher;
use crate::handlers::HandlerRegistry;
use crate::sync_loop::SyncLoop;

/// Fluent builder for a [`SyncLoop`].
///
/// Storage defaults to [`InMemoryStorage`] for whatever was not supplied.
#[derive(Default)]
pub struct SyncEngineBuilder {
    indexer: IndexerConfig,
    failure: FailureSection,
    contracts: ContractsConfig,
    client: Option<Arc<dyn ChainClient>>,
    projections: Option<Arc<dyn ProjectionStore>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    enrichment: Option<Arc<dyn EnrichmentSource>>,
    registry: Option<HandlerRegistry>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl SyncEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder seeded with the indexer, failure and contract sections.
    pub fn from_config(config: &ChainSyncConfig) -> Self {
        Self {
            indexer: config.indexer.clone(),
            failure: config.failure.clone(),
            contracts: config.contracts.clone(),
            ..Self::default()
        }
    }

    /// Set the indexer ID (key of the persisted state row).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.indexer.id = id.into();
        self
    }

    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.indexer.chain = chain.into();
        self
    }

    /// First block to index when no state exists.
    pub fn start_block(mut self, block: u64) -> Self {
        self.indexer.start_block = Some(block);
        self
    }

    /// Start near the head when no state exists.
    pub fn start_recent(mut self, lookback: u64) -> Self {
        self.indexer.start_block = None;
        self.indexer.recent_lookback = lookback;
        self
    }

    /// Blocks behind head before a block is indexed.
    pub fn confirmation_depth(mut self, depth: u64) -> Self {
        self.indexer.confirmation_depth = depth;
        self
    }

    /// Steady, medium and maximum batch sizes.
    pub fn batch_sizes(mut self, steady: u64, medium: u64, max: u64) -> Self {
        self.indexer.steady_batch_size = steady;
        self.indexer.medium_batch_size = medium;
        self.indexer.max_batch_size = max;
        self
    }

    /// Lag above which the medium and maximum batch sizes apply.
    pub fn lag_thresholds(mut self, medium: u64, large: u64) -> Self {
        self.indexer.medium_lag_threshold = medium;
        self.indexer.large_lag_threshold = large;
        self
    }

    pub fn max_logs_range(mut self, blocks: u64) -> Self {
        self.indexer.max_logs_range = blocks;
        self
    }

    /// Pause between batches, and when caught up.
    pub fn delays(mut self, base: Duration, idle: Duration) -> Self {
        self.indexer.base_delay_ms = base.as_millis() as u64;
        self.indexer.idle_delay_ms = idle.as_millis() as u64;
        self
    }

    pub fn checkpoint_block_interval(mut self, n: u64) -> Self {
        self.indexer.checkpoint_block_interval = n;
        self
    }

    /// Persist empty batches only when they cross a multiple of `n` (0 = always).
    pub fn empty_batch_persist_interval(mut self, n: u64) -> Self {
        self.indexer.empty_batch_persist_interval = n;
        self
    }

    pub fn failover_threshold(mut self, n: u32) -> Self {
        self.failure.failover_threshold = n;
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.failure.base_backoff_ms = base.as_millis() as u64;
        self.failure.max_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn contracts(mut self, contracts: ContractsConfig) -> Self {
        self.contracts = contracts;
        self
    }

    pub fn client(mut self, client: Arc<dyn ChainClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Use one backend for projections, checkpoints and enrichment.
    pub fn storage<S>(mut self, storage: Arc<S>) -> Self
    where
        S: ProjectionStore + CheckpointStore + EnrichmentSource + 'static,
    {
        self.projections = Some(storage.clone() as Arc<dyn ProjectionStore>);
        self.checkpoints = Some(storage.clone() as Arc<dyn CheckpointStore>);
        self.enrichment = Some(storage as Arc<dyn EnrichmentSource>);
        self
    }

    pub fn projection_store(mut self, store: Arc<dyn ProjectionStore>) -> Self {
        self.projections = Some(store);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn enrichment(mut self, source: Arc<dyn EnrichmentSource>) -> Self {
        self.enrichment = Some(source);
        self
    }

    /// Replace the built-in handlers.
    pub fn handlers(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// The loop stops before its next batch once this reads `true`.
    pub fn shutdown(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(rx);
        self
    }

    pub fn indexer_config(&self) -> &IndexerConfig {
        &self.indexer
    }

    /// Load (or seed) the checkpoint and assemble the loop.
    ///
    /// A "recent" start queries the chain head only when no state exists.
    pub async fn build(self) -> Result<SyncLoop, SyncError> {
        let client = self
            .client
            .ok_or_else(|| SyncError::Config("a chain client is required".into()))?;
        let queries = log_queries(&self.contracts);
        if queries.is_empty() {
            return Err(SyncError::Config(
                "contracts: no contract addresses configured".into(),
            ));
        }

        let memory = Arc::new(InMemoryStorage::new());
        let projections = self
            .projections
            .unwrap_or_else(|| memory.clone() as Arc<dyn ProjectionStore>);
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| memory.clone() as Arc<dyn CheckpointStore>);
        let enrichment = self
            .enrichment
            .unwrap_or_else(|| memory.clone() as Arc<dyn EnrichmentSource>);

        let ix = self.indexer;
        let seed = match checkpoints.load_state(&ix.id).await? {
            Some(_) => 0,
            None => {
                let start = ix.start_position();
                let head = match start {
                    StartPosition::Height(_) => 0,
                    StartPosition::Recent { .. } => {
                        client.current_height().await?
                    }
                };
                let seed = start.seed_last_indexed(head, ix.confirmation_depth);
                info!(indexer_id = %ix.id, ?start, seed_last_indexed = seed, "no saved state, seeding");
                seed
            }
        };

        let policy = PersistPolicy {
            checkpoint_block_interval: ix.checkpoint_block_interval,
            empty_batch_persist_interval: ix.empty_batch_persist_interval,
            error_history: self.failure.error_history,
        };
        let checkpoint = CheckpointManager::load_or_seed(checkpoints, &ix.id, policy, seed).await?;

        let registry = self
            .registry
            .unwrap_or_else(|| HandlerRegistry::with_defaults(enrichment));
        let shutdown = self.shutdown.unwrap_or_else(|| watch::channel(false).1);

        Ok(SyncLoop::new(
            client.clone(),
            EventFetcher::new(client, queries, ix.max_logs_range),
            Dispatcher::new(projections, registry),
            checkpoint,
            BatchScheduler::new(ix.scheduler()),
            FailureController::new(self.failure.controller()),
            shutdown,
        ))
    }
}
