//! chainsync-core — chain-agnostic foundation of the ChainSync engine.
//!
//! # Architecture
//!
//! ```text
//! SyncLoop (chainsync-evm)
//!     ├── BatchScheduler     (lag tiers, batch-time EWMA, inter-batch delay)
//!     ├── ChainClient        (chainsync-rpc, weighted pool + circuit breaker)
//!     ├── EventFetcher       (per-family fan-out, decode to ChainEvent)
//!     ├── Dispatcher         (ProjectionWrite plans → ProjectionStore)
//!     ├── CheckpointManager  (IndexerState, the only durability point)
//!     └── FailureController  (consecutive errors, failover, backoff)
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod failure;
pub mod projection;
pub mod scheduler;
pub mod state;
pub mod types;

pub use checkpoint::{
    CheckpointBlock, CheckpointManager, CheckpointStore, CommitOutcome, MemoryCheckpointStore,
    PersistPolicy,
};
pub use config::{ChainSyncConfig, LogConfig, StartPosition, StorageBackend};
pub use error::SyncError;
pub use event::{ChainEvent, CycleEvent, EventFamily, MarketEvent, ReputationEvent, WagerEvent};
pub use failure::{FailureConfig, FailureController};
pub use projection::{
    EnrichmentSource, FixtureInfo, ProjectionCounts, ProjectionStore, ProjectionWrite,
};
pub use scheduler::{BatchScheduler, PlannedBatch, SchedulerConfig};
pub use state::{ErrorEntry, IndexerState};
pub use types::{BlockHeader, BlockRange, EventKey, RawEventRecord, RawLog};
