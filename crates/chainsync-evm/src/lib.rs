//! chainsync-evm — EVM side of the sync engine.
//!
//! - [`abi`] — contract event definitions and the log queries per family
//! - [`decoder`] — raw log → typed [`RawEventRecord`](chainsync_core::RawEventRecord)
//! - [`fetcher`] — concurrent per-family fetch of one block range
//! - [`handlers`] / [`dispatcher`] — projection planning and batch commit
//! - [`sync_loop`] — the serial batch loop
//! - [`health`] — periodic health snapshots
//! - [`builder`] — fluent construction of the loop

pub mod abi;
pub mod builder;
pub mod decoder;
pub mod dispatcher;
pub mod fetcher;
pub mod handlers;
pub mod health;
pub mod sync_loop;

#[cfg(test)]
mod mock;

pub use builder::SyncEngineBuilder;
pub use dispatcher::Dispatcher;
pub use fetcher::{EventFetcher, FetchedBatch};
pub use handlers::{HandlerRegistry, ProjectionHandler};
pub use health::HealthReporter;
pub use sync_loop::{StatsSnapshot, Step, SyncLoop, SyncStats};
