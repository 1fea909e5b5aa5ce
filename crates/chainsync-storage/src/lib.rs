//! chainsync-storage — projection and checkpoint storage backends for ChainSync.
//!
//! Every backend implements [`ProjectionStore`], [`CheckpointStore`] and
//! [`EnrichmentSource`] with the same merge rules.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, no persistence)
//! - `sqlite` — SQLite via `sqlx` (embedded, single-file persistence)
//! - `postgres` — PostgreSQL via `sqlx`
//!
//! [`ProjectionStore`]: chainsync_core::projection::ProjectionStore
//! [`CheckpointStore`]: chainsync_core::checkpoint::CheckpointStore
//! [`EnrichmentSource`]: chainsync_core::projection::EnrichmentSource

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStorage;
