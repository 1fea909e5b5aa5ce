//! Projection dispatcher.
//!
//! Routes each record to the handlers of its family, appends the raw-event
//! audit row, and commits the whole batch as one unit.

use std::sync::Arc;

use tracing::debug;

use chainsync_core::error::SyncError;
use chainsync_core::projection::{ProjectionStore, ProjectionWrite};
use chainsync_core::types::RawEventRecord;

use crate::handlers::HandlerRegistry;

pub struct Dispatcher {
    store: Arc<dyn ProjectionStore>,
    registry: HandlerRegistry,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn ProjectionStore>, registry: HandlerRegistry) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn ProjectionStore> {
        &self.store
    }

    /// Writes for one record: its handlers' writes, then the audit row.
    ///
    /// A record with no handler still gets its audit row.
    pub async fn plan(&self, record: &RawEventRecord) -> Result<Vec<ProjectionWrite>, SyncError> {
        let mut writes = Vec::new();
        for handler in self.registry.handlers_for(record.family()) {
            writes.extend(handler.plan(record).await?);
        }
        writes.push(ProjectionWrite::RawEvent(record.clone()));
        Ok(writes)
    }

    /// Apply a single record.
    pub async fn apply(&self, record: &RawEventRecord) -> Result<(), SyncError> {
        let writes = self.plan(record).await?;
        self.store.commit(&writes).await
    }

    /// Apply `records` in order as one commit. Returns the number of writes.
    ///
    /// Any handler or storage failure leaves the store untouched.
    pub async fn apply_batch(&self, records: &[RawEventRecord]) -> Result<usize, SyncError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut writes = Vec::with_capacity(records.len() * 2);
        for record in records {
            writes.extend(self.plan(record).await?);
        }
        self.store.commit(&writes).await?;
        debug!(events = records.len(), writes = writes.len(), "batch projected");
        Ok(writes.len())
    }
}
