//! Producer write path
//!
//! Admission handlers and scrapers report every observed mutation of a cluster
//! resource here. Each observation either creates the identity or replaces its
//! content; both leave the record pending delivery.

use crate::error::StoreResult;
use crate::models::ResourceRecord;
use crate::store::{ResourceStore, UpsertOutcome};
use tracing::debug;

/// Result of recording one observation
#[derive(Debug, Clone)]
pub struct Observation {
    pub outcome: UpsertOutcome,
    /// The stored record: persisted id, timestamps and size filled in
    pub record: ResourceRecord,
}

/// Writes observed resource state into the outbox
#[derive(Clone)]
pub struct OutboxWriter {
    store: ResourceStore,
}

impl OutboxWriter {
    pub fn new(store: ResourceStore) -> Self {
        Self { store }
    }

    /// Record one mutation event.
    ///
    /// Every touch invalidates delivery status; no content diffing is done.
    pub async fn observe(&self, record: ResourceRecord) -> StoreResult<Observation> {
        let (outcome, record) = self.store.upsert(record).await?;
        debug!(
            record_id = %record.id,
            resource_type = %record.kind,
            name = %record.name,
            namespace = record.namespace_key(),
            outcome = ?outcome,
            "Observed resource"
        );
        Ok(Observation { outcome, record })
    }

    /// Record several observations atomically (e.g. a full listing backfill).
    pub async fn observe_all(&self, records: Vec<ResourceRecord>) -> StoreResult<Vec<Observation>> {
        let observations = self
            .store
            .tx(move |session| {
                records
                    .into_iter()
                    .map(|mut record| {
                        let outcome = session.upsert(&mut record)?;
                        Ok(Observation { outcome, record })
                    })
                    .collect::<StoreResult<Vec<_>>>()
            })
            .await?;
        debug!(records = observations.len(), "Observed resource batch");
        Ok(observations)
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }
}
