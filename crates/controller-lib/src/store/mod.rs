//! Durable resource record store
//!
//! This module provides the outbox storage layer:
//! - One SQLite connection on a dedicated thread (`tokio_rusqlite`), which is
//!   the single writer every producer and pump shares
//! - Explicit transaction sessions ([`Session`]) that nest by joining the outer transaction
//! - A closed set of named queries ([`RecordQuery`])
//! - Engine errors translated to [`StoreError`](crate::error::StoreError)

pub mod migrations;
mod query;
mod session;

pub use query::RecordQuery;
pub use session::{Session, UpsertOutcome};

use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use crate::models::ResourceRecord;
use crate::observability::OutboxMetrics;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

/// Async handle to the record store.
///
/// Clones share the same connection thread; operations run in FIFO order.
#[derive(Clone)]
pub struct ResourceStore {
    conn: Connection,
    clock: Arc<dyn Clock>,
    metrics: OutboxMetrics,
    location: String,
}

impl ResourceStore {
    /// Open (or create) a file-backed store and run pending migrations.
    pub async fn open(
        path: &Path,
        clock: Arc<dyn Clock>,
        metrics: OutboxMetrics,
    ) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let location = path.to_string_lossy().to_string();
        info!(path = %location, "Opening resource store");

        let conn = Connection::open(path).await?;
        conn.call(|conn| {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
            Ok(())
        })
        .await?;

        Self::initialize(conn, clock, metrics, location).await
    }

    /// Open a private in-memory store; contents vanish when the last clone drops.
    pub async fn open_in_memory(clock: Arc<dyn Clock>, metrics: OutboxMetrics) -> StoreResult<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::initialize(conn, clock, metrics, ":memory:".to_string()).await
    }

    async fn initialize(
        conn: Connection,
        clock: Arc<dyn Clock>,
        metrics: OutboxMetrics,
        location: String,
    ) -> StoreResult<Self> {
        let migrated = conn
            .call(|conn| {
                let result = conn
                    .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
                    .map_err(StoreError::from)
                    .and_then(|_| migrations::run_migrations(conn));
                Ok(result)
            })
            .await?;
        migrated?;

        info!(path = %location, "Resource store initialized");
        Ok(Self {
            conn,
            clock,
            metrics,
            location,
        })
    }

    /// Where the store lives (`:memory:` for in-memory stores)
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> &OutboxMetrics {
        &self.metrics
    }

    /// Run `f` with a session on the connection thread.
    ///
    /// Only store work belongs in `f`; anything slow stalls every other caller.
    pub async fn call<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Session<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let clock = Arc::clone(&self.clock);
        let metrics = self.metrics.clone();
        let outer = self
            .conn
            .call(move |conn| {
                let session = Session::new(conn, clock.as_ref(), &metrics);
                Ok(f(&session))
            })
            .await;

        match outer {
            Ok(inner) => inner,
            Err(e) => Err(e.into()),
        }
    }

    /// Run `f` inside one transaction; any `Err` rolls the whole unit back.
    pub async fn tx<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Session<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.call(move |session| session.tx(f)).await
    }

    /// Insert `record`, silently ignoring a conflicting identity.
    pub async fn create(&self, mut record: ResourceRecord) -> StoreResult<ResourceRecord> {
        self.call(move |session| {
            session.create(&mut record)?;
            Ok(record)
        })
        .await
    }

    /// Persist new content for an existing record.
    pub async fn update(&self, mut record: ResourceRecord) -> StoreResult<ResourceRecord> {
        self.call(move |session| {
            session.update(&mut record)?;
            Ok(record)
        })
        .await
    }

    /// Atomic insert-or-refresh keyed on the record's identity.
    pub async fn upsert(
        &self,
        mut record: ResourceRecord,
    ) -> StoreResult<(UpsertOutcome, ResourceRecord)> {
        self.call(move |session| {
            let outcome = session.upsert(&mut record)?;
            Ok((outcome, record))
        })
        .await
    }

    pub async fn get(&self, id: &str) -> StoreResult<ResourceRecord> {
        let id = id.to_string();
        self.call(move |session| session.get(&id)).await
    }

    /// Delete by id; returns how many rows went away (0 if absent).
    pub async fn delete(&self, id: &str) -> StoreResult<usize> {
        let id = id.to_string();
        self.call(move |session| session.delete(&id)).await
    }

    pub async fn find_first_by(&self, query: RecordQuery) -> StoreResult<ResourceRecord> {
        self.call(move |session| session.find_first_by(&query)).await
    }

    pub async fn find_all_by(&self, query: RecordQuery) -> StoreResult<Vec<ResourceRecord>> {
        self.call(move |session| session.find_all_by(&query)).await
    }

    pub async fn count(&self) -> StoreResult<usize> {
        self.call(|session| session.count()).await
    }

    pub async fn count_by(&self, query: RecordQuery) -> StoreResult<usize> {
        self.call(move |session| session.count_by(&query)).await
    }

    pub async fn delete_all(&self) -> StoreResult<usize> {
        self.call(|session| session.delete_all()).await
    }

    /// Acknowledge delivery of `ids` in one transaction.
    pub async fn mark_sent(&self, ids: Vec<String>, at: DateTime<Utc>) -> StoreResult<usize> {
        let marked = self
            .call(move |session| session.mark_sent(&ids, at))
            .await?;
        debug!(marked, "Marked records as sent");
        Ok(marked)
    }

    /// Check the connection thread answers.
    pub async fn health_check(&self) -> StoreResult<()> {
        self.call(|session| session.count().map(|_| ())).await
    }

    /// Close the connection, waiting for queued operations to finish.
    pub async fn close(self) -> StoreResult<()> {
        self.conn.close().await?;
        info!(path = %self.location, "Resource store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::models::{label_map, ResourceKind};
    use chrono::{Duration, TimeZone};
    use prometheus::Registry;
    use tempfile::tempdir;

    fn clock() -> MockClock {
        MockClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    async fn memory_store(clock: &MockClock) -> ResourceStore {
        let metrics = OutboxMetrics::new(&Registry::new()).unwrap();
        ResourceStore::open_in_memory(Arc::new(clock.clone()), metrics)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("outbox.db");
        let clock = clock();

        let store = ResourceStore::open(
            &path,
            Arc::new(clock.clone()),
            OutboxMetrics::new(&Registry::new()).unwrap(),
        )
        .await
        .unwrap();
        let record = store
            .create(ResourceRecord::new(ResourceKind::Namespace, "prod", None))
            .await
            .unwrap();
        store.close().await.unwrap();

        let reopened = ResourceStore::open(
            &path,
            Arc::new(clock.clone()),
            OutboxMetrics::new(&Registry::new()).unwrap(),
        )
        .await
        .unwrap();
        let stored = reopened.get(&record.id).await.unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_async_tx_rolls_back_on_error() {
        let clock = clock();
        let store = memory_store(&clock).await;

        let result: StoreResult<()> = store
            .tx(|session| {
                let mut record = ResourceRecord::new(ResourceKind::Pod, "a", Some("ns".into()));
                session.create(&mut record)?;
                Err(StoreError::DuplicateKey)
            })
            .await;

        assert!(matches!(result, Err(StoreError::DuplicateKey)));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_sent_leaves_later_mutation_pending() {
        let clock = clock();
        let store = memory_store(&clock).await;

        let (_, record) = store
            .upsert(
                ResourceRecord::new(ResourceKind::Pod, "web-0", Some("default".into()))
                    .with_labels(label_map([("app", "web")])),
            )
            .await
            .unwrap();
        let selected_at = clock.now();

        // a producer touches the record between selection and acknowledgement
        clock.advance(Duration::seconds(1));
        store
            .upsert(
                ResourceRecord::new(ResourceKind::Pod, "web-0", Some("default".into()))
                    .with_labels(label_map([("app", "web")])),
            )
            .await
            .unwrap();

        store
            .mark_sent(vec![record.id.clone()], selected_at)
            .await
            .unwrap();

        let pending = store.find_all_by(RecordQuery::PendingDelivery).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sent_at, Some(selected_at));
    }

    #[tokio::test]
    async fn test_concurrent_upserts_for_new_identity_keep_one_row() {
        let clock = clock();
        let store = memory_store(&clock).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upsert(ResourceRecord::new(ResourceKind::Deployment, "api", Some("prod".into())))
                    .await
            }));
        }

        let mut inserted = 0;
        let mut ids = Vec::new();
        for handle in handles {
            let (outcome, record) = handle.await.unwrap().unwrap();
            if outcome == UpsertOutcome::Inserted {
                inserted += 1;
            }
            ids.push(record.id);
        }

        assert_eq!(inserted, 1);
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_all_and_health() {
        let clock = clock();
        let store = memory_store(&clock).await;
        store.health_check().await.unwrap();

        for name in ["a", "b", "c"] {
            store
                .create(ResourceRecord::new(ResourceKind::Job, name, Some("ops".into())))
                .await
                .unwrap();
        }
        assert_eq!(store.count_by(RecordQuery::PendingDelivery).await.unwrap(), 3);
        assert_eq!(store.delete_all().await.unwrap(), 3);
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
