//! Synchronous store operations on a borrowed connection
//!
//! A [`Session`] is what runs on the connection thread. It is also the
//! explicit transaction handle: everything called on the session passed into
//! [`Session::tx`] joins that transaction, and nested `tx` calls reuse it.

use super::query::RecordQuery;
use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use crate::models::{LabelMap, ResourceKind, ResourceRecord};
use crate::observability::OutboxMetrics;
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

const RECORD_COLUMNS: &str = "id, kind, name, namespace, metric_labels, labels, annotations, \
     record_created, record_updated, sent_at, size";

/// Whether an upsert created a new identity or refreshed an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Store operations bound to one connection
pub struct Session<'c> {
    conn: &'c Connection,
    clock: &'c dyn Clock,
    metrics: &'c OutboxMetrics,
}

impl<'c> Session<'c> {
    pub fn new(conn: &'c Connection, clock: &'c dyn Clock, metrics: &'c OutboxMetrics) -> Self {
        Self {
            conn,
            clock,
            metrics,
        }
    }

    /// Current time at storage precision
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(6)
    }

    /// Whether a transaction is open on this connection
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Run `f` atomically.
    ///
    /// Commits when `f` returns `Ok`, rolls back on `Err`. If a transaction is
    /// already open, `f` runs inside it and the outer scope decides the outcome.
    pub fn tx<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Session<'_>) -> StoreResult<T>,
    {
        if self.in_transaction() {
            return f(self);
        }

        let tx = self.conn.unchecked_transaction()?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }

    /// Insert a new record, assigning its id and timestamps.
    ///
    /// A conflicting identity is dropped silently; the record then carries an
    /// id that was never persisted.
    pub fn create(&self, record: &mut ResourceRecord) -> StoreResult<()> {
        let result = self.insert_ignoring_conflict(record);
        self.observe_write(record, "create", result)
    }

    fn insert_ignoring_conflict(&self, record: &mut ResourceRecord) -> StoreResult<()> {
        let now = self.now();
        record.id = uuid::Uuid::new_v4().to_string();
        record.record_created = now;
        record.record_updated = now;

        let encoded = EncodedMaps::of(record)?;
        let size: Option<i64> = self
            .conn
            .query_row(
                "INSERT INTO resource_records
                    (id, kind, name, namespace, namespace_key, metric_labels, labels, annotations,
                     record_created, record_updated, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(kind, name, namespace_key) DO NOTHING
                 RETURNING size",
                params![
                    record.id,
                    record.kind.code(),
                    record.name,
                    record.namespace,
                    record.namespace_key(),
                    encoded.metric_labels,
                    encoded.labels,
                    encoded.annotations,
                    now.timestamp_micros(),
                    now.timestamp_micros(),
                    record.sent_at.map(|t| t.timestamp_micros()),
                ],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(size) = size {
            record.size = size as usize;
        }
        Ok(())
    }

    /// Persist mutable content of an existing record and bump `record_updated`.
    ///
    /// Identity fields and `record_created` are left untouched. `record_updated`
    /// never drops below `record_created`, even if the clock stepped back.
    pub fn update(&self, record: &mut ResourceRecord) -> StoreResult<()> {
        let result = self.update_content(record);
        self.observe_write(record, "update", result)
    }

    fn update_content(&self, record: &mut ResourceRecord) -> StoreResult<()> {
        if record.id.is_empty() {
            return Err(StoreError::MissingKey);
        }

        let now = self.now();
        let encoded = EncodedMaps::of(record)?;
        let (created, updated, size): (i64, i64, i64) = self.conn.query_row(
            "UPDATE resource_records
             SET metric_labels = ?1, labels = ?2, annotations = ?3, sent_at = ?4,
                 record_updated = MAX(?5, record_created)
             WHERE id = ?6
             RETURNING record_created, record_updated, size",
            params![
                encoded.metric_labels,
                encoded.labels,
                encoded.annotations,
                record.sent_at.map(|t| t.timestamp_micros()),
                now.timestamp_micros(),
                record.id,
            ],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        record.record_created = from_micros(created, 0)?;
        record.record_updated = from_micros(updated, 1)?;
        record.size = size as usize;
        Ok(())
    }

    /// Insert a new identity or replace the content of the existing one.
    ///
    /// Either way the record ends up pending delivery with `record_updated = now`,
    /// clamped to `record_created`. An existing row keeps its id and `record_created`.
    pub fn upsert(&self, record: &mut ResourceRecord) -> StoreResult<UpsertOutcome> {
        let result = self.upsert_content(record);
        self.observe_write(record, "upsert", result)
    }

    fn upsert_content(&self, record: &mut ResourceRecord) -> StoreResult<UpsertOutcome> {
        let now = self.now();
        let candidate_id = uuid::Uuid::new_v4().to_string();
        let encoded = EncodedMaps::of(record)?;

        let (id, created, updated, size): (String, i64, i64, i64) = self.conn.query_row(
            "INSERT INTO resource_records
                (id, kind, name, namespace, namespace_key, metric_labels, labels, annotations,
                 record_created, record_updated, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, NULL)
             ON CONFLICT(kind, name, namespace_key) DO UPDATE SET
                metric_labels = excluded.metric_labels,
                labels = excluded.labels,
                annotations = excluded.annotations,
                record_updated = MAX(excluded.record_updated, resource_records.record_created),
                sent_at = NULL
             RETURNING id, record_created, record_updated, size",
            params![
                candidate_id,
                record.kind.code(),
                record.name,
                record.namespace,
                record.namespace_key(),
                encoded.metric_labels,
                encoded.labels,
                encoded.annotations,
                now.timestamp_micros(),
            ],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let outcome = if id == candidate_id {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        };

        record.id = id;
        record.record_created = from_micros(created, 1)?;
        record.record_updated = from_micros(updated, 2)?;
        record.sent_at = None;
        record.size = size as usize;
        Ok(outcome)
    }

    /// Point lookup by id
    pub fn get(&self, id: &str) -> StoreResult<ResourceRecord> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM resource_records WHERE id = ?1");
        Ok(self.conn.query_row(&sql, [id], record_from_row)?)
    }

    /// Delete by id; absent ids are not an error
    pub fn delete(&self, id: &str) -> StoreResult<usize> {
        let result = self
            .conn
            .execute("DELETE FROM resource_records WHERE id = ?1", [id])
            .map_err(StoreError::from);
        if let Err(e) = &result {
            let (kind, namespace) = self.identity_of(id);
            warn!(
                record_id = %id,
                resource_type = %kind,
                namespace = %namespace,
                error_kind = e.kind(),
                error = %e,
                "Failed to delete record"
            );
            self.metrics
                .inc_storage_write_failure(kind.metric_name(), &namespace, "delete");
        }
        result
    }

    /// Kind and namespace key of `id` for failure labels; `Unknown` if unreadable
    fn identity_of(&self, id: &str) -> (ResourceKind, String) {
        self.conn
            .query_row(
                "SELECT kind, namespace_key FROM resource_records WHERE id = ?1",
                [id],
                |row| Ok((ResourceKind::from_code(row.get(0)?), row.get(1)?)),
            )
            .unwrap_or((ResourceKind::Unknown, String::new()))
    }

    /// Run raw SQL on this connection, outside the typed operations.
    ///
    /// For maintenance statements such as triggers or pragmas.
    pub fn execute_batch(&self, sql: &str) -> StoreResult<()> {
        Ok(self.conn.execute_batch(sql)?)
    }

    /// First record matching `query` in insertion order
    pub fn find_first_by(&self, query: &RecordQuery) -> StoreResult<ResourceRecord> {
        let (predicate, values) = query.predicate();
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM resource_records WHERE {predicate} ORDER BY rowid LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(&sql, params_from_iter(values), record_from_row)?)
    }

    /// All records matching `query` in insertion order
    pub fn find_all_by(&self, query: &RecordQuery) -> StoreResult<Vec<ResourceRecord>> {
        let (predicate, values) = query.predicate();
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM resource_records WHERE {predicate} ORDER BY rowid"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(values), record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        debug!(query = query.name(), records = records.len(), "Selected records");
        Ok(records)
    }

    /// Number of records matching `query`
    pub fn count_by(&self, query: &RecordQuery) -> StoreResult<usize> {
        let (predicate, values) = query.predicate();
        let sql = format!("SELECT COUNT(*) FROM resource_records WHERE {predicate}");
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn count(&self) -> StoreResult<usize> {
        self.count_by(&RecordQuery::All)
    }

    pub fn delete_all(&self) -> StoreResult<usize> {
        Ok(self.conn.execute("DELETE FROM resource_records", [])?)
    }

    /// Acknowledge delivery of `ids` at `at`.
    ///
    /// Only `sent_at` changes: a record mutated after it was selected keeps a
    /// newer `record_updated` and stays pending.
    pub fn mark_sent(&self, ids: &[String], at: DateTime<Utc>) -> StoreResult<usize> {
        let at = at.trunc_subsecs(6).timestamp_micros();
        self.tx(|session| {
            let mut stmt = session
                .conn
                .prepare_cached("UPDATE resource_records SET sent_at = ?1 WHERE id = ?2")?;
            let mut marked = 0;
            for id in ids {
                marked += stmt.execute(params![at, id])?;
            }
            Ok(marked)
        })
    }

    fn observe_write<T>(
        &self,
        record: &ResourceRecord,
        action: &'static str,
        result: StoreResult<T>,
    ) -> StoreResult<T> {
        if let Err(e) = &result {
            warn!(
                resource_type = %record.kind,
                name = %record.name,
                namespace = record.namespace_key(),
                action,
                error_kind = e.kind(),
                error = %e,
                "Failed to write resource record"
            );
            self.metrics
                .inc_storage_write_failure(record.kind.metric_name(), record.namespace_key(), action);
        }
        result
    }
}

struct EncodedMaps {
    metric_labels: String,
    labels: Option<String>,
    annotations: Option<String>,
}

impl EncodedMaps {
    fn of(record: &ResourceRecord) -> StoreResult<Self> {
        Ok(Self {
            metric_labels: serde_json::to_string(&record.metric_labels)?,
            labels: record.labels.as_ref().map(serde_json::to_string).transpose()?,
            annotations: record
                .annotations
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        })
    }
}

fn from_micros(micros: i64, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, micros))
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<LabelMap>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|text| {
        serde_json::from_str(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ResourceRecord> {
    let sent_at: Option<i64> = row.get(9)?;
    let size: i64 = row.get(10)?;
    Ok(ResourceRecord {
        id: row.get(0)?,
        kind: ResourceKind::from_code(row.get(1)?),
        name: row.get(2)?,
        namespace: row.get(3)?,
        metric_labels: json_column(row, 4)?.unwrap_or_default(),
        labels: json_column(row, 5)?,
        annotations: json_column(row, 6)?,
        record_created: from_micros(row.get(7)?, 7)?,
        record_updated: from_micros(row.get(8)?, 8)?,
        sent_at: sent_at.map(|micros| from_micros(micros, 9)).transpose()?,
        size: size.max(0) as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::models::label_map;
    use crate::store::migrations::run_migrations;
    use chrono::{Duration, TimeZone};
    use prometheus::Registry;

    struct Fixture {
        conn: Connection,
        clock: MockClock,
        metrics: OutboxMetrics,
    }

    impl Fixture {
        fn new() -> Self {
            let conn = Connection::open_in_memory().unwrap();
            run_migrations(&conn).unwrap();
            Self {
                conn,
                clock: MockClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
                metrics: OutboxMetrics::new(&Registry::new()).unwrap(),
            }
        }

        fn session(&self) -> Session<'_> {
            Session::new(&self.conn, &self.clock, &self.metrics)
        }
    }

    fn pod(name: &str) -> ResourceRecord {
        ResourceRecord::new(ResourceKind::Pod, name, Some("default".to_string()))
            .with_labels(label_map([("app", "web")]))
    }

    #[test]
    fn test_create_assigns_id_and_timestamps() {
        let fx = Fixture::new();
        let session = fx.session();
        let mut record = pod("web-0");

        session.create(&mut record).unwrap();

        assert!(!record.id.is_empty());
        assert_eq!(record.record_created, fx.clock.now());
        assert_eq!(record.record_updated, fx.clock.now());

        let stored = session.get(&record.id).unwrap();
        assert_eq!(stored, record);
        assert_eq!(stored.size, "web-0".len() + "default".len() + r#"{"app":"web"}"#.len());
    }

    #[test]
    fn test_create_drops_duplicate_identity() {
        let fx = Fixture::new();
        let session = fx.session();

        let mut first = pod("web-0");
        session.create(&mut first).unwrap();
        let mut second = pod("web-0").with_labels(label_map([("app", "other")]));
        session.create(&mut second).unwrap();

        assert_eq!(session.count().unwrap(), 1);
        assert!(matches!(session.get(&second.id), Err(StoreError::NotFound)));
        assert_eq!(session.get(&first.id).unwrap().labels, first.labels);
    }

    #[test]
    fn test_cluster_scoped_identity_collides() {
        let fx = Fixture::new();
        let session = fx.session();

        let mut a = ResourceRecord::new(ResourceKind::Node, "node-a", None);
        let mut b = ResourceRecord::new(ResourceKind::Node, "node-a", None);
        session.create(&mut a).unwrap();
        session.create(&mut b).unwrap();

        assert_eq!(session.count().unwrap(), 1);
    }

    #[test]
    fn test_update_requires_id() {
        let fx = Fixture::new();
        let session = fx.session();
        let mut record = pod("web-0");

        assert!(matches!(session.update(&mut record), Err(StoreError::MissingKey)));
        assert_eq!(
            fx.metrics.storage_write_failures("pod", "default", "update"),
            1
        );
    }

    #[test]
    fn test_update_preserves_created_and_resets_sent_at() {
        let fx = Fixture::new();
        let session = fx.session();
        let mut record = pod("web-0");
        session.create(&mut record).unwrap();
        let created = record.record_created;

        fx.clock.advance(Duration::seconds(5));
        session.mark_sent(&[record.id.clone()], fx.clock.now()).unwrap();

        fx.clock.advance(Duration::seconds(5));
        let mut changed = session.get(&record.id).unwrap();
        changed.labels = Some(label_map([("app", "api")]));
        changed.sent_at = None;
        changed.record_created = fx.clock.now();
        session.update(&mut changed).unwrap();

        let stored = session.get(&record.id).unwrap();
        assert_eq!(stored.record_created, created);
        assert_eq!(stored.record_updated, fx.clock.now());
        assert_eq!(stored.sent_at, None);
        assert_eq!(stored.labels, Some(label_map([("app", "api")])));
        assert_eq!(changed.record_created, created);
    }

    #[test]
    fn test_update_unknown_id_is_not_found() {
        let fx = Fixture::new();
        let session = fx.session();
        let mut record = pod("web-0");
        record.id = "missing".to_string();

        assert!(matches!(session.update(&mut record), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_upsert_reports_outcome() {
        let fx = Fixture::new();
        let session = fx.session();

        let mut first = pod("web-0");
        assert_eq!(session.upsert(&mut first).unwrap(), UpsertOutcome::Inserted);
        session.mark_sent(&[first.id.clone()], fx.clock.now()).unwrap();

        fx.clock.advance(Duration::seconds(30));
        let mut again = pod("web-0").with_labels(label_map([("app", "api")]));
        assert_eq!(session.upsert(&mut again).unwrap(), UpsertOutcome::Updated);

        assert_eq!(again.id, first.id);
        assert_eq!(again.record_created, first.record_created);
        assert_eq!(again.record_updated, fx.clock.now());

        let stored = session.get(&first.id).unwrap();
        assert_eq!(stored.sent_at, None);
        assert!(stored.is_pending());
        assert_eq!(session.count().unwrap(), 1);
    }

    #[test]
    fn test_upsert_survives_clock_step_back() {
        let fx = Fixture::new();
        let session = fx.session();

        let mut first = pod("web-0");
        session.upsert(&mut first).unwrap();
        session.mark_sent(&[first.id.clone()], fx.clock.now()).unwrap();

        fx.clock.advance(Duration::seconds(-2));
        let mut again = pod("web-0").with_labels(label_map([("app", "v2")]));
        assert_eq!(session.upsert(&mut again).unwrap(), UpsertOutcome::Updated);

        assert_eq!(again.record_updated, first.record_created);
        let stored = session.get(&first.id).unwrap();
        assert_eq!(stored.labels, Some(label_map([("app", "v2")])));
        assert_eq!(stored.record_updated, first.record_created);
        assert!(stored.is_pending());
        assert_eq!(
            fx.metrics.storage_write_failures("pod", "default", "upsert"),
            0
        );
    }

    #[test]
    fn test_update_survives_clock_step_back() {
        let fx = Fixture::new();
        let session = fx.session();
        let mut record = pod("web-0");
        session.create(&mut record).unwrap();

        fx.clock.advance(Duration::milliseconds(-500));
        record.labels = Some(label_map([("app", "api")]));
        session.update(&mut record).unwrap();

        assert_eq!(record.record_updated, record.record_created);
        assert_eq!(session.get(&record.id).unwrap(), record);
    }

    #[test]
    fn test_delete_failure_is_labelled_with_identity() {
        let fx = Fixture::new();
        let session = fx.session();
        let mut record = pod("web-0");
        session.create(&mut record).unwrap();

        session
            .execute_batch(
                "CREATE TRIGGER refuse_delete BEFORE DELETE ON resource_records
                 BEGIN SELECT RAISE(ABORT, 'delete refused'); END;",
            )
            .unwrap();

        assert!(session.delete(&record.id).is_err());
        assert_eq!(
            fx.metrics.storage_write_failures("pod", "default", "delete"),
            1
        );
        assert!(session.get(&record.id).is_ok());
    }

    #[test]
    fn test_pending_selection_quadrants() {
        let fx = Fixture::new();
        let session = fx.session();

        // never sent
        let mut unsent = pod("unsent");
        session.create(&mut unsent).unwrap();

        // sent after the last update
        let mut delivered = pod("delivered");
        session.create(&mut delivered).unwrap();

        // sent, then updated again
        let mut touched = pod("touched");
        session.create(&mut touched).unwrap();

        fx.clock.advance(Duration::seconds(10));
        session
            .mark_sent(&[delivered.id.clone(), touched.id.clone()], fx.clock.now())
            .unwrap();

        // sent_at carried on update, then updated later
        fx.clock.advance(Duration::seconds(10));
        let mut stale = session.get(&touched.id).unwrap();
        session.update(&mut stale).unwrap();

        // a record whose sent_at is ahead of its update stays delivered
        let mut ahead = pod("ahead");
        ahead.sent_at = Some(fx.clock.now() + Duration::seconds(60));
        session.create(&mut ahead).unwrap();

        let pending: Vec<String> = session
            .find_all_by(&RecordQuery::PendingDelivery)
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(pending, vec!["unsent".to_string(), "touched".to_string()]);
    }

    #[test]
    fn test_nested_tx_rolls_back_as_a_unit() {
        let fx = Fixture::new();
        let session = fx.session();

        let result: StoreResult<()> = session.tx(|outer| {
            let mut a = pod("a");
            outer.create(&mut a)?;
            outer.tx(|inner| {
                assert!(inner.in_transaction());
                let mut b = pod("b");
                inner.create(&mut b)
            })?;
            Err(StoreError::InvalidValue("abort".to_string()))
        });

        assert!(result.is_err());
        assert!(!session.in_transaction());
        assert_eq!(session.count().unwrap(), 0);
    }

    #[test]
    fn test_tx_commits_on_ok() {
        let fx = Fixture::new();
        let session = fx.session();

        let created = session
            .tx(|tx| {
                let mut a = pod("a");
                tx.create(&mut a)?;
                let mut b = pod("b");
                tx.create(&mut b)?;
                Ok(2)
            })
            .unwrap();

        assert_eq!(created, 2);
        assert_eq!(session.count().unwrap(), 2);
    }

    #[test]
    fn test_identity_and_delete() {
        let fx = Fixture::new();
        let session = fx.session();
        let mut record = pod("web-0");
        session.create(&mut record).unwrap();

        let found = session
            .find_first_by(&RecordQuery::identity(ResourceKind::Pod, "web-0", Some("default")))
            .unwrap();
        assert_eq!(found.id, record.id);
        assert!(matches!(
            session.find_first_by(&RecordQuery::identity(ResourceKind::Pod, "web-0", None)),
            Err(StoreError::NotFound)
        ));

        assert_eq!(session.delete(&record.id).unwrap(), 1);
        assert_eq!(session.delete(&record.id).unwrap(), 0);
        assert!(matches!(session.get(&record.id), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_corrupt_json_is_invalid_data() {
        let fx = Fixture::new();
        let session = fx.session();
        let mut record = pod("web-0");
        session.create(&mut record).unwrap();

        fx.conn
            .execute(
                "UPDATE resource_records SET labels = 'not json' WHERE id = ?1",
                [&record.id],
            )
            .unwrap();

        assert!(matches!(session.get(&record.id), Err(StoreError::InvalidData(_))));
    }
}
