//! Schema migrations, tracked in the `migrations` table.

use crate::error::StoreResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_resource_records(conn)?;
    }

    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: the resource outbox table.
///
/// `namespace_key` mirrors `namespace` with NULL folded to '' so that
/// cluster-scoped identities collide on the unique index too. `size` is the
/// byte length of the serialized identity and metadata.
fn migrate_v1_resource_records(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        BEGIN;

        CREATE TABLE resource_records (
            id TEXT PRIMARY KEY NOT NULL,
            kind INTEGER NOT NULL,
            name TEXT NOT NULL,
            namespace TEXT,
            namespace_key TEXT NOT NULL,
            metric_labels TEXT NOT NULL,
            labels TEXT,
            annotations TEXT,
            record_created INTEGER NOT NULL,
            record_updated INTEGER NOT NULL,
            sent_at INTEGER,
            size INTEGER GENERATED ALWAYS AS (
                length(CAST(name AS BLOB))
                + IFNULL(length(CAST(namespace AS BLOB)), 0)
                + IFNULL(length(CAST(labels AS BLOB)), 0)
                + IFNULL(length(CAST(annotations AS BLOB)), 0)
            ) VIRTUAL,
            CHECK (record_created <= record_updated)
        );

        CREATE UNIQUE INDEX idx_resource_records_identity
            ON resource_records(kind, name, namespace_key);
        CREATE INDEX idx_resource_records_sent_at ON resource_records(sent_at);
        CREATE INDEX idx_resource_records_updated ON resource_records(record_updated);

        COMMIT;
        ",
    )?;

    record_migration(conn, 1, "resource_records")?;
    Ok(())
}
