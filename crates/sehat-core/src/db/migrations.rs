//! Database migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Migration to version 1: records, outbox, and meta tables
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;

        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS records (
            local_id TEXT PRIMARY KEY,
            record_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            version INTEGER NOT NULL,
            sync_state TEXT NOT NULL,
            server_id TEXT,
            server_snapshot TEXT,
            failure_reason TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_records_state ON records(sync_state);
        CREATE INDEX IF NOT EXISTS idx_records_type ON records(record_type);
        CREATE INDEX IF NOT EXISTS idx_records_created ON records(created_at);

        CREATE TABLE IF NOT EXISTS outbox (
            entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
            local_id TEXT NOT NULL REFERENCES records(local_id) ON DELETE CASCADE,
            operation TEXT NOT NULL,
            base_version INTEGER NOT NULL,
            payload TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            next_retry_at INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL DEFAULT 'ready'
        );
        CREATE INDEX IF NOT EXISTS idx_outbox_ready ON outbox(state, next_retry_at);
        -- At most one active (non-failed) entry per record, enforced by
        -- the schema itself so no code path can violate it.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_outbox_active
            ON outbox(local_id) WHERE state != 'failed';

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;",
    )?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations() {
        let conn = setup();
        run(&conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = setup();
        run(&conn).unwrap();
        run(&conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn active_entry_index_rejects_duplicates() {
        let conn = setup();
        run(&conn).unwrap();

        conn.execute(
            "INSERT INTO records (local_id, record_type, payload, version, sync_state, created_at, updated_at)
             VALUES ('r1', 'patient-form', '{}', 1, 'pending', 0, 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO outbox (local_id, operation, base_version, payload) VALUES ('r1', 'create', 1, '{}')",
            [],
        )
        .unwrap();

        let second = conn.execute(
            "INSERT INTO outbox (local_id, operation, base_version, payload) VALUES ('r1', 'update', 2, '{}')",
            [],
        );
        assert!(second.is_err());
    }
}
