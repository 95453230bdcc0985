//! Database connection management

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;

use crate::error::Result;

use super::migrations;

/// Shared handle to the local `SQLite` database.
///
/// The record store and the outbox both go through this single
/// connection, which makes it the one choke point for every durability
/// and ordering invariant. Store operations are synchronous: a call
/// returns only after `SQLite` has committed, so a crash immediately
/// after user submission cannot lose the record.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        configure(&conn)?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the underlying connection for a batch of statements.
    ///
    /// Never hold the guard across an `.await`.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Configure `SQLite` for durable concurrent use
fn configure(conn: &Connection) -> Result<()> {
    // WAL keeps readers and the sync worker from blocking one another;
    // in-memory databases reject it, so tolerate failure there.
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_in_memory_migrates() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .lock()
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn open_creates_parent_directories() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("sehat.db");
        let db = Database::open(&path).unwrap();
        drop(db);
        assert!(path.exists());
    }

    #[test]
    fn reopen_preserves_schema() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sehat.db");
        {
            let db = Database::open(&path).unwrap();
            db.lock()
                .execute("INSERT INTO meta (key, value) VALUES ('marker', '1')", [])
                .unwrap();
        }
        let db = Database::open(&path).unwrap();
        let value: String = db
            .lock()
            .query_row("SELECT value FROM meta WHERE key = 'marker'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(value, "1");
    }
}
