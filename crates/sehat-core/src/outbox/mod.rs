//! Outbox - ordered, durable queue of unconfirmed record mutations
//!
//! Draining order is strict FIFO by `entry_id` per record; entries whose
//! retry time lies in the future are skipped without blocking the rest
//! of the queue, so ordering is guaranteed per record, never globally.

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::Database;
use crate::error::Result;
use crate::models::{EntryState, Operation, OutboxEntry, RecordId};

/// Durable queue of pending mutations, backed by the shared database.
#[derive(Clone)]
pub struct Outbox {
    db: Database,
}

impl Outbox {
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Enqueue a mutation inside the caller's transaction.
    ///
    /// Collapsing: if an active entry already exists for the record, its
    /// payload snapshot and `base_version` are replaced in place (same
    /// `entry_id`, same queue position) instead of appending a second
    /// entry. A terminal `failed` entry is reactivated with a fresh
    /// attempt count. The record store calls this from the same
    /// transaction that persists the record mutation, so a crash can
    /// never separate a record from its queued submission.
    pub(crate) fn enqueue_tx(
        conn: &Connection,
        local_id: RecordId,
        operation: Operation,
        base_version: i64,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT entry_id, state FROM outbox WHERE local_id = ? ORDER BY entry_id DESC LIMIT 1",
                params![local_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            Some((entry_id, state)) if state != EntryState::Failed.as_str() => {
                // Active entry: collapse the edit into it. The in-flight
                // snapshot an engine worker may already hold is a copy,
                // so this never mutates what is currently on the wire.
                conn.execute(
                    "UPDATE outbox SET payload = ?, base_version = ? WHERE entry_id = ?",
                    params![payload, base_version, entry_id],
                )?;
            }
            Some((entry_id, _)) => {
                conn.execute(
                    "UPDATE outbox
                     SET payload = ?, base_version = ?, operation = ?,
                         attempt_count = 0, next_retry_at = 0, state = 'ready'
                     WHERE entry_id = ?",
                    params![payload, base_version, operation.as_str(), entry_id],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO outbox (local_id, operation, base_version, payload)
                     VALUES (?, ?, ?, ?)",
                    params![local_id.as_str(), operation.as_str(), base_version, payload],
                )?;
            }
        }
        Ok(())
    }

    /// The next batch of sendable entries, lowest `entry_id` first.
    ///
    /// Skips entries whose `next_retry_at` is still in the future and
    /// any record that already has an in-flight send, so no two
    /// concurrent sends ever target the same record.
    pub fn ready_batch(&self, now: i64, limit: usize) -> Result<Vec<OutboxEntry>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT entry_id, local_id, operation, base_version, payload,
                    attempt_count, next_retry_at, state
             FROM outbox
             WHERE state = 'ready'
               AND next_retry_at <= ?
               AND local_id NOT IN (SELECT local_id FROM outbox WHERE state = 'in_flight')
             ORDER BY entry_id
             LIMIT ?",
        )?;

        let entries = stmt
            .query_map(params![now, limit as i64], parse_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    /// Mark an entry as having a send on the wire
    pub fn mark_in_flight(&self, entry_id: i64) -> Result<()> {
        self.db.lock().execute(
            "UPDATE outbox SET state = 'in_flight' WHERE entry_id = ?",
            params![entry_id],
        )?;
        Ok(())
    }

    /// Complete an acknowledged entry.
    ///
    /// The entry is removed only if its `base_version` still matches the
    /// snapshot that was sent. If a local edit collapsed a newer payload
    /// into the row while the send was in flight, the row survives as a
    /// ready `Update` (the record now has a server id) and goes out on a
    /// later pass. Returns whether the entry was fully completed.
    pub fn complete_through(&self, entry_id: i64, sent_base_version: i64) -> Result<bool> {
        let conn = self.db.lock();
        let deleted = conn.execute(
            "DELETE FROM outbox WHERE entry_id = ? AND base_version = ?",
            params![entry_id, sent_base_version],
        )?;
        if deleted > 0 {
            return Ok(true);
        }
        conn.execute(
            "UPDATE outbox
             SET state = 'ready', operation = 'update', attempt_count = 0, next_retry_at = 0
             WHERE entry_id = ?",
            params![entry_id],
        )?;
        Ok(false)
    }

    /// Remove an entry unconditionally (keep-remote / manual conflict)
    pub fn remove(&self, entry_id: i64) -> Result<()> {
        self.db
            .lock()
            .execute("DELETE FROM outbox WHERE entry_id = ?", params![entry_id])?;
        Ok(())
    }

    /// Put a transiently-failed entry back in the queue with a wake-up time
    pub fn reschedule(&self, entry_id: i64, next_retry_at: i64, attempt_count: i64) -> Result<()> {
        self.db.lock().execute(
            "UPDATE outbox
             SET state = 'ready', next_retry_at = ?, attempt_count = ?
             WHERE entry_id = ?",
            params![next_retry_at, attempt_count, entry_id],
        )?;
        Ok(())
    }

    /// Move an entry to the terminal `failed` sub-state.
    ///
    /// The row stays in the outbox for audit and user-initiated retry.
    pub fn mark_failed(&self, entry_id: i64) -> Result<()> {
        self.db.lock().execute(
            "UPDATE outbox SET state = 'failed' WHERE entry_id = ?",
            params![entry_id],
        )?;
        Ok(())
    }

    /// Rebase an entry after conflict resolution decided to resubmit.
    ///
    /// Sets the new base version (the server version just reported),
    /// optionally replaces the payload (merge), and resets the attempt
    /// cycle so backoff starts fresh. Runs in the caller's transaction,
    /// which the record store shares with the record mutation the
    /// rebase belongs to.
    pub(crate) fn rebase_tx(
        conn: &Connection,
        entry_id: i64,
        base_version: i64,
        payload: Option<&serde_json::Value>,
    ) -> Result<()> {
        match payload {
            Some(payload) => conn.execute(
                "UPDATE outbox
                 SET base_version = ?, payload = ?, state = 'ready',
                     attempt_count = 0, next_retry_at = 0
                 WHERE entry_id = ?",
                params![base_version, payload, entry_id],
            )?,
            None => conn.execute(
                "UPDATE outbox
                 SET base_version = ?, state = 'ready', attempt_count = 0, next_retry_at = 0
                 WHERE entry_id = ?",
                params![base_version, entry_id],
            )?,
        };
        Ok(())
    }

    /// Whether an entry still carries the snapshot that was sent.
    ///
    /// False once a local edit collapsed a newer payload into the row
    /// (or the row is gone): any decision made about the sent snapshot
    /// is stale then, and the collapsed snapshot must win.
    pub(crate) fn snapshot_matches_tx(
        conn: &Connection,
        entry_id: i64,
        base_version: i64,
    ) -> Result<bool> {
        let current: Option<i64> = conn
            .query_row(
                "SELECT base_version FROM outbox WHERE entry_id = ?",
                params![entry_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(current == Some(base_version))
    }

    /// Requeue a superseded in-flight entry with its collapsed snapshot
    /// intact; it goes back out against its recorded base version and,
    /// if that base is stale, conflicts again and is re-decided.
    pub(crate) fn requeue_tx(conn: &Connection, entry_id: i64) -> Result<()> {
        conn.execute(
            "UPDATE outbox
             SET state = 'ready', attempt_count = 0, next_retry_at = 0
             WHERE entry_id = ?",
            params![entry_id],
        )?;
        Ok(())
    }

    /// Remove an entry inside the caller's transaction
    pub(crate) fn remove_tx(conn: &Connection, entry_id: i64) -> Result<()> {
        conn.execute("DELETE FROM outbox WHERE entry_id = ?", params![entry_id])?;
        Ok(())
    }

    /// Recover entries whose send never observed a response.
    ///
    /// Called on startup and after a cancelled drain: in-flight rows go
    /// back to ready and are treated as transient failures, relying on
    /// the server treating `local_id` as an idempotency key.
    pub fn requeue_in_flight(&self) -> Result<usize> {
        let requeued = self.db.lock().execute(
            "UPDATE outbox SET state = 'ready' WHERE state = 'in_flight'",
            [],
        )?;
        if requeued > 0 {
            tracing::warn!(requeued, "requeued in-flight outbox entries after interruption");
        }
        Ok(requeued)
    }

    /// The active (ready or in-flight) entry for a record, if any
    pub fn active_entry(&self, local_id: RecordId) -> Result<Option<OutboxEntry>> {
        let conn = self.db.lock();
        let entry = conn
            .query_row(
                "SELECT entry_id, local_id, operation, base_version, payload,
                        attempt_count, next_retry_at, state
                 FROM outbox
                 WHERE local_id = ? AND state != 'failed'",
                params![local_id.as_str()],
                parse_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Earliest `next_retry_at` among ready entries, for scheduling wake-ups
    pub fn next_due_at(&self) -> Result<Option<i64>> {
        let due: Option<i64> = self.db.lock().query_row(
            "SELECT MIN(next_retry_at) FROM outbox WHERE state = 'ready'",
            [],
            |row| row.get(0),
        )?;
        Ok(due)
    }

    /// Number of entries in the outbox, failed ones included
    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .db
            .lock()
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Parse an outbox entry from a database row
fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let local_id: String = row.get(1)?;
    let operation: String = row.get(2)?;
    let state: String = row.get(7)?;
    Ok(OutboxEntry {
        entry_id: row.get(0)?,
        local_id: local_id.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        operation: operation.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(2, "operation".into(), rusqlite::types::Type::Text)
        })?,
        base_version: row.get(3)?,
        payload: row.get(4)?,
        attempt_count: row.get(5)?,
        next_retry_at: row.get(6)?,
        state: state.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(7, "state".into(), rusqlite::types::Type::Text)
        })?,
    })
}
