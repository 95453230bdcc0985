//! Record Store - durable local storage of domain records
//!
//! The UI collaborator creates and edits records here; the sync engine
//! owns `sync_state`, `server_id`, and the outbox. All store calls are
//! synchronous and complete once `SQLite` commits - they never touch
//! the network, so capture works identically online and offline.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{broadcast, Notify};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{Operation, Record, RecordId, RecordType, SyncState};
use crate::outbox::Outbox;
use crate::util::now_ms;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Change notification delivered to UI subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A record was created
    Created {
        local_id: RecordId,
        record_type: RecordType,
    },
    /// A record's payload was edited locally
    Updated { local_id: RecordId, version: i64 },
    /// A record moved to a new sync state
    StateChanged {
        local_id: RecordId,
        sync_state: SyncState,
    },
}

/// Counts surfaced on the home screen badges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStatus {
    pub drafts: usize,
    pub pending: usize,
    pub syncing: usize,
    pub synced: usize,
    pub conflicted: usize,
    pub failed: usize,
    /// Unix ms of the last successful acknowledgment, if any
    pub last_synced_at: Option<i64>,
}

impl SyncStatus {
    /// Records still awaiting server confirmation ("Pending Sync: N")
    #[must_use]
    pub const fn pending_sync(&self) -> usize {
        self.pending + self.syncing
    }
}

/// Durable store of locally-authored records.
#[derive(Clone)]
pub struct RecordStore {
    db: Database,
    events: broadcast::Sender<StoreEvent>,
    work: Arc<Notify>,
}

impl RecordStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            events,
            work: Arc::new(Notify::new()),
        }
    }

    /// Subscribe to record change notifications for badge rendering
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Signal the sync engine listens on for newly-enqueued work
    #[must_use]
    pub(crate) fn work_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.work)
    }

    /// Create and submit a record in one step.
    ///
    /// The record lands in `Pending` and its outbox entry is enqueued in
    /// the same transaction, so a crash between the two is impossible.
    pub fn create(&self, record_type: RecordType, payload: serde_json::Value) -> Result<Record> {
        validate_payload(&payload)?;
        let record = Record::new(record_type, payload, SyncState::Pending);

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        insert_record(&tx, &record)?;
        Outbox::enqueue_tx(
            &tx,
            record.local_id,
            Operation::Create,
            record.version,
            &record.payload,
        )?;
        tx.commit()?;
        drop(conn);

        self.work.notify_one();
        let _ = self.events.send(StoreEvent::Created {
            local_id: record.local_id,
            record_type,
        });
        tracing::debug!(local_id = %record.local_id, %record_type, "record created (pending)");
        Ok(record)
    }

    /// Create a record in `Draft`: editable, not yet queued for sync
    pub fn create_draft(
        &self,
        record_type: RecordType,
        payload: serde_json::Value,
    ) -> Result<Record> {
        validate_payload(&payload)?;
        let record = Record::new(record_type, payload, SyncState::Draft);

        let conn = self.db.lock();
        insert_record(&conn, &record)?;
        drop(conn);

        let _ = self.events.send(StoreEvent::Created {
            local_id: record.local_id,
            record_type,
        });
        tracing::debug!(local_id = %record.local_id, %record_type, "record created (draft)");
        Ok(record)
    }

    /// Submit a draft: `Draft -> Pending` plus an outbox entry
    pub fn submit(&self, local_id: RecordId) -> Result<Record> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let mut record = get_record(&tx, local_id)?;
        if record.sync_state != SyncState::Draft {
            return Err(Error::InvalidState(format!(
                "record {local_id} is {}, only drafts can be submitted",
                record.sync_state
            )));
        }
        record.sync_state = SyncState::Pending;
        set_state(&tx, local_id, SyncState::Pending)?;
        Outbox::enqueue_tx(
            &tx,
            local_id,
            Operation::Create,
            record.version,
            &record.payload,
        )?;
        tx.commit()?;
        drop(conn);

        self.work.notify_one();
        self.emit_state(local_id, SyncState::Pending);
        Ok(record)
    }

    /// Apply a local edit, bumping the record's version.
    ///
    /// Editing is always allowed, even while a sync for this record is
    /// in flight: the engine sends an immutable snapshot captured at
    /// enqueue time, and the edit collapses into the record's single
    /// active outbox entry (or creates one for synced/failed records).
    /// Returns the new version.
    pub fn update(&self, local_id: RecordId, payload: serde_json::Value) -> Result<i64> {
        validate_payload(&payload)?;

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let record = get_record(&tx, local_id)?;
        let new_version = record.version + 1;
        let now = now_ms();

        tx.execute(
            "UPDATE records
             SET payload = ?, version = ?, updated_at = ?,
                 server_snapshot = NULL, failure_reason = NULL
             WHERE local_id = ?",
            params![payload, new_version, now, local_id.as_str()],
        )?;

        // Drafts stay out of the outbox until submitted; everything else
        // re-enters (or stays in) the pending pipeline.
        let state_change = match record.sync_state {
            SyncState::Draft => None,
            SyncState::Pending | SyncState::Syncing => {
                Self::enqueue_edit(&tx, &record, new_version, &payload)?;
                None
            }
            SyncState::Synced | SyncState::Conflicted | SyncState::Failed => {
                Self::enqueue_edit(&tx, &record, new_version, &payload)?;
                set_state(&tx, local_id, SyncState::Pending)?;
                Some(SyncState::Pending)
            }
        };
        tx.commit()?;
        drop(conn);

        self.work.notify_one();
        let _ = self.events.send(StoreEvent::Updated {
            local_id,
            version: new_version,
        });
        if let Some(state) = state_change {
            self.emit_state(local_id, state);
        }
        Ok(new_version)
    }

    fn enqueue_edit(
        conn: &Connection,
        record: &Record,
        new_version: i64,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let operation = if record.server_id.is_some() {
            Operation::Update
        } else {
            Operation::Create
        };
        Outbox::enqueue_tx(conn, record.local_id, operation, new_version, payload)
    }

    /// Fetch a record by its local id
    pub fn get(&self, local_id: RecordId) -> Result<Record> {
        let conn = self.db.lock();
        get_record(&conn, local_id)
    }

    /// List records in insertion order, optionally filtered
    pub fn list(
        &self,
        state: Option<SyncState>,
        record_type: Option<RecordType>,
    ) -> Result<Vec<Record>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT local_id, record_type, payload, version, sync_state,
                    server_id, server_snapshot, failure_reason, created_at, updated_at
             FROM records
             WHERE (?1 IS NULL OR sync_state = ?1)
               AND (?2 IS NULL OR record_type = ?2)
             ORDER BY created_at, local_id",
        )?;

        let records = stmt
            .query_map(
                params![
                    state.map(SyncState::as_str),
                    record_type.map(RecordType::as_str)
                ],
                parse_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    /// Mark a record as having a send in flight (engine only).
    ///
    /// The transition is guarded on the current state; if the record
    /// moved elsewhere meanwhile, nothing changes and no event fires.
    pub(crate) fn mark_syncing(&self, local_id: RecordId) -> Result<()> {
        let conn = self.db.lock();
        let changed = set_state_from(&conn, local_id, SyncState::Pending, SyncState::Syncing)?;
        drop(conn);
        if changed {
            self.emit_state(local_id, SyncState::Syncing);
        }
        Ok(())
    }

    /// Return a record to `Pending` after a transient failure (engine only)
    pub(crate) fn mark_pending(&self, local_id: RecordId) -> Result<()> {
        let conn = self.db.lock();
        let changed = set_state_from(&conn, local_id, SyncState::Syncing, SyncState::Pending)?;
        drop(conn);
        if changed {
            self.emit_state(local_id, SyncState::Pending);
        }
        Ok(())
    }

    /// Record a successful server acknowledgment (engine only).
    ///
    /// `server_id` is write-once: the first acknowledgment pins it and
    /// later acks must agree. If an edit was collapsed into the outbox
    /// while the send was in flight, an active entry still exists and
    /// the record stays `Pending` until that newer version is acked.
    pub(crate) fn mark_synced(&self, local_id: RecordId, server_id: &str) -> Result<()> {
        let now = now_ms();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let record = get_record(&tx, local_id)?;

        match record.server_id.as_deref() {
            None => {
                tx.execute(
                    "UPDATE records SET server_id = ? WHERE local_id = ?",
                    params![server_id, local_id.as_str()],
                )?;
            }
            Some(existing) if existing != server_id => {
                // The server must treat local_id as an idempotency key;
                // a different id on re-ack would mean a duplicate row.
                tracing::warn!(
                    local_id = %local_id,
                    existing,
                    reported = server_id,
                    "server reported a different server_id for an already-synced record; keeping the original"
                );
            }
            Some(_) => {}
        }

        let still_queued: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM outbox WHERE local_id = ? AND state != 'failed')",
            params![local_id.as_str()],
            |row| row.get(0),
        )?;
        let state = if still_queued {
            SyncState::Pending
        } else {
            SyncState::Synced
        };
        tx.execute(
            "UPDATE records
             SET sync_state = ?, server_snapshot = NULL, failure_reason = NULL
             WHERE local_id = ?",
            params![state.as_str(), local_id.as_str()],
        )?;
        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('last_synced_at', ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![now.to_string()],
        )?;
        tx.commit()?;
        drop(conn);

        self.emit_state(local_id, state);
        tracing::info!(local_id = %local_id, server_id, state = %state, "record acknowledged by server");
        Ok(())
    }

    /// Pin the server id reported alongside a conflict (engine only).
    /// Write-once: a no-op if the record already has one.
    pub(crate) fn set_server_id(&self, local_id: RecordId, server_id: &str) -> Result<()> {
        self.db.lock().execute(
            "UPDATE records SET server_id = ? WHERE local_id = ? AND server_id IS NULL",
            params![server_id, local_id.as_str()],
        )?;
        Ok(())
    }

    /// Park a record for manual conflict resolution (engine only).
    ///
    /// Guarded on the sent snapshot like [`Self::apply_merge`]: if a
    /// local edit collapsed into the entry mid-flight, the record is
    /// not parked; the newer snapshot goes back out and the divergence
    /// is re-evaluated against it. Returns whether the record parked.
    pub(crate) fn park_conflicted(
        &self,
        local_id: RecordId,
        entry_id: i64,
        sent_base_version: i64,
        server_snapshot: &serde_json::Value,
    ) -> Result<bool> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        if !Outbox::snapshot_matches_tx(&tx, entry_id, sent_base_version)? {
            let changed = Self::requeue_superseded(&tx, local_id, entry_id)?;
            tx.commit()?;
            drop(conn);
            if changed {
                self.emit_state(local_id, SyncState::Pending);
            }
            return Ok(false);
        }
        Outbox::remove_tx(&tx, entry_id)?;
        tx.execute(
            "UPDATE records SET sync_state = 'conflicted', server_snapshot = ? WHERE local_id = ?",
            params![server_snapshot, local_id.as_str()],
        )?;
        tx.commit()?;
        drop(conn);

        self.emit_state(local_id, SyncState::Conflicted);
        tracing::warn!(local_id = %local_id, "record conflicted; awaiting manual resolution");
        Ok(true)
    }

    /// Mark a record failed after retry exhaustion or a permanent
    /// server rejection (engine only)
    pub(crate) fn mark_failed(&self, local_id: RecordId, reason: &str) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE records SET sync_state = 'failed', failure_reason = ? WHERE local_id = ?",
            params![reason, local_id.as_str()],
        )?;
        drop(conn);
        self.emit_state(local_id, SyncState::Failed);
        tracing::warn!(local_id = %local_id, reason, "record failed");
        Ok(())
    }

    /// Requeue the in-flight entry onto the server's version (conflict
    /// decided local-wins, engine only). The payload snapshot is left
    /// untouched, so an edit collapsed mid-flight rides along.
    pub(crate) fn rebase_local(
        &self,
        local_id: RecordId,
        entry_id: i64,
        server_version: i64,
    ) -> Result<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        Outbox::rebase_tx(&tx, entry_id, server_version, None)?;
        let changed = set_state_from(&tx, local_id, SyncState::Syncing, SyncState::Pending)?;
        tx.commit()?;
        drop(conn);
        if changed {
            self.emit_state(local_id, SyncState::Pending);
        }
        Ok(())
    }

    /// Adopt the server's payload for a conflicted in-flight send
    /// (keep-remote policy, engine only).
    ///
    /// The whole application is one transaction, guarded on the sent
    /// snapshot: if a local edit collapsed into the entry while the
    /// conflicted send was on the wire, adopting the server payload
    /// would silently drop that edit. The edit wins instead; it is
    /// requeued, conflicts again, and the policy is re-applied against
    /// it. Returns whether the remote payload was adopted.
    pub(crate) fn adopt_remote(
        &self,
        local_id: RecordId,
        entry_id: i64,
        sent_base_version: i64,
        server_payload: &serde_json::Value,
    ) -> Result<bool> {
        let now = now_ms();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        if !Outbox::snapshot_matches_tx(&tx, entry_id, sent_base_version)? {
            let changed = Self::requeue_superseded(&tx, local_id, entry_id)?;
            tx.commit()?;
            drop(conn);
            if changed {
                self.emit_state(local_id, SyncState::Pending);
            }
            return Ok(false);
        }
        let record = get_record(&tx, local_id)?;
        Outbox::remove_tx(&tx, entry_id)?;
        tx.execute(
            "UPDATE records
             SET payload = ?, version = ?, sync_state = 'synced', updated_at = ?,
                 server_snapshot = NULL, failure_reason = NULL
             WHERE local_id = ?",
            params![server_payload, record.version + 1, now, local_id.as_str()],
        )?;
        tx.commit()?;
        drop(conn);

        self.emit_state(local_id, SyncState::Synced);
        Ok(true)
    }

    /// Replace the record's payload with an automatic merge and rebase
    /// its entry for resubmission (engine merge path), in one
    /// transaction guarded on the sent snapshot.
    ///
    /// If a local edit collapsed into the entry mid-flight the merge is
    /// stale: the edit is kept on both the record and the entry, which
    /// goes back out, conflicts again, and is merged against the edit.
    /// Returns whether the merge was applied.
    pub(crate) fn apply_merge(
        &self,
        local_id: RecordId,
        entry_id: i64,
        sent_base_version: i64,
        merged: &serde_json::Value,
        server_version: i64,
    ) -> Result<bool> {
        let now = now_ms();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        if !Outbox::snapshot_matches_tx(&tx, entry_id, sent_base_version)? {
            let changed = Self::requeue_superseded(&tx, local_id, entry_id)?;
            tx.commit()?;
            drop(conn);
            if changed {
                self.emit_state(local_id, SyncState::Pending);
            }
            return Ok(false);
        }
        let record = get_record(&tx, local_id)?;
        tx.execute(
            "UPDATE records
             SET payload = ?, version = ?, sync_state = 'pending', updated_at = ?,
                 server_snapshot = NULL
             WHERE local_id = ?",
            params![merged, record.version + 1, now, local_id.as_str()],
        )?;
        Outbox::rebase_tx(&tx, entry_id, server_version, Some(merged))?;
        tx.commit()?;
        drop(conn);

        self.emit_state(local_id, SyncState::Pending);
        Ok(true)
    }

    /// A newer edit collapsed into the entry while its send was on the
    /// wire; put it back in the queue and return the record to pending.
    fn requeue_superseded(conn: &Connection, local_id: RecordId, entry_id: i64) -> Result<bool> {
        Outbox::requeue_tx(conn, entry_id)?;
        set_state_from(conn, local_id, SyncState::Syncing, SyncState::Pending)
    }

    /// User-initiated retry of a failed or conflicted record.
    ///
    /// Re-enqueues the record's current payload with a fresh attempt
    /// count; the failed outbox row, if present, is reactivated.
    pub fn retry(&self, local_id: RecordId) -> Result<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let record = get_record(&tx, local_id)?;
        if !matches!(
            record.sync_state,
            SyncState::Failed | SyncState::Conflicted
        ) {
            return Err(Error::InvalidState(format!(
                "record {local_id} is {}, only failed or conflicted records can be retried",
                record.sync_state
            )));
        }
        tx.execute(
            "UPDATE records
             SET sync_state = 'pending', failure_reason = NULL, server_snapshot = NULL
             WHERE local_id = ?",
            params![local_id.as_str()],
        )?;
        Self::enqueue_edit(&tx, &record, record.version, &record.payload)?;
        tx.commit()?;
        drop(conn);

        self.work.notify_one();
        self.emit_state(local_id, SyncState::Pending);
        Ok(())
    }

    /// Manually resolve a conflict by keeping the server's payload.
    ///
    /// The state check and the adoption share one transaction, so an
    /// edit racing in (which moves the record back to `Pending`) makes
    /// this fail with `InvalidState` instead of clobbering the edit.
    pub fn resolve_keep_remote(&self, local_id: RecordId) -> Result<()> {
        let now = now_ms();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let record = get_record(&tx, local_id)?;
        if record.sync_state != SyncState::Conflicted {
            return Err(Error::InvalidState(format!(
                "record {local_id} is {}, not conflicted",
                record.sync_state
            )));
        }
        let snapshot = record.server_snapshot.ok_or_else(|| {
            Error::InvalidState(format!("record {local_id} has no server snapshot"))
        })?;
        tx.execute(
            "UPDATE records
             SET payload = ?, version = ?, sync_state = 'synced', updated_at = ?,
                 server_snapshot = NULL, failure_reason = NULL
             WHERE local_id = ?",
            params![snapshot, record.version + 1, now, local_id.as_str()],
        )?;
        // A terminal failed row from an earlier cycle would otherwise
        // linger; conflicted records have no active entry.
        tx.execute(
            "DELETE FROM outbox WHERE local_id = ? AND state != 'in_flight'",
            params![local_id.as_str()],
        )?;
        tx.commit()?;
        drop(conn);

        self.emit_state(local_id, SyncState::Synced);
        Ok(())
    }

    /// Manually resolve a conflict with a payload the user merged
    /// themselves; queues it for resubmission. Returns the new version.
    pub fn resolve_with_payload(
        &self,
        local_id: RecordId,
        payload: serde_json::Value,
    ) -> Result<i64> {
        let record = self.get(local_id)?;
        if record.sync_state != SyncState::Conflicted {
            return Err(Error::InvalidState(format!(
                "record {local_id} is {}, not conflicted",
                record.sync_state
            )));
        }
        self.update(local_id, payload)
    }

    /// Recover records stuck in `Syncing` after an interrupted drain
    pub(crate) fn recover_interrupted(&self) -> Result<usize> {
        let recovered = self.db.lock().execute(
            "UPDATE records SET sync_state = 'pending' WHERE sync_state = 'syncing'",
            [],
        )?;
        if recovered > 0 {
            tracing::warn!(recovered, "recovered records interrupted mid-sync");
        }
        Ok(recovered)
    }

    /// Per-state counts and last-sync time for UI badges
    pub fn sync_status(&self) -> Result<SyncStatus> {
        let conn = self.db.lock();
        let mut status = SyncStatus::default();

        let mut stmt =
            conn.prepare("SELECT sync_state, COUNT(*) FROM records GROUP BY sync_state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (state, count) = row?;
            let count = usize::try_from(count).unwrap_or(0);
            match state.parse::<SyncState>()? {
                SyncState::Draft => status.drafts = count,
                SyncState::Pending => status.pending = count,
                SyncState::Syncing => status.syncing = count,
                SyncState::Synced => status.synced = count,
                SyncState::Conflicted => status.conflicted = count,
                SyncState::Failed => status.failed = count,
            }
        }

        status.last_synced_at = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'last_synced_at'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|value| value.parse().ok());

        Ok(status)
    }

    fn emit_state(&self, local_id: RecordId, sync_state: SyncState) {
        let _ = self.events.send(StoreEvent::StateChanged {
            local_id,
            sync_state,
        });
    }
}

fn validate_payload(payload: &serde_json::Value) -> Result<()> {
    if payload.is_object() {
        Ok(())
    } else {
        Err(Error::Validation(
            "record payload must be a JSON object".to_string(),
        ))
    }
}

fn insert_record(conn: &Connection, record: &Record) -> Result<()> {
    conn.execute(
        "INSERT INTO records (local_id, record_type, payload, version, sync_state,
                              server_id, server_snapshot, failure_reason, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            record.local_id.as_str(),
            record.record_type.as_str(),
            record.payload,
            record.version,
            record.sync_state.as_str(),
            record.server_id,
            record.server_snapshot,
            record.failure_reason,
            record.created_at,
            record.updated_at,
        ],
    )?;
    Ok(())
}

fn get_record(conn: &Connection, local_id: RecordId) -> Result<Record> {
    conn.query_row(
        "SELECT local_id, record_type, payload, version, sync_state,
                server_id, server_snapshot, failure_reason, created_at, updated_at
         FROM records WHERE local_id = ?",
        params![local_id.as_str()],
        parse_record,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(local_id.to_string()))
}

fn set_state(conn: &Connection, local_id: RecordId, state: SyncState) -> Result<()> {
    conn.execute(
        "UPDATE records SET sync_state = ? WHERE local_id = ?",
        params![state.as_str(), local_id.as_str()],
    )?;
    Ok(())
}

/// State transition guarded on the expected current state; returns
/// whether a row actually changed.
fn set_state_from(
    conn: &Connection,
    local_id: RecordId,
    from: SyncState,
    to: SyncState,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE records SET sync_state = ? WHERE local_id = ? AND sync_state = ?",
        params![to.as_str(), local_id.as_str(), from.as_str()],
    )?;
    Ok(changed > 0)
}

/// Parse a record from a database row
fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let local_id: String = row.get(0)?;
    let record_type: String = row.get(1)?;
    let sync_state: String = row.get(4)?;
    Ok(Record {
        local_id: local_id.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        record_type: record_type.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(1, "record_type".into(), rusqlite::types::Type::Text)
        })?,
        payload: row.get(2)?,
        version: row.get(3)?,
        sync_state: sync_state.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(4, "sync_state".into(), rusqlite::types::Type::Text)
        })?,
        server_id: row.get(5)?,
        server_snapshot: row.get(6)?,
        failure_reason: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::models::{EntryState, OutboxEntry};

    fn setup() -> (RecordStore, Outbox) {
        let db = Database::open_in_memory().unwrap();
        (RecordStore::new(db.clone()), Outbox::new(db))
    }

    /// A submitted record whose entry is on the wire, as the engine
    /// leaves it right before a server response arrives.
    fn in_flight(
        store: &RecordStore,
        outbox: &Outbox,
        payload: serde_json::Value,
    ) -> (Record, OutboxEntry) {
        let record = store.create(RecordType::WaterQuality, payload).unwrap();
        let entry = outbox.active_entry(record.local_id).unwrap().unwrap();
        outbox.mark_in_flight(entry.entry_id).unwrap();
        store.mark_syncing(record.local_id).unwrap();
        (record, entry)
    }

    #[test]
    fn create_lands_pending_with_outbox_entry() {
        let (store, outbox) = setup();
        let record = store
            .create(RecordType::WaterQuality, json!({"ph": "7.2"}))
            .unwrap();

        assert_eq!(record.sync_state, SyncState::Pending);
        assert_eq!(record.version, 1);
        let entry = outbox.active_entry(record.local_id).unwrap().unwrap();
        assert_eq!(entry.operation, Operation::Create);
        assert_eq!(entry.base_version, 1);
    }

    #[test]
    fn draft_has_no_outbox_entry_until_submitted() {
        let (store, outbox) = setup();
        let record = store
            .create_draft(RecordType::PatientForm, json!({"name": "Asha"}))
            .unwrap();

        assert_eq!(record.sync_state, SyncState::Draft);
        assert!(outbox.active_entry(record.local_id).unwrap().is_none());

        store.submit(record.local_id).unwrap();
        assert!(outbox.active_entry(record.local_id).unwrap().is_some());
        assert_eq!(
            store.get(record.local_id).unwrap().sync_state,
            SyncState::Pending
        );
    }

    #[test]
    fn submit_rejects_non_drafts() {
        let (store, _) = setup();
        let record = store.create(RecordType::PatientForm, json!({})).unwrap();
        assert!(matches!(
            store.submit(record.local_id),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn version_counts_mutations() {
        let (store, _) = setup();
        let record = store
            .create(RecordType::CommunityReport, json!({"desc": "a"}))
            .unwrap();

        for expected in 2..=5 {
            let version = store
                .update(record.local_id, json!({"desc": format!("edit {expected}")}))
                .unwrap();
            assert_eq!(version, expected);
        }
        assert_eq!(store.get(record.local_id).unwrap().version, 5);
    }

    #[test]
    fn update_collapses_into_single_outbox_entry() {
        let (store, outbox) = setup();
        let record = store
            .create(RecordType::WaterQuality, json!({"ph": "7.0"}))
            .unwrap();
        store.update(record.local_id, json!({"ph": "6.5"})).unwrap();
        store.update(record.local_id, json!({"ph": "6.1"})).unwrap();

        assert_eq!(outbox.len().unwrap(), 1);
        let entry = outbox.active_entry(record.local_id).unwrap().unwrap();
        assert_eq!(entry.base_version, 3);
        assert_eq!(entry.payload, json!({"ph": "6.1"}));
    }

    #[test]
    fn update_of_synced_record_enqueues_update_operation() {
        let (store, outbox) = setup();
        let record = store.create(RecordType::PatientForm, json!({})).unwrap();
        let entry = outbox.active_entry(record.local_id).unwrap().unwrap();
        outbox.complete_through(entry.entry_id, 1).unwrap();
        store.mark_synced(record.local_id, "srv-1").unwrap();

        store
            .update(record.local_id, json!({"name": "updated"}))
            .unwrap();
        let record = store.get(record.local_id).unwrap();
        assert_eq!(record.sync_state, SyncState::Pending);

        let entry = outbox.active_entry(record.local_id).unwrap().unwrap();
        assert_eq!(entry.operation, Operation::Update);
        assert_eq!(entry.base_version, 2);
    }

    #[test]
    fn rejects_non_object_payloads() {
        let (store, _) = setup();
        assert!(matches!(
            store.create(RecordType::PatientForm, json!("just a string")),
            Err(Error::Validation(_))
        ));
        let record = store.create(RecordType::PatientForm, json!({})).unwrap();
        assert!(matches!(
            store.update(record.local_id, json!(42)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn server_id_is_write_once() {
        let (store, outbox) = setup();
        let record = store.create(RecordType::PatientForm, json!({})).unwrap();
        let entry = outbox.active_entry(record.local_id).unwrap().unwrap();
        outbox.complete_through(entry.entry_id, 1).unwrap();

        store.mark_synced(record.local_id, "srv-1").unwrap();
        store.mark_synced(record.local_id, "srv-other").unwrap();

        let record = store.get(record.local_id).unwrap();
        assert_eq!(record.server_id.as_deref(), Some("srv-1"));
        assert_eq!(record.sync_state, SyncState::Synced);
    }

    #[test]
    fn mark_synced_stays_pending_when_newer_edit_is_queued() {
        let (store, outbox) = setup();
        let record = store.create(RecordType::PatientForm, json!({"v": 1})).unwrap();
        let entry = outbox.active_entry(record.local_id).unwrap().unwrap();
        outbox.mark_in_flight(entry.entry_id).unwrap();

        // Edit while the create is on the wire.
        store.update(record.local_id, json!({"v": 2})).unwrap();

        assert!(!outbox.complete_through(entry.entry_id, 1).unwrap());
        store.mark_synced(record.local_id, "srv-9").unwrap();

        let record = store.get(record.local_id).unwrap();
        assert_eq!(record.server_id.as_deref(), Some("srv-9"));
        assert_eq!(record.sync_state, SyncState::Pending);
    }

    #[test]
    fn list_filters_by_state_and_type() {
        let (store, _) = setup();
        store.create(RecordType::PatientForm, json!({})).unwrap();
        store.create(RecordType::WaterQuality, json!({})).unwrap();
        store
            .create_draft(RecordType::WaterQuality, json!({}))
            .unwrap();

        assert_eq!(store.list(None, None).unwrap().len(), 3);
        assert_eq!(
            store.list(Some(SyncState::Pending), None).unwrap().len(),
            2
        );
        assert_eq!(
            store
                .list(None, Some(RecordType::WaterQuality))
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            store
                .list(Some(SyncState::Draft), Some(RecordType::WaterQuality))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn retry_requeues_failed_record() {
        let (store, outbox) = setup();
        let record = store.create(RecordType::CommunityReport, json!({})).unwrap();
        let entry = outbox.active_entry(record.local_id).unwrap().unwrap();
        outbox.mark_failed(entry.entry_id).unwrap();
        store.mark_failed(record.local_id, "server said no").unwrap();

        let failed = store.get(record.local_id).unwrap();
        assert_eq!(failed.sync_state, SyncState::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("server said no"));

        store.retry(record.local_id).unwrap();
        let retried = store.get(record.local_id).unwrap();
        assert_eq!(retried.sync_state, SyncState::Pending);
        assert!(retried.failure_reason.is_none());

        let entry = outbox.active_entry(record.local_id).unwrap().unwrap();
        assert_eq!(entry.attempt_count, 0);
    }

    #[test]
    fn retry_rejects_healthy_records() {
        let (store, _) = setup();
        let record = store.create(RecordType::PatientForm, json!({})).unwrap();
        assert!(matches!(
            store.retry(record.local_id),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn manual_keep_remote_adopts_server_snapshot() {
        let (store, outbox) = setup();
        let (record, entry) = in_flight(&store, &outbox, json!({"name": "local"}));
        let parked = store
            .park_conflicted(
                record.local_id,
                entry.entry_id,
                entry.base_version,
                &json!({"name": "remote"}),
            )
            .unwrap();
        assert!(parked);

        store.resolve_keep_remote(record.local_id).unwrap();
        let resolved = store.get(record.local_id).unwrap();
        assert_eq!(resolved.sync_state, SyncState::Synced);
        assert_eq!(resolved.payload, json!({"name": "remote"}));
        assert_eq!(resolved.version, 2);
        assert!(resolved.server_snapshot.is_none());
    }

    #[test]
    fn manual_resolution_with_payload_requeues() {
        let (store, outbox) = setup();
        let (record, entry) = in_flight(&store, &outbox, json!({"name": "local"}));
        store
            .park_conflicted(
                record.local_id,
                entry.entry_id,
                entry.base_version,
                &json!({"name": "remote"}),
            )
            .unwrap();

        let version = store
            .resolve_with_payload(record.local_id, json!({"name": "merged by hand"}))
            .unwrap();
        assert_eq!(version, 2);
        let resolved = store.get(record.local_id).unwrap();
        assert_eq!(resolved.sync_state, SyncState::Pending);
        assert!(outbox.active_entry(record.local_id).unwrap().is_some());
    }

    #[test]
    fn merge_rebases_record_and_entry_together() {
        let (store, outbox) = setup();
        let (record, entry) = in_flight(&store, &outbox, json!({"ph": "6.0"}));

        let merged = json!({"ph": "6.0", "status": "reviewed"});
        let applied = store
            .apply_merge(record.local_id, entry.entry_id, entry.base_version, &merged, 7)
            .unwrap();
        assert!(applied);

        let updated = store.get(record.local_id).unwrap();
        assert_eq!(updated.payload, merged);
        assert_eq!(updated.version, 2);
        assert_eq!(updated.sync_state, SyncState::Pending);

        let entry = outbox.active_entry(record.local_id).unwrap().unwrap();
        assert_eq!(entry.payload, merged);
        assert_eq!(entry.base_version, 7);
        assert_eq!(entry.state, EntryState::Ready);
    }

    #[test]
    fn merge_yields_to_edit_collapsed_while_send_was_on_the_wire() {
        let (store, outbox) = setup();
        let (record, entry) = in_flight(&store, &outbox, json!({"ph": "6.0"}));

        // Edit lands while the conflicted send is in flight; the merge
        // decided against the stale snapshot must not clobber it.
        let edited = json!({"ph": "5.2", "note": "contamination suspected"});
        store.update(record.local_id, edited.clone()).unwrap();

        let merged = json!({"ph": "6.0", "status": "reviewed"});
        let applied = store
            .apply_merge(record.local_id, entry.entry_id, entry.base_version, &merged, 7)
            .unwrap();
        assert!(!applied);

        let kept = store.get(record.local_id).unwrap();
        assert_eq!(kept.payload, edited);
        assert_eq!(kept.version, 2);
        assert_eq!(kept.sync_state, SyncState::Pending);

        let survivor = outbox.active_entry(record.local_id).unwrap().unwrap();
        assert_eq!(survivor.payload, edited);
        assert_eq!(survivor.base_version, 2);
        assert_eq!(survivor.state, EntryState::Ready);
        assert_eq!(survivor.attempt_count, 0);
    }

    #[test]
    fn adopt_remote_yields_to_edit_collapsed_while_send_was_on_the_wire() {
        let (store, outbox) = setup();
        let (record, entry) = in_flight(&store, &outbox, json!({"ph": "6.0"}));

        let edited = json!({"ph": "5.9"});
        store.update(record.local_id, edited.clone()).unwrap();

        let adopted = store
            .adopt_remote(
                record.local_id,
                entry.entry_id,
                entry.base_version,
                &json!({"ph": "7.5"}),
            )
            .unwrap();
        assert!(!adopted);

        let kept = store.get(record.local_id).unwrap();
        assert_eq!(kept.payload, edited);
        assert_eq!(kept.sync_state, SyncState::Pending);
        assert!(outbox.active_entry(record.local_id).unwrap().is_some());
    }

    #[test]
    fn parking_yields_to_edit_collapsed_while_send_was_on_the_wire() {
        let (store, outbox) = setup();
        let (record, entry) = in_flight(&store, &outbox, json!({"diagnosis": "cholera suspected"}));

        let edited = json!({"diagnosis": "cholera confirmed"});
        store.update(record.local_id, edited.clone()).unwrap();

        let parked = store
            .park_conflicted(
                record.local_id,
                entry.entry_id,
                entry.base_version,
                &json!({"diagnosis": "gastroenteritis"}),
            )
            .unwrap();
        assert!(!parked);

        let kept = store.get(record.local_id).unwrap();
        assert_eq!(kept.sync_state, SyncState::Pending);
        assert!(kept.server_snapshot.is_none());
        let survivor = outbox.active_entry(record.local_id).unwrap().unwrap();
        assert_eq!(survivor.payload, edited);
        assert_eq!(survivor.state, EntryState::Ready);
    }

    #[test]
    fn state_events_fire_only_on_actual_transitions() {
        let (store, _) = setup();
        let record = store.create(RecordType::PatientForm, json!({})).unwrap();
        let mut rx = store.subscribe();

        // Pending -> pending via the syncing guard: no row changes, no event.
        store.mark_pending(record.local_id).unwrap();
        assert!(rx.try_recv().is_err());

        store.mark_syncing(record.local_id).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            StoreEvent::StateChanged {
                local_id: record.local_id,
                sync_state: SyncState::Syncing,
            }
        );

        // Already syncing: the pending guard misses, no second event.
        store.mark_syncing(record.local_id).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sync_status_counts_states() {
        let (store, _) = setup();
        store.create(RecordType::PatientForm, json!({})).unwrap();
        store.create(RecordType::WaterQuality, json!({})).unwrap();
        store.create_draft(RecordType::PatientForm, json!({})).unwrap();

        let status = store.sync_status().unwrap();
        assert_eq!(status.pending, 2);
        assert_eq!(status.drafts, 1);
        assert_eq!(status.pending_sync(), 2);
        assert_eq!(status.last_synced_at, None);
    }

    #[test]
    fn events_are_broadcast_to_subscribers() {
        let (store, _) = setup();
        let mut rx = store.subscribe();
        let record = store.create(RecordType::PatientForm, json!({})).unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(
            event,
            StoreEvent::Created {
                local_id: record.local_id,
                record_type: RecordType::PatientForm
            }
        );
    }

    #[test]
    fn get_unknown_record_is_not_found() {
        let (store, _) = setup();
        assert!(matches!(
            store.get(RecordId::new()),
            Err(Error::NotFound(_))
        ));
    }
}
