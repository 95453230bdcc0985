//! Data models for Sehat

mod outbox;
mod record;

pub use outbox::{EntryState, Operation, OutboxEntry};
pub use record::{Record, RecordId, RecordType, SyncState};
