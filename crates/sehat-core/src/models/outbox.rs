//! Outbox entry model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::models::RecordId;

/// The mutation kind an outbox entry carries to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
}

impl Operation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            other => Err(Error::Validation(format!("unknown operation: {other}"))),
        }
    }
}

/// Queue state of an outbox entry.
///
/// `Ready` and `InFlight` are active; `Failed` is a terminal sub-state
/// kept in the outbox until a user-initiated retry reactivates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Ready,
    InFlight,
    Failed,
}

impl EntryState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::InFlight => "in_flight",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for EntryState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "in_flight" => Ok(Self::InFlight),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Validation(format!("unknown entry state: {other}"))),
        }
    }
}

/// One unconfirmed mutation waiting (or failed) in the outbox.
///
/// At most one active entry exists per record; a local edit against an
/// active entry replaces its payload snapshot and `base_version` in
/// place, keeping per-record deliveries strictly ordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Sequence number; defines total enqueue order
    pub entry_id: i64,
    /// The record this mutation targets
    pub local_id: RecordId,
    /// The mutation to perform
    pub operation: Operation,
    /// The record's version when this snapshot was captured
    pub base_version: i64,
    /// Immutable payload snapshot captured at enqueue time
    pub payload: serde_json::Value,
    /// Transient failures so far for the current submission
    pub attempt_count: i64,
    /// Earliest time (Unix ms) this entry may be sent again
    pub next_retry_at: i64,
    /// Queue state
    pub state: EntryState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_round_trip() {
        assert_eq!("create".parse::<Operation>().unwrap(), Operation::Create);
        assert_eq!("update".parse::<Operation>().unwrap(), Operation::Update);
        assert!("delete".parse::<Operation>().is_err());
    }

    #[test]
    fn entry_state_round_trip() {
        for state in [EntryState::Ready, EntryState::InFlight, EntryState::Failed] {
            assert_eq!(state.as_str().parse::<EntryState>().unwrap(), state);
        }
    }
}
