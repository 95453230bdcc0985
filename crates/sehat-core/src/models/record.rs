//! Record model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// A unique identifier for a locally-authored record, using UUID v7
/// (time-sortable). Generated on the device, stable for the record's
/// lifetime, and used by the server as an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The kind of domain record being captured.
///
/// The payload behind each kind is opaque to this core; the type only
/// drives per-kind conflict policy and server routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordType {
    PatientForm,
    WaterQuality,
    CommunityReport,
}

impl RecordType {
    /// Stable string form used in storage and on the wire
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PatientForm => "patient-form",
            Self::WaterQuality => "water-quality",
            Self::CommunityReport => "community-report",
        }
    }

    /// All known record types
    pub const ALL: [Self; 3] = [Self::PatientForm, Self::WaterQuality, Self::CommunityReport];
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient-form" => Ok(Self::PatientForm),
            "water-quality" => Ok(Self::WaterQuality),
            "community-report" => Ok(Self::CommunityReport),
            other => Err(Error::Validation(format!(
                "unrecognized record type: {other}"
            ))),
        }
    }
}

/// Lifecycle of a record from capture to confirmed server acknowledgment.
///
/// `Draft → Pending → Syncing → Synced | Conflicted | Failed`;
/// `Conflicted` and `Failed` re-enter `Pending` via resolve/retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Draft,
    Pending,
    Syncing,
    Synced,
    Conflicted,
    Failed,
}

impl SyncState {
    /// Stable string form used in storage
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "conflicted" => Ok(Self::Conflicted),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Validation(format!("unknown sync state: {other}"))),
        }
    }
}

/// A locally-authored domain record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Locally generated identifier; never changes
    pub local_id: RecordId,
    /// Which kind of record this is
    pub record_type: RecordType,
    /// Opaque structured payload owned by the UI collaborator
    pub payload: serde_json::Value,
    /// Starts at 1, incremented on every local mutation
    pub version: i64,
    /// Where this record sits in its sync lifecycle
    pub sync_state: SyncState,
    /// Server-assigned identifier; set at most once, immutable after
    pub server_id: Option<String>,
    /// Last server payload seen for a conflicted record, retained so
    /// the UI can render both sides during manual resolution
    pub server_snapshot: Option<serde_json::Value>,
    /// Human-readable reason when `sync_state == Failed`
    pub failure_reason: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last local mutation timestamp (Unix ms)
    pub updated_at: i64,
}

impl Record {
    /// Create a new record in the given initial state
    #[must_use]
    pub fn new(record_type: RecordType, payload: serde_json::Value, state: SyncState) -> Self {
        let now = crate::util::now_ms();
        Self {
            local_id: RecordId::new(),
            record_type,
            payload,
            version: 1,
            sync_state: state,
            server_id: None,
            server_snapshot: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn record_id_unique() {
        let id1 = RecordId::new();
        let id2 = RecordId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn record_id_parse_round_trip() {
        let id = RecordId::new();
        let parsed: RecordId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn record_type_round_trip() {
        for kind in RecordType::ALL {
            let parsed: RecordType = kind.as_str().parse().unwrap();
            assert_eq!(kind, parsed);
        }
    }

    #[test]
    fn record_type_rejects_unknown() {
        assert!("vital-signs".parse::<RecordType>().is_err());
    }

    #[test]
    fn sync_state_round_trip() {
        for state in [
            SyncState::Draft,
            SyncState::Pending,
            SyncState::Syncing,
            SyncState::Synced,
            SyncState::Conflicted,
            SyncState::Failed,
        ] {
            let parsed: SyncState = state.as_str().parse().unwrap();
            assert_eq!(state, parsed);
        }
    }

    #[test]
    fn new_record_starts_at_version_one() {
        let record = Record::new(
            RecordType::WaterQuality,
            json!({"ph": 7.2}),
            SyncState::Pending,
        );
        assert_eq!(record.version, 1);
        assert_eq!(record.sync_state, SyncState::Pending);
        assert!(record.server_id.is_none());
        assert_eq!(record.created_at, record.updated_at);
    }
}
