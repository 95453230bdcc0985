use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] sehat_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid record id: {0}")]
    InvalidRecordId(String),
    #[error("Record payload must be valid JSON: {0}")]
    InvalidPayload(String),
    #[error("Pass either --keep-remote or --payload to resolve a conflict")]
    MissingResolution,
    #[error("Sync needs a server URL; pass --server or set SEHAT_SERVER_URL")]
    SyncNotConfigured,
}
