use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use sehat_core::{RecordType, SyncState};

#[derive(Parser)]
#[command(name = "sehat")]
#[command(about = "Capture and sync community health records from the command line")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture a new record
    #[command(alias = "new")]
    Add {
        /// Record kind
        #[arg(value_enum)]
        record_type: RecordTypeArg,
        /// Record payload as a JSON object
        payload: String,
        /// Save as a draft instead of submitting for sync
        #[arg(long)]
        draft: bool,
    },
    /// Submit a draft for sync
    Submit {
        /// Record ID
        id: String,
    },
    /// List records
    List {
        /// Filter by sync state
        #[arg(long, value_enum)]
        state: Option<SyncStateArg>,
        /// Filter by record kind
        #[arg(long = "type", value_enum)]
        record_type: Option<RecordTypeArg>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one record in full
    Show {
        /// Record ID
        id: String,
    },
    /// Edit a record's payload
    Edit {
        /// Record ID
        id: String,
        /// Replacement payload as a JSON object
        payload: String,
    },
    /// Show sync status badges (pending count, last sync, failures)
    Status,
    /// Retry a failed or conflicted record
    Retry {
        /// Record ID
        id: String,
    },
    /// Resolve a conflicted record
    Resolve {
        /// Record ID
        id: String,
        /// Adopt the server's version
        #[arg(long, conflicts_with = "payload")]
        keep_remote: bool,
        /// Resubmit this hand-merged JSON payload
        #[arg(long, value_name = "JSON")]
        payload: Option<String>,
    },
    /// Drain the outbox against the health-authority server once
    Sync {
        /// Server base URL (falls back to SEHAT_SERVER_URL)
        #[arg(long, value_name = "URL")]
        server: Option<String>,
        /// Bearer token (falls back to SEHAT_AUTH_TOKEN)
        #[arg(long, value_name = "TOKEN")]
        token: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum RecordTypeArg {
    PatientForm,
    WaterQuality,
    CommunityReport,
}

impl From<RecordTypeArg> for RecordType {
    fn from(arg: RecordTypeArg) -> Self {
        match arg {
            RecordTypeArg::PatientForm => Self::PatientForm,
            RecordTypeArg::WaterQuality => Self::WaterQuality,
            RecordTypeArg::CommunityReport => Self::CommunityReport,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum SyncStateArg {
    Draft,
    Pending,
    Syncing,
    Synced,
    Conflicted,
    Failed,
}

impl From<SyncStateArg> for SyncState {
    fn from(arg: SyncStateArg) -> Self {
        match arg {
            SyncStateArg::Draft => Self::Draft,
            SyncStateArg::Pending => Self::Pending,
            SyncStateArg::Syncing => Self::Syncing,
            SyncStateArg::Synced => Self::Synced,
            SyncStateArg::Conflicted => Self::Conflicted,
            SyncStateArg::Failed => Self::Failed,
        }
    }
}
