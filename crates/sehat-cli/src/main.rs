//! Sehat CLI - capture and sync health records from the terminal
//!
//! A thin UI collaborator over sehat-core: everything it does is a
//! direct call into the record store or a one-shot drain of the outbox.

mod cli;
mod error;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use sehat_core::connectivity::{ConnState, ConnectivityMonitor};
use sehat_core::db::Database;
use sehat_core::outbox::Outbox;
use sehat_core::store::RecordStore;
use sehat_core::sync::{HttpTransport, RecordTransport, SyncConfig, SyncEngine};
use sehat_core::util::format_ms;
use sehat_core::{Record, RecordId};

use crate::cli::{Cli, Commands};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let db_path = resolve_db_path(cli.db_path);
    let db = Database::open(&db_path)?;
    let store = RecordStore::new(db.clone());
    let outbox = Outbox::new(db);

    match cli.command {
        Commands::Add {
            record_type,
            payload,
            draft,
        } => run_add(&store, record_type, &payload, draft),
        Commands::Submit { id } => run_submit(&store, &id),
        Commands::List {
            state,
            record_type,
            json,
        } => run_list(&store, state, record_type, json),
        Commands::Show { id } => run_show(&store, &id),
        Commands::Edit { id, payload } => run_edit(&store, &id, &payload),
        Commands::Status => run_status(&store, &outbox),
        Commands::Retry { id } => run_retry(&store, &id),
        Commands::Resolve {
            id,
            keep_remote,
            payload,
        } => run_resolve(&store, &id, keep_remote, payload.as_deref()),
        Commands::Sync { server, token } => run_sync(store, outbox, server, token).await,
    }
}

fn resolve_db_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| env::var_os("SEHAT_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("sehat.db"))
}

fn parse_record_id(raw: &str) -> Result<RecordId, CliError> {
    raw.parse()
        .map_err(|_| CliError::InvalidRecordId(raw.to_string()))
}

fn parse_payload(raw: &str) -> Result<serde_json::Value, CliError> {
    serde_json::from_str(raw).map_err(|error| CliError::InvalidPayload(error.to_string()))
}

fn run_add(
    store: &RecordStore,
    record_type: cli::RecordTypeArg,
    payload: &str,
    draft: bool,
) -> Result<(), CliError> {
    let payload = parse_payload(payload)?;
    let record = if draft {
        store.create_draft(record_type.into(), payload)?
    } else {
        store.create(record_type.into(), payload)?
    };
    println!("{}", record.local_id);
    Ok(())
}

fn run_submit(store: &RecordStore, id: &str) -> Result<(), CliError> {
    let record = store.submit(parse_record_id(id)?)?;
    println!("{} queued for sync", record.local_id);
    Ok(())
}

#[derive(Serialize)]
struct RecordListItem {
    local_id: String,
    record_type: String,
    sync_state: String,
    version: i64,
    server_id: Option<String>,
    updated_at: String,
}

fn record_to_list_item(record: &Record) -> RecordListItem {
    RecordListItem {
        local_id: record.local_id.to_string(),
        record_type: record.record_type.to_string(),
        sync_state: record.sync_state.to_string(),
        version: record.version,
        server_id: record.server_id.clone(),
        updated_at: format_ms(record.updated_at),
    }
}

fn run_list(
    store: &RecordStore,
    state: Option<cli::SyncStateArg>,
    record_type: Option<cli::RecordTypeArg>,
    as_json: bool,
) -> Result<(), CliError> {
    let records = store.list(state.map(Into::into), record_type.map(Into::into))?;

    if as_json {
        let items: Vec<RecordListItem> = records.iter().map(record_to_list_item).collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No records.");
        return Ok(());
    }
    for record in &records {
        println!(
            "{}  {:<16}  {:<10}  v{}  {}",
            record.local_id,
            record.record_type,
            record.sync_state,
            record.version,
            format_ms(record.updated_at),
        );
    }
    Ok(())
}

fn run_show(store: &RecordStore, id: &str) -> Result<(), CliError> {
    let record = store.get(parse_record_id(id)?)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn run_edit(store: &RecordStore, id: &str, payload: &str) -> Result<(), CliError> {
    let version = store.update(parse_record_id(id)?, parse_payload(payload)?)?;
    println!("Updated to v{version}");
    Ok(())
}

fn run_status(store: &RecordStore, outbox: &Outbox) -> Result<(), CliError> {
    let status = store.sync_status()?;
    println!("Pending Sync: {}", status.pending_sync());
    println!(
        "Last Sync: {}",
        status.last_synced_at.map_or_else(|| "-".to_string(), format_ms)
    );
    println!("Drafts: {}", status.drafts);
    println!("Synced: {}", status.synced);
    if status.conflicted > 0 {
        println!("Conflicted: {} (run `sehat resolve <id>`)", status.conflicted);
    }
    if status.failed > 0 {
        println!("Failed: {} (run `sehat retry <id>`)", status.failed);
    }
    println!("Outbox entries: {}", outbox.len()?);
    Ok(())
}

fn run_retry(store: &RecordStore, id: &str) -> Result<(), CliError> {
    let local_id = parse_record_id(id)?;
    store.retry(local_id)?;
    println!("{local_id} queued for retry");
    Ok(())
}

fn run_resolve(
    store: &RecordStore,
    id: &str,
    keep_remote: bool,
    payload: Option<&str>,
) -> Result<(), CliError> {
    let local_id = parse_record_id(id)?;
    match (keep_remote, payload) {
        (true, _) => {
            store.resolve_keep_remote(local_id)?;
            println!("{local_id} resolved: kept server version");
        }
        (false, Some(payload)) => {
            let version = store.resolve_with_payload(local_id, parse_payload(payload)?)?;
            println!("{local_id} resolved: merged payload queued as v{version}");
        }
        (false, None) => return Err(CliError::MissingResolution),
    }
    Ok(())
}

async fn run_sync(
    store: RecordStore,
    outbox: Outbox,
    server: Option<String>,
    token: Option<String>,
) -> Result<(), CliError> {
    let server = server
        .or_else(|| env::var("SEHAT_SERVER_URL").ok())
        .ok_or(CliError::SyncNotConfigured)?;
    let token = token.or_else(|| env::var("SEHAT_AUTH_TOKEN").ok());

    let mut transport = HttpTransport::new(server)?;
    if let Some(token) = token {
        transport = transport.with_auth_token(token);
    }

    // One-shot drain: the CLI is always "online" once invoked.
    let monitor = ConnectivityMonitor::new(ConnState::Online);
    let engine = SyncEngine::new(
        store.clone(),
        outbox,
        Arc::new(transport) as Arc<dyn RecordTransport>,
        &monitor,
        SyncConfig::default(),
    );
    engine.recover()?;
    let summary = engine.drain_once().await?;
    tracing::info!(
        sent = summary.sent,
        acked = summary.acked,
        merged = summary.merged,
        conflicted = summary.conflicted,
        transient = summary.transient,
        failed = summary.failed,
        "drain finished"
    );

    println!(
        "Sync finished: {} sent, {} acked, {} merged, {} conflicted, {} retrying, {} failed",
        summary.sent,
        summary.acked,
        summary.merged,
        summary.conflicted,
        summary.transient,
        summary.failed,
    );

    let status = store.sync_status()?;
    if status.pending_sync() > 0 {
        println!("Pending Sync: {}", status.pending_sync());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sehat_core::SyncState;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_store() -> RecordStore {
        RecordStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn resolve_db_path_prefers_flag() {
        let path = resolve_db_path(Some(PathBuf::from("/tmp/custom.db")));
        assert_eq!(path, PathBuf::from("/tmp/custom.db"));
    }

    #[test]
    fn parse_payload_rejects_invalid_json() {
        assert!(parse_payload("{not json").is_err());
        assert!(parse_payload(r#"{"ph": "7.2"}"#).is_ok());
    }

    #[test]
    fn parse_record_id_rejects_garbage() {
        assert!(parse_record_id("not-a-uuid").is_err());
        assert!(parse_record_id(&RecordId::new().to_string()).is_ok());
    }

    #[test]
    fn add_then_list_round_trip() {
        let store = test_store();
        run_add(
            &store,
            cli::RecordTypeArg::WaterQuality,
            r#"{"ph": "7.2"}"#,
            false,
        )
        .unwrap();

        let records = store.list(None, None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sync_state, SyncState::Pending);
        assert_eq!(records[0].payload, json!({"ph": "7.2"}));
    }

    #[test]
    fn resolve_requires_a_choice() {
        let store = test_store();
        let record = store
            .create(sehat_core::RecordType::PatientForm, json!({}))
            .unwrap();
        let result = run_resolve(&store, &record.local_id.to_string(), false, None);
        assert!(matches!(result, Err(CliError::MissingResolution)));
    }

    #[test]
    fn list_item_serializes_badge_fields() {
        let store = test_store();
        let record = store
            .create(sehat_core::RecordType::CommunityReport, json!({"n": 1}))
            .unwrap();
        let item = record_to_list_item(&store.get(record.local_id).unwrap());
        assert_eq!(item.sync_state, "pending");
        assert_eq!(item.version, 1);
        assert!(item.server_id.is_none());
    }

    #[test]
    fn database_persists_across_invocations() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sehat.db");
        let id = {
            let store = RecordStore::new(Database::open(&path).unwrap());
            store
                .create(sehat_core::RecordType::PatientForm, json!({"name": "Asha"}))
                .unwrap()
                .local_id
        };
        let store = RecordStore::new(Database::open(&path).unwrap());
        let record = store.get(id).unwrap();
        assert_eq!(record.payload, json!({"name": "Asha"}));
        assert_eq!(record.sync_state, SyncState::Pending);
    }
}
