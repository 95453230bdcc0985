//! sehat-core - Core library for Sehat
//!
//! Offline-first capture and synchronization for community health work:
//! durable local storage of patient forms, water-quality tests, and
//! community reports, an ordered outbox of unconfirmed mutations, and a
//! sync engine that drains the outbox against the health-authority
//! server with retry, backoff, and conflict resolution.

pub mod connectivity;
pub mod db;
pub mod error;
pub mod models;
pub mod outbox;
pub mod resolve;
pub mod store;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{Record, RecordId, RecordType, SyncState};
