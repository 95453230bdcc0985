//! Sync engine
//!
//! A single background worker drains the outbox whenever connectivity
//! allows: it sends the oldest ready entries (concurrently, up to a
//! bounded limit, never two for the same record), applies server
//! responses back into the record store, and schedules retries with
//! exponential backoff. Draining pauses as soon as the connectivity
//! monitor reports offline; in-flight sends are allowed to finish.

pub mod backoff;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::connectivity::{ConnState, ConnectivityMonitor};
use crate::error::{Error, Result};
use crate::models::{OutboxEntry, RecordType};
use crate::outbox::Outbox;
use crate::resolve::{self, ConflictPolicy, Decision};
use crate::store::RecordStore;
use crate::util::now_ms;

pub use transport::{HttpTransport, RecordTransport, SubmitOutcome, SubmitRequest};

/// Tunable sync behavior.
///
/// The defaults are design choices, not extracted constants; deployments
/// tune them per region and per record type.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// First backoff step after a transient failure
    pub base_delay: Duration,
    /// Ceiling on any single backoff delay
    pub max_delay: Duration,
    /// Transient failures tolerated before a record goes to `Failed`
    pub max_attempts: i64,
    /// Concurrent sends per drain pass (always distinct records)
    pub concurrency: usize,
    /// How long the worker sleeps when the outbox is empty
    pub idle_poll: Duration,
    default_policy: ConflictPolicy,
    policies: HashMap<RecordType, ConflictPolicy>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            max_attempts: 5,
            concurrency: 4,
            idle_poll: Duration::from_secs(60),
            default_policy: ConflictPolicy::MergeDisjoint,
            policies: HashMap::new(),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub const fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Override the conflict policy for one record type
    #[must_use]
    pub fn with_policy(mut self, record_type: RecordType, policy: ConflictPolicy) -> Self {
        self.policies.insert(record_type, policy);
        self
    }

    /// Replace the default conflict policy for all record types
    #[must_use]
    pub fn with_default_policy(mut self, policy: ConflictPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// The conflict policy in effect for a record type
    #[must_use]
    pub fn policy_for(&self, record_type: RecordType) -> ConflictPolicy {
        self.policies
            .get(&record_type)
            .copied()
            .unwrap_or(self.default_policy)
    }
}

/// Counts from one drain pass, for logging and CLI output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub sent: usize,
    pub acked: usize,
    pub merged: usize,
    pub conflicted: usize,
    pub transient: usize,
    pub failed: usize,
}

impl DrainSummary {
    #[must_use]
    pub const fn is_quiet(&self) -> bool {
        self.sent == 0
    }
}

/// Drains the outbox against the network and reconciles responses
pub struct SyncEngine {
    store: RecordStore,
    outbox: Outbox,
    transport: Arc<dyn RecordTransport>,
    connectivity: watch::Receiver<ConnState>,
    config: SyncConfig,
}

impl SyncEngine {
    #[must_use]
    pub fn new(
        store: RecordStore,
        outbox: Outbox,
        transport: Arc<dyn RecordTransport>,
        monitor: &ConnectivityMonitor,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            outbox,
            transport,
            connectivity: monitor.subscribe(),
            config,
        }
    }

    fn is_online(&self) -> bool {
        self.connectivity.borrow().is_online()
    }

    /// Recover state left behind by a crash or cancelled drain.
    ///
    /// Sends whose response was never observed are treated as transient
    /// failures; the server's `local_id` idempotency keeps a replayed
    /// create from creating a duplicate.
    pub fn recover(&self) -> Result<usize> {
        let requeued = self.outbox.requeue_in_flight()?;
        self.store.recover_interrupted()?;
        Ok(requeued)
    }

    /// Run one drain cycle to completion (or until connectivity drops).
    ///
    /// Sends ready entries in FIFO order, up to `concurrency` at a time,
    /// and applies every response before returning.
    pub async fn drain_once(&self) -> Result<DrainSummary> {
        self.drain(None).await
    }

    /// Drain with an optional shutdown signal checked between batches,
    /// so a cooperative shutdown stops after the in-flight sends finish
    /// instead of working through the whole backlog.
    async fn drain(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();

        loop {
            if !self.is_online() {
                break;
            }
            if shutdown.is_some_and(|signal| *signal.borrow()) {
                break;
            }
            let batch = self.outbox.ready_batch(now_ms(), self.config.concurrency)?;
            if batch.is_empty() {
                break;
            }

            let mut sends: JoinSet<(OutboxEntry, SubmitOutcome)> = JoinSet::new();
            for entry in batch {
                let record = match self.store.get(entry.local_id) {
                    Ok(record) => record,
                    Err(Error::NotFound(_)) => {
                        tracing::warn!(local_id = %entry.local_id, "outbox entry for missing record; dropping");
                        self.outbox.remove(entry.entry_id)?;
                        continue;
                    }
                    Err(error) => return Err(error),
                };

                self.outbox.mark_in_flight(entry.entry_id)?;
                self.store.mark_syncing(entry.local_id)?;

                let request = SubmitRequest {
                    local_id: entry.local_id,
                    server_id: record.server_id.clone(),
                    record_type: record.record_type,
                    operation: entry.operation,
                    base_version: entry.base_version,
                    payload: entry.payload.clone(),
                };
                let transport = Arc::clone(&self.transport);
                summary.sent += 1;
                sends.spawn(async move {
                    let outcome = transport.submit(request).await;
                    (entry, outcome)
                });
            }

            while let Some(joined) = sends.join_next().await {
                match joined {
                    Ok((entry, outcome)) => self.apply_outcome(&entry, outcome, &mut summary)?,
                    Err(error) => {
                        // The entry stays in-flight and is requeued by
                        // the next recover().
                        tracing::warn!(%error, "send task failed to join");
                    }
                }
            }
        }

        if !summary.is_quiet() {
            tracing::info!(?summary, "drain cycle finished");
        }
        Ok(summary)
    }

    fn apply_outcome(
        &self,
        entry: &OutboxEntry,
        outcome: SubmitOutcome,
        summary: &mut DrainSummary,
    ) -> Result<()> {
        match outcome {
            SubmitOutcome::Acked {
                server_id,
                server_version,
            } => {
                tracing::debug!(
                    local_id = %entry.local_id,
                    server_id,
                    server_version,
                    "submission acknowledged"
                );
                self.outbox.complete_through(entry.entry_id, entry.base_version)?;
                self.store.mark_synced(entry.local_id, &server_id)?;
                summary.acked += 1;
            }
            SubmitOutcome::Conflict {
                server_id,
                server_payload,
                server_version,
            } => {
                if let Some(server_id) = server_id {
                    self.store.set_server_id(entry.local_id, &server_id)?;
                }
                self.handle_conflict(entry, &server_payload, server_version, summary)?;
            }
            SubmitOutcome::TransientError(reason) => {
                self.handle_transient(entry, &reason, summary)?;
            }
            SubmitOutcome::PermanentError(reason) => {
                self.fail_entry(entry, &reason, summary)?;
            }
        }
        Ok(())
    }

    fn handle_conflict(
        &self,
        entry: &OutboxEntry,
        server_payload: &serde_json::Value,
        server_version: i64,
        summary: &mut DrainSummary,
    ) -> Result<()> {
        let record = self.store.get(entry.local_id)?;
        let policy = self.config.policy_for(record.record_type);
        let decision = resolve::resolve(
            policy,
            &entry.payload,
            server_payload,
            entry.base_version,
            server_version,
        );
        tracing::info!(
            local_id = %entry.local_id,
            record_type = %record.record_type,
            ?policy,
            ?decision,
            "conflict reported by server"
        );

        // Each application is a single store transaction guarded on the
        // sent snapshot: if an edit collapsed into the entry while the
        // conflicted send was on the wire, the decision is stale; the
        // edit is requeued and the next round re-decides against it.
        match decision {
            Decision::KeepLocal => {
                self.store
                    .rebase_local(entry.local_id, entry.entry_id, server_version)?;
                summary.conflicted += 1;
            }
            Decision::KeepRemote => {
                self.store.adopt_remote(
                    entry.local_id,
                    entry.entry_id,
                    entry.base_version,
                    server_payload,
                )?;
                summary.conflicted += 1;
            }
            Decision::Merge(merged) => {
                let applied = self.store.apply_merge(
                    entry.local_id,
                    entry.entry_id,
                    entry.base_version,
                    &merged,
                    server_version,
                )?;
                if applied {
                    summary.merged += 1;
                } else {
                    summary.conflicted += 1;
                }
            }
            Decision::ManualResolutionRequired => {
                self.store.park_conflicted(
                    entry.local_id,
                    entry.entry_id,
                    entry.base_version,
                    server_payload,
                )?;
                summary.conflicted += 1;
            }
        }
        Ok(())
    }

    fn handle_transient(
        &self,
        entry: &OutboxEntry,
        reason: &str,
        summary: &mut DrainSummary,
    ) -> Result<()> {
        let attempts = entry.attempt_count + 1;
        if attempts > self.config.max_attempts {
            let reason = format!(
                "retry budget exhausted after {} attempts: {reason}",
                attempts - 1
            );
            return self.fail_entry(entry, &reason, summary);
        }

        let nominal = backoff::retry_delay(
            self.config.base_delay,
            self.config.max_delay,
            u32::try_from(attempts).unwrap_or(u32::MAX),
        );
        let delay = backoff::jittered(nominal);
        let next_retry_at = now_ms() + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);

        tracing::debug!(
            local_id = %entry.local_id,
            attempts,
            delay_ms = delay.as_millis() as u64,
            reason,
            "transient failure; rescheduled"
        );
        self.outbox.reschedule(entry.entry_id, next_retry_at, attempts)?;
        self.store.mark_pending(entry.local_id)?;
        summary.transient += 1;
        Ok(())
    }

    fn fail_entry(
        &self,
        entry: &OutboxEntry,
        reason: &str,
        summary: &mut DrainSummary,
    ) -> Result<()> {
        self.outbox.mark_failed(entry.entry_id)?;
        self.store.mark_failed(entry.local_id, reason)?;
        summary.failed += 1;
        Ok(())
    }

    /// Run the drain worker until shutdown is signalled.
    ///
    /// The worker parks while offline and wakes on reconnect, on newly
    /// enqueued work, and when the earliest scheduled retry comes due.
    /// Shutdown is cooperative: the current batch finishes its sends
    /// before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.recover()?;
        let work = self.store.work_signal();
        let mut connectivity = self.connectivity.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.is_online() {
                tokio::select! {
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            // Monitor dropped; nothing will ever wake us.
                            break;
                        }
                    }
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            self.drain(Some(&shutdown)).await?;

            let wait = match self.outbox.next_due_at()? {
                Some(due) => {
                    let remaining = due.saturating_sub(now_ms()).max(0);
                    Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
                        .min(self.config.idle_poll)
                }
                None => self.config.idle_poll,
            };

            tokio::select! {
                () = work.notified() => {}
                _ = connectivity.changed() => {}
                _ = shutdown.changed() => {}
                () = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!("sync worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config_values() {
        let config = SyncConfig::default();
        assert_eq!(config.base_delay, Duration::from_secs(2));
        assert_eq!(config.max_delay, Duration::from_secs(300));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.concurrency, 4);
    }

    #[test]
    fn per_type_policy_overrides_default() {
        let config = SyncConfig::default()
            .with_policy(RecordType::WaterQuality, ConflictPolicy::KeepRemote);

        assert_eq!(
            config.policy_for(RecordType::WaterQuality),
            ConflictPolicy::KeepRemote
        );
        assert_eq!(
            config.policy_for(RecordType::PatientForm),
            ConflictPolicy::MergeDisjoint
        );
    }
}
