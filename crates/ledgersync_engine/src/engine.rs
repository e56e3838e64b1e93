//! The sync engine: push, pull, conflict resolution and reconciliation.

use crate::capture::ChangeCapture;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::flight::SingleFlight;
use crate::local::LocalStore;
use crate::merge::{MergeRegistry, RecordMerger};
use crate::remote::{PullStream, RemoteAdapter};
use crate::status::{SyncPhase, SyncStatus};
use ledgersync_protocol::{
    ConflictStrategy, EntryStatus, NewEntry, Operation, Payload, PushRequest, QueueEntry,
    RemoteRecord, SyncMetadata, Timestamp, WriteMode,
};
use ledgersync_queue::{CycleRecord, QueueStore};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Counters for one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Entries acknowledged by the remote.
    pub pushed: u64,
    /// Entries marked failed.
    pub failed: u64,
    /// Conflicts detected during push or pull.
    pub conflicts: u64,
    /// Local entries dropped in favor of the remote copy.
    pub superseded: u64,
    /// Remote records written locally.
    pub pulled_applied: u64,
    /// Remote records already applied.
    pub pulled_skipped: u64,
    /// Failed entries returned to pending.
    pub reset: u64,
    /// Synced entries removed by retention.
    pub pruned: u64,
    /// Changes recovered by reconciliation.
    pub recovered: u64,
    /// Journal bytes reclaimed by compaction.
    pub compacted_bytes: u64,
    /// Entry-level and table-level errors that did not stop the cycle.
    pub errors: Vec<String>,
    /// Wall time of the cycle.
    pub duration: Duration,
}

/// Result of [`SyncEngine::sync`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// This call ran one cycle, plus one per coalesced request.
    Completed(Vec<CycleReport>),
    /// A cycle was already running; it will run again when it finishes.
    Coalesced,
}

impl CycleOutcome {
    /// Returns the reports of the cycles this call ran.
    pub fn reports(&self) -> &[CycleReport] {
        match self {
            CycleOutcome::Completed(reports) => reports,
            CycleOutcome::Coalesced => &[],
        }
    }

    /// Returns the report of the last cycle this call ran.
    pub fn last_report(&self) -> Option<&CycleReport> {
        self.reports().last()
    }
}

enum PushResolution {
    Resolved,
    Force {
        operation: Operation,
        payload: Option<Payload>,
    },
}

/// Coordinates queue draining, remote pulls and conflict resolution.
///
/// The engine keeps no sync state between cycles: every cycle re-reads the
/// queue store, so an engine can be dropped and recreated at any time.
pub struct SyncEngine<R: RemoteAdapter, L: LocalStore> {
    config: SyncConfig,
    queue: Arc<QueueStore>,
    remote: R,
    local: L,
    capture: ChangeCapture,
    mergers: RwLock<MergeRegistry>,
    flight: SingleFlight,
    phase: RwLock<SyncPhase>,
    cancelled: AtomicBool,
    /// Outcome of a cycle the queue could not record.
    unrecorded: RwLock<Option<CycleRecord>>,
}

impl<R: RemoteAdapter, L: LocalStore> SyncEngine<R, L> {
    /// Creates an engine and registers the configured tables with the queue.
    pub fn new(config: SyncConfig, queue: Arc<QueueStore>, remote: R, local: L) -> SyncResult<Self> {
        config.validate()?;
        queue.set_max_retries(config.max_retries);
        queue.set_compact_threshold(config.compact_threshold);
        remote.set_timeout(config.request_timeout);
        for (table, strategy) in &config.tables {
            let enabled = queue.metadata(table).map_or(true, |m| m.sync_enabled);
            queue.configure_table(table, *strategy, enabled)?;
        }

        Ok(Self {
            capture: ChangeCapture::new(Arc::clone(&queue)),
            config,
            queue,
            remote,
            local,
            mergers: RwLock::new(MergeRegistry::new()),
            flight: SingleFlight::new(),
            phase: RwLock::new(SyncPhase::Idle),
            cancelled: AtomicBool::new(false),
            unrecorded: RwLock::new(None),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the queue store.
    pub fn queue(&self) -> &Arc<QueueStore> {
        &self.queue
    }

    /// Returns the remote adapter.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Returns the local data layer.
    pub fn local(&self) -> &L {
        &self.local
    }

    /// Returns the change capture hook for the local data layer.
    pub fn capture(&self) -> &ChangeCapture {
        &self.capture
    }

    /// Registers the merge function used by tables with the merge strategy.
    pub fn register_merger(&self, table_name: impl Into<String>, merger: impl RecordMerger + 'static) {
        self.mergers.write().register(table_name, merger);
    }

    /// Enables or disables sync for one table, keeping its strategy.
    pub fn set_table_enabled(&self, table_name: &str, enabled: bool) -> SyncResult<SyncMetadata> {
        let strategy = self.strategy_for(table_name);
        Ok(self.queue.configure_table(table_name, strategy, enabled)?)
    }

    /// Asks the running cycle to stop after its current batch.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clears a previous cancellation.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Returns the phase of the running cycle.
    pub fn phase(&self) -> SyncPhase {
        *self.phase.read()
    }

    /// Computes the current status from the queue store.
    pub fn get_status(&self) -> SyncStatus {
        let persisted = self.queue.last_cycle();
        let unrecorded = self.unrecorded.read().clone();
        let last = match (persisted, unrecorded) {
            (Some(p), Some(u)) if p.finished_at > u.finished_at => Some(p),
            (_, Some(u)) => Some(u),
            (p, None) => p,
        };
        SyncStatus::compute(
            self.queue.counts(),
            last.as_ref(),
            self.queue.last_successful_cycle().as_ref(),
            self.phase(),
            self.config.enabled,
        )
    }

    /// Runs a sync cycle unless one is already running.
    ///
    /// A call that overlaps a running cycle returns
    /// [`CycleOutcome::Coalesced`] and the running call performs exactly one
    /// more cycle when it finishes, however many calls overlapped.
    pub fn sync(&self) -> SyncResult<CycleOutcome> {
        if !self.config.enabled {
            return Err(SyncError::Disabled);
        }
        if !self.flight.try_begin() {
            debug!("Sync already running, coalescing request");
            return Ok(CycleOutcome::Coalesced);
        }

        let mut reports = Vec::new();
        loop {
            match self.run_cycle() {
                Ok(report) => reports.push(report),
                Err(e) => {
                    self.flight.abandon();
                    return Err(e);
                }
            }
            if !self.flight.finish() {
                break;
            }
            debug!("Running coalesced sync request");
        }
        Ok(CycleOutcome::Completed(reports))
    }

    fn run_cycle(&self) -> SyncResult<CycleReport> {
        let started_at = Timestamp::now();
        let start = Instant::now();
        let since = self
            .queue
            .last_successful_cycle()
            .map_or(Timestamp::EPOCH, |c| c.started_at);
        let mut report = CycleReport::default();

        info!("Sync cycle started");
        let result = self.run_phases(&mut report, since);
        self.set_phase(SyncPhase::Idle);
        report.duration = start.elapsed();

        if result.is_err() {
            self.release_stranded();
        }

        let cycle = CycleRecord {
            started_at,
            finished_at: Timestamp::now(),
            success: result.is_ok(),
            error: match &result {
                Ok(()) => report.errors.last().cloned(),
                Err(e) => Some(e.to_string()),
            },
            critical: result.as_ref().err().is_some_and(SyncError::is_critical),
            pushed: report.pushed,
            pulled: report.pulled_applied,
        };
        match self.queue.record_cycle(cycle.clone()) {
            Ok(()) => *self.unrecorded.write() = None,
            Err(e) => {
                error!(error = %e, "Could not record sync cycle");
                let storage_error = e.to_string();
                *self.unrecorded.write() = Some(CycleRecord {
                    success: false,
                    critical: true,
                    error: cycle.error.or(Some(storage_error)),
                    ..cycle
                });
                if result.is_ok() {
                    return Err(e.into());
                }
            }
        }

        match result {
            Ok(()) => {
                info!(
                    pushed = report.pushed,
                    failed = report.failed,
                    conflicts = report.conflicts,
                    pulled = report.pulled_applied,
                    reset = report.reset,
                    duration_ms = report.duration.as_millis() as u64,
                    "Sync cycle finished"
                );
                Ok(report)
            }
            Err(e) => {
                if e.is_critical() {
                    error!(error = %e, "Sync cycle aborted");
                } else {
                    warn!(error = %e, kind = %e.kind(), "Sync cycle aborted");
                }
                Err(e)
            }
        }
    }

    fn run_phases(&self, report: &mut CycleReport, since: Timestamp) -> SyncResult<()> {
        self.check_cancelled()?;
        self.set_phase(SyncPhase::Pushing);
        self.push_phase(report)?;

        self.check_cancelled()?;
        self.set_phase(SyncPhase::Pulling);
        self.pull_phase(report)?;

        self.set_phase(SyncPhase::Reconciling);
        self.reconcile_phase(report, since)
    }

    fn push_phase(&self, report: &mut CycleReport) -> SyncResult<()> {
        loop {
            self.check_cancelled()?;
            let batch = self.queue.next_batch(self.config.batch_size)?;
            if batch.is_empty() {
                return Ok(());
            }
            let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
            self.queue.mark_in_flight(&ids)?;
            debug!(size = batch.len(), "Pushing batch");
            self.push_batch(batch, report)?;
        }
    }

    fn push_batch(&self, batch: Vec<QueueEntry>, report: &mut CycleReport) -> SyncResult<()> {
        let mut forced = Vec::new();

        for entry in batch {
            let request = PushRequest {
                table_name: entry.table_name.clone(),
                record_id: entry.record_id.clone(),
                operation: entry.operation,
                payload: entry.payload.clone(),
                base_version: self
                    .queue
                    .record_version(&entry.key())
                    .map(|v| v.remote_version),
                mode: WriteMode::Checked,
            };

            let outcome = self.remote.push(&request).and_then(|response| {
                if response.accepted {
                    self.queue.complete_push(entry.id, response.version())?;
                    report.pushed += 1;
                    debug!(entry_id = entry.id, table = %entry.table_name, record_id = %entry.record_id, "Entry pushed");
                    return Ok(());
                }
                report.conflicts += 1;
                let current = match response.conflict {
                    Some(current) => Some(current),
                    None => self.remote.version(&entry.table_name, &entry.record_id)?,
                };
                match self.resolve_push_conflict(&entry, current, report)? {
                    PushResolution::Resolved => {}
                    PushResolution::Force { operation, payload } => {
                        forced.push((entry.clone(), operation, payload));
                    }
                }
                Ok(())
            });
            if let Err(e) = outcome {
                self.fail_entry(&entry, e, report)?;
            }
        }

        for (entry, operation, payload) in forced {
            let request = PushRequest {
                table_name: entry.table_name.clone(),
                record_id: entry.record_id.clone(),
                operation,
                payload,
                base_version: None,
                mode: WriteMode::Overwrite,
            };
            let outcome = self.remote.push(&request).and_then(|response| {
                if !response.accepted {
                    return Err(SyncError::Protocol(format!(
                        "overwrite of {} rejected",
                        entry.key()
                    )));
                }
                self.queue.complete_push(entry.id, response.version())?;
                report.pushed += 1;
                debug!(entry_id = entry.id, table = %entry.table_name, record_id = %entry.record_id, "Entry force-pushed");
                Ok(())
            });
            if let Err(e) = outcome {
                self.fail_entry(&entry, e, report)?;
            }
        }
        Ok(())
    }

    fn resolve_push_conflict(
        &self,
        entry: &QueueEntry,
        current: Option<RemoteRecord>,
        report: &mut CycleReport,
    ) -> SyncResult<PushResolution> {
        let force_local = PushResolution::Force {
            operation: entry.operation,
            payload: entry.payload.clone(),
        };
        let Some(current) = current else {
            return Ok(force_local);
        };
        let strategy = self.strategy_for(&entry.table_name);
        info!(
            entry_id = entry.id,
            table = %entry.table_name,
            record_id = %entry.record_id,
            strategy = %strategy,
            remote_version = current.remote_version,
            "Push conflict"
        );

        match strategy {
            ConflictStrategy::LocalFirst => Ok(force_local),
            ConflictStrategy::RemoteFirst => {
                let claimed: Vec<u64> = self
                    .queue
                    .unresolved_for(&entry.key())
                    .iter()
                    .map(|e| e.id)
                    .collect();
                self.accept_remote(&entry.table_name, &current, &claimed, report)?;
                Ok(PushResolution::Resolved)
            }
            ConflictStrategy::Merge => {
                let merged = match (&entry.payload, &current.payload) {
                    (Some(local), Some(remote)) if entry.operation != Operation::Delete => self
                        .mergers
                        .read()
                        .merge(&entry.table_name, local, remote),
                    _ => None,
                };
                match merged {
                    Some(merged) => {
                        self.local.upsert(&entry.table_name, &entry.record_id, &merged)?;
                        Ok(PushResolution::Force {
                            operation: Operation::Update,
                            payload: Some(merged),
                        })
                    }
                    None => {
                        debug!(table = %entry.table_name, record_id = %entry.record_id, "No merge possible, keeping local copy");
                        Ok(force_local)
                    }
                }
            }
        }
    }

    fn fail_entry(&self, entry: &QueueEntry, err: SyncError, report: &mut CycleReport) -> SyncResult<()> {
        if err.is_cycle_fatal() {
            return Err(err);
        }
        let reason = err.to_string();
        self.queue.mark_failed(&[entry.id], &reason)?;
        report.failed += 1;
        warn!(
            entry_id = entry.id,
            table = %entry.table_name,
            record_id = %entry.record_id,
            attempt = entry.retry_count + 1,
            kind = %err.kind(),
            error = %reason,
            "Push failed"
        );
        report.errors.push(format!("{}: {reason}", entry.key()));
        Ok(())
    }

    fn pull_phase(&self, report: &mut CycleReport) -> SyncResult<()> {
        for meta in self.queue.tables() {
            if !meta.sync_enabled {
                continue;
            }
            self.check_cancelled()?;
            if let Err(e) = self.pull_table(&meta, report) {
                if e.is_cycle_fatal() {
                    return Err(e);
                }
                warn!(table = %meta.table_name, kind = %e.kind(), error = %e, "Pull stopped for table");
                report.errors.push(format!("{}: {e}", meta.table_name));
            }
        }
        Ok(())
    }

    fn pull_table(&self, meta: &SyncMetadata, report: &mut CycleReport) -> SyncResult<()> {
        let since = meta.last_pulled_at.unwrap_or(Timestamp::EPOCH);
        let mut high_water: Option<Timestamp> = None;
        let mut tombstones = Vec::new();

        for record in PullStream::new(&self.remote, &meta.table_name, since, self.config.pull_page_size) {
            let record = record?;
            self.apply_pulled(meta, &record, report)?;
            if record.is_tombstone() {
                tombstones.push(record.clone());
            }
            high_water = Some(high_water.map_or(record.remote_updated_at, |h| h.max(record.remote_updated_at)));
        }

        if let Some(at) = high_water {
            if self.queue.advance_pulled_at(&meta.table_name, at)? {
                debug!(table = %meta.table_name, pulled_at = %at, "High-water mark advanced");
            }
            self.forget_tombstones(&meta.table_name, &tombstones, at)?;
        }
        Ok(())
    }

    /// Drops the tracked version of deleted records the next pull window
    /// can no longer return.
    ///
    /// A tombstone at the high-water mark may be pulled again and keeps its
    /// version so it is skipped. Records with local changes keep theirs as
    /// the base of the next push.
    fn forget_tombstones(
        &self,
        table: &str,
        tombstones: &[RemoteRecord],
        high_water: Timestamp,
    ) -> SyncResult<()> {
        let mut forgotten = 0usize;
        for record in tombstones.iter().filter(|r| r.remote_updated_at < high_water) {
            let key = record.key(table);
            let tracked = self.queue.record_version(&key).map(|v| v.remote_version);
            if tracked != Some(record.remote_version) || !self.queue.unresolved_for(&key).is_empty() {
                continue;
            }
            self.queue.forget_record_version(&key)?;
            forgotten += 1;
        }
        if forgotten > 0 {
            debug!(table, count = forgotten, "Forgot versions of deleted records");
        }
        Ok(())
    }

    fn apply_pulled(&self, meta: &SyncMetadata, record: &RemoteRecord, report: &mut CycleReport) -> SyncResult<()> {
        let table = meta.table_name.as_str();
        let key = record.key(table);
        if self
            .queue
            .record_version(&key)
            .is_some_and(|known| known.remote_updated_at >= record.remote_updated_at)
        {
            report.pulled_skipped += 1;
            return Ok(());
        }

        let unresolved = self.queue.unresolved_for(&key);
        if unresolved.is_empty() {
            self.apply_remote(table, record)?;
            self.queue.set_record_version(&key, record.version())?;
            report.pulled_applied += 1;
            return Ok(());
        }

        report.conflicts += 1;
        info!(
            table,
            record_id = %record.record_id,
            strategy = %meta.conflict_resolution,
            pending = unresolved.len(),
            "Pull conflict"
        );
        match meta.conflict_resolution {
            ConflictStrategy::LocalFirst => Ok(()),
            ConflictStrategy::RemoteFirst => {
                let claimed: Vec<u64> = unresolved.iter().map(|e| e.id).collect();
                self.accept_remote(table, record, &claimed, report)?;
                report.pulled_applied += 1;
                Ok(())
            }
            ConflictStrategy::Merge => {
                let local = match self.local.load(table, &record.record_id)? {
                    Some(local) => Some(local),
                    None => unresolved.iter().rev().find_map(|e| e.payload.clone()),
                };
                let deleting = unresolved
                    .last()
                    .is_some_and(|e| e.operation == Operation::Delete);
                let merged = match (&local, &record.payload) {
                    (Some(local), Some(remote)) if !deleting => {
                        self.mergers.read().merge(table, local, remote)
                    }
                    _ => None,
                };
                let Some(merged) = merged else {
                    debug!(table, record_id = %record.record_id, "No merge possible, keeping local copy");
                    return Ok(());
                };

                self.local.upsert(table, &record.record_id, &merged)?;
                let ids: Vec<u64> = unresolved.iter().map(|e| e.id).collect();
                self.queue.supersede(&ids, "merged with remote change")?;
                self.queue.set_record_version(&key, record.version())?;
                self.queue.enqueue(NewEntry::update(table, &record.record_id, merged))?;
                report.superseded += ids.len() as u64;
                report.pulled_applied += 1;
                Ok(())
            }
        }
    }

    /// Overwrites local state with the remote copy and drops the local
    /// changes in `claimed`, which must be read before the overwrite.
    ///
    /// A change recorded while the overwrite ran is not in `claimed`: it
    /// stays pending, and its snapshot is written back so the local store
    /// holds what will be pushed next.
    fn accept_remote(
        &self,
        table: &str,
        record: &RemoteRecord,
        claimed: &[u64],
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        self.apply_remote(table, record)?;
        let key = record.key(table);
        let reason = format!("superseded by remote version {}", record.remote_version);
        self.queue.supersede(claimed, &reason)?;
        self.queue.set_record_version(&key, record.version())?;
        report.superseded += claimed.len() as u64;

        let racing = self
            .queue
            .unresolved_for(&key)
            .into_iter()
            .rev()
            .find(|e| !claimed.contains(&e.id));
        if let Some(latest) = racing {
            debug!(entry_id = latest.id, table, record_id = %record.record_id, "Local change recorded during remote apply, keeping it");
            match (latest.operation, &latest.payload) {
                (Operation::Delete, _) => self.local.delete(table, &record.record_id)?,
                (_, Some(payload)) => self.local.upsert(table, &record.record_id, payload)?,
                (_, None) => {}
            }
        }
        Ok(())
    }

    fn apply_remote(&self, table: &str, record: &RemoteRecord) -> SyncResult<()> {
        match &record.payload {
            Some(payload) => self.local.upsert(table, &record.record_id, payload),
            None => self.local.delete(table, &record.record_id),
        }
    }

    fn reconcile_phase(&self, report: &mut CycleReport, since: Timestamp) -> SyncResult<()> {
        report.reset = self.queue.reset_failed(self.config.max_retries)? as u64;
        let cutoff = Timestamp::now().saturating_sub(self.config.retention);
        report.pruned = self.queue.prune_synced(cutoff)? as u64;

        let tables: Vec<String> = self
            .queue
            .tables()
            .into_iter()
            .map(|m| m.table_name)
            .collect();
        let recovered = self.capture.reconcile(&self.local, &tables, since)?;
        report.recovered = (recovered.replayed + recovered.recovered) as u64;

        if let Some(stats) = self.queue.maybe_compact()? {
            report.compacted_bytes = stats.bytes_before.saturating_sub(stats.bytes_after);
        }
        Ok(())
    }

    fn release_stranded(&self) {
        let stranded: Vec<u64> = self
            .queue
            .entries(Some(EntryStatus::InFlight))
            .iter()
            .map(|e| e.id)
            .collect();
        if stranded.is_empty() {
            return;
        }
        match self.queue.release(&stranded) {
            Ok(()) => debug!(count = stranded.len(), "Released in-flight entries"),
            Err(e) => warn!(count = stranded.len(), error = %e, "In-flight entries stay claimed until restart"),
        }
    }

    fn strategy_for(&self, table_name: &str) -> ConflictStrategy {
        self.queue
            .metadata(table_name)
            .map_or_else(ConflictStrategy::default, |m| m.conflict_resolution)
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.write() = phase;
    }
}

impl<R: RemoteAdapter, L: LocalStore> std::fmt::Debug for SyncEngine<R, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("phase", &self.phase())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
