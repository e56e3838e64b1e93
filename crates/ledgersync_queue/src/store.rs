//! The queue store: journaled, crash-safe bookkeeping for sync.

use crate::backend::{FileJournal, JournalBackend, MemoryJournal};
use crate::error::{QueueError, QueueResult};
use crate::journal::{scan, CycleRecord, JournalRecord};
use crate::state::QueueState;
use ledgersync_protocol::{
    ConflictStrategy, EntryStatus, NewEntry, QueueEntry, RecordKey, RecordVersion, SyncMetadata,
    Timestamp,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Default journal size that triggers automatic compaction.
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1024 * 1024;

/// Options for opening a [`QueueStore`].
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Failed entries with this many attempts are parked for manual review.
    pub max_retries: u32,
    /// Sync the journal after every record.
    pub sync_on_write: bool,
    /// Journal size in bytes past which [`QueueStore::maybe_compact`] rewrites it.
    pub compact_threshold: u64,
}

impl QueueOptions {
    /// Sets the retry cap.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets whether every record is synced to disk.
    pub fn with_sync_on_write(mut self, sync_on_write: bool) -> Self {
        self.sync_on_write = sync_on_write;
        self
    }

    /// Sets the journal size that triggers automatic compaction.
    pub fn with_compact_threshold(mut self, bytes: u64) -> Self {
        self.compact_threshold = bytes;
        self
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            sync_on_write: true,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        }
    }
}

/// Entry counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// Waiting to be pushed.
    pub pending: usize,
    /// Claimed by a running cycle.
    pub in_flight: usize,
    /// Acknowledged or superseded.
    pub synced: usize,
    /// Failed, including parked entries.
    pub failed: usize,
    /// Failed entries that exhausted their retry budget.
    pub parked: usize,
    /// All retained entries.
    pub total: usize,
}

/// Outcome of [`QueueStore::compact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactStats {
    /// Journal size before compaction.
    pub bytes_before: u64,
    /// Journal size after compaction.
    pub bytes_after: u64,
    /// Records in the rewritten journal.
    pub records: usize,
}

struct Inner {
    backend: Box<dyn JournalBackend>,
    state: QueueState,
    options: QueueOptions,
}

impl Inner {
    /// Appends `record` to the journal, then applies it in memory.
    ///
    /// On a failed write the journal is cut back to its previous length and
    /// the in-memory state is left untouched.
    fn commit(&mut self, record: JournalRecord) -> QueueResult<()> {
        let frame = record.encode_frame()?;
        let start = self.backend.len()?;
        let written = self.backend.append(&frame).and_then(|()| {
            if self.options.sync_on_write {
                self.backend.sync()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            if let Err(undo) = self.backend.truncate(start) {
                warn!(error = %undo, offset = start, "Failed to cut back journal after write error");
            }
            return Err(e);
        }
        self.state.apply(&record);
        Ok(())
    }

    fn encode_snapshot(&self) -> QueueResult<(Vec<u8>, usize)> {
        let records = self.state.snapshot();
        let mut bytes = Vec::new();
        for record in &records {
            bytes.extend(record.encode_frame()?);
        }
        Ok((bytes, records.len()))
    }

    fn replace_journal(
        &mut self,
        bytes_before: u64,
        bytes: &[u8],
        records: usize,
    ) -> QueueResult<CompactStats> {
        self.backend.replace(bytes)?;
        let stats = CompactStats {
            bytes_before,
            bytes_after: bytes.len() as u64,
            records,
        };
        info!(
            bytes_before = stats.bytes_before,
            bytes_after = stats.bytes_after,
            "Queue journal compacted"
        );
        Ok(stats)
    }

    fn entry(&self, id: u64) -> QueueResult<&QueueEntry> {
        self.state.entries.get(&id).ok_or(QueueError::NotFound(id))
    }

    /// Checks that every id exists and is in one of `allowed`.
    fn check(&self, ids: &[u64], allowed: &[EntryStatus], to: EntryStatus) -> QueueResult<()> {
        for &id in ids {
            let entry = self.entry(id)?;
            if !allowed.contains(&entry.status) {
                return Err(QueueError::InvalidTransition {
                    id,
                    from: entry.status,
                    to,
                });
            }
        }
        Ok(())
    }
}

/// The durable, ordered record of local mutations awaiting sync.
///
/// All state lives in an append-only journal. Every operation writes one
/// record and applies it under a single lock, so each status transition is
/// atomic with respect to concurrent callers.
///
/// On open, entries found `in_flight` are returned to `pending`: a crash
/// mid-cycle never strands an entry.
///
/// # Example
///
/// ```rust
/// use ledgersync_protocol::NewEntry;
/// use ledgersync_queue::QueueStore;
/// use serde_json::json;
///
/// let queue = QueueStore::in_memory(Default::default()).unwrap();
/// let entry = queue
///     .enqueue(NewEntry::create("contacts", "c1", json!({"name": "Ada"})))
///     .unwrap();
/// assert_eq!(queue.next_batch(10).unwrap()[0].id, entry.id);
/// ```
pub struct QueueStore {
    inner: Mutex<Inner>,
}

impl QueueStore {
    /// Opens a store over `backend`, replaying its journal.
    ///
    /// A torn frame at the end of the journal is cut off.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or is corrupted.
    pub fn open(backend: impl JournalBackend + 'static, options: QueueOptions) -> QueueResult<Self> {
        let mut backend: Box<dyn JournalBackend> = Box::new(backend);
        let bytes = backend.read_all()?;
        let scanned = scan(&bytes)?;
        if scanned.torn_tail {
            warn!(
                valid_len = scanned.valid_len,
                total_len = bytes.len(),
                "Discarding torn journal tail"
            );
            backend.truncate(scanned.valid_len)?;
        }

        let mut state = QueueState::default();
        for (_, record) in &scanned.records {
            state.apply(record);
        }

        let mut inner = Inner {
            backend,
            state,
            options,
        };

        let stranded = inner.state.in_flight_ids();
        if !stranded.is_empty() {
            warn!(count = stranded.len(), "Returning in-flight entries to pending after restart");
            inner.commit(JournalRecord::Released {
                ids: stranded,
                at: Timestamp::now(),
            })?;
        }

        debug!(
            records = scanned.records.len(),
            entries = inner.state.entries.len(),
            "Queue journal replayed"
        );

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Opens a store journaled to a file.
    pub fn open_file(path: impl AsRef<Path>, options: QueueOptions) -> QueueResult<Self> {
        Self::open(FileJournal::open(path)?, options)
    }

    /// Opens an empty store held in memory.
    pub fn in_memory(options: QueueOptions) -> QueueResult<Self> {
        Self::open(MemoryJournal::new(), options)
    }

    /// Returns the retry cap.
    pub fn max_retries(&self) -> u32 {
        self.inner.lock().options.max_retries
    }

    /// Changes the retry cap used to tell parked entries from retryable ones.
    pub fn set_max_retries(&self, max_retries: u32) {
        self.inner.lock().options.max_retries = max_retries;
    }

    /// Changes the journal size that triggers automatic compaction.
    pub fn set_compact_threshold(&self, bytes: u64) {
        self.inner.lock().options.compact_threshold = bytes;
    }

    /// Appends a pending entry stamped with the current time.
    ///
    /// Never rejects an entry on its payload; fails only when the journal
    /// cannot be written.
    pub fn enqueue(&self, change: NewEntry) -> QueueResult<QueueEntry> {
        let mut inner = self.inner.lock();
        let now = Timestamp::now();
        let entry = QueueEntry {
            id: inner.state.next_id,
            table_name: change.table_name,
            record_id: change.record_id,
            operation: change.operation,
            payload: change.payload,
            status: EntryStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            synced_at: None,
        };
        inner.commit(JournalRecord::Enqueued {
            entry: entry.clone(),
        })?;
        debug!(
            entry_id = entry.id,
            table = %entry.table_name,
            record_id = %entry.record_id,
            operation = %entry.operation,
            "Enqueued change"
        );
        Ok(entry)
    }

    /// Returns up to `limit` pushable entries in creation order.
    ///
    /// An entry is pushable when it is pending, its table is enabled, and no
    /// earlier entry for the same record is still unresolved (pending, in
    /// flight, or failed under the retry cap). Blocked entries become
    /// pushable once their predecessors sync or are parked.
    pub fn next_batch(&self, limit: usize) -> QueueResult<Vec<QueueEntry>> {
        let inner = self.inner.lock();
        let cap = inner.options.max_retries;
        let mut blocked: HashSet<(&str, &str)> = HashSet::new();
        let mut batch = Vec::new();

        for entry in inner.state.entries.values() {
            if batch.len() >= limit {
                break;
            }
            if !entry.is_unresolved(cap) {
                continue;
            }
            if !blocked.insert((entry.table_name.as_str(), entry.record_id.as_str())) {
                continue;
            }
            let enabled = inner
                .state
                .tables
                .get(&entry.table_name)
                .map_or(true, |m| m.sync_enabled);
            if entry.status == EntryStatus::Pending && enabled {
                batch.push(entry.clone());
            }
        }

        Ok(batch)
    }

    /// Claims pending entries for the running cycle.
    pub fn mark_in_flight(&self, ids: &[u64]) -> QueueResult<()> {
        self.transition(ids, &[EntryStatus::Pending], EntryStatus::InFlight, |ids, at| {
            JournalRecord::InFlight { ids, at }
        })
    }

    /// Marks entries as acknowledged.
    pub fn mark_synced(&self, ids: &[u64]) -> QueueResult<()> {
        self.transition(
            ids,
            &[EntryStatus::Pending, EntryStatus::InFlight],
            EntryStatus::Synced,
            |ids, at| JournalRecord::Synced { ids, at },
        )
    }

    /// Marks one entry acknowledged and records the remote version it produced.
    pub fn complete_push(&self, id: u64, version: RecordVersion) -> QueueResult<()> {
        let mut inner = self.inner.lock();
        inner.check(
            &[id],
            &[EntryStatus::Pending, EntryStatus::InFlight],
            EntryStatus::Synced,
        )?;
        inner.commit(JournalRecord::PushCompleted {
            id,
            version,
            at: Timestamp::now(),
        })
    }

    /// Marks entries failed, incrementing their retry count.
    pub fn mark_failed(&self, ids: &[u64], reason: &str) -> QueueResult<()> {
        let reason = reason.to_string();
        self.transition(
            ids,
            &[EntryStatus::Pending, EntryStatus::InFlight],
            EntryStatus::Failed,
            move |ids, at| JournalRecord::Failed { ids, reason, at },
        )
    }

    /// Returns in-flight entries to pending without spending retry budget.
    pub fn release(&self, ids: &[u64]) -> QueueResult<()> {
        self.transition(ids, &[EntryStatus::InFlight], EntryStatus::Pending, |ids, at| {
            JournalRecord::Released { ids, at }
        })
    }

    /// Marks entries synced without pushing them, keeping `reason` as audit.
    pub fn supersede(&self, ids: &[u64], reason: &str) -> QueueResult<()> {
        let reason = reason.to_string();
        self.transition(
            ids,
            &[EntryStatus::Pending, EntryStatus::InFlight, EntryStatus::Failed],
            EntryStatus::Synced,
            move |ids, at| JournalRecord::Superseded { ids, reason, at },
        )
    }

    /// Moves failed entries with `retry_count < max_retries` back to pending.
    ///
    /// Entries at or above the cap stay failed. Returns the number reset.
    pub fn reset_failed(&self, max_retries: u32) -> QueueResult<usize> {
        let mut inner = self.inner.lock();
        let ids: Vec<u64> = inner
            .state
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Failed && e.retry_count < max_retries)
            .map(|e| e.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len();
        inner.commit(JournalRecord::Reset {
            ids,
            at: Timestamp::now(),
        })?;
        Ok(count)
    }

    /// Re-arms a failed entry for another round of attempts.
    pub fn retry_entry(&self, id: u64) -> QueueResult<QueueEntry> {
        let mut inner = self.inner.lock();
        inner.check(&[id], &[EntryStatus::Failed], EntryStatus::Pending)?;
        inner.commit(JournalRecord::Retried {
            id,
            at: Timestamp::now(),
        })?;
        info!(entry_id = id, "Failed entry re-armed for retry");
        inner.entry(id).cloned()
    }

    /// Deletes synced entries that reached `synced` before `older_than`.
    ///
    /// Returns the number of entries removed.
    pub fn prune_synced(&self, older_than: Timestamp) -> QueueResult<usize> {
        let mut inner = self.inner.lock();
        let ids: Vec<u64> = inner
            .state
            .entries
            .values()
            .filter(|e| {
                e.status == EntryStatus::Synced && e.synced_at.unwrap_or(e.updated_at) < older_than
            })
            .map(|e| e.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len();
        inner.commit(JournalRecord::Pruned { ids })?;
        debug!(count, "Pruned synced entries");
        Ok(count)
    }

    /// Returns one entry.
    pub fn get(&self, id: u64) -> Option<QueueEntry> {
        self.inner.lock().state.entries.get(&id).cloned()
    }

    /// Returns all entries, optionally filtered by status, in creation order.
    pub fn entries(&self, status: Option<EntryStatus>) -> Vec<QueueEntry> {
        self.inner
            .lock()
            .state
            .entries
            .values()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect()
    }

    /// Returns every retained entry for `key` in creation order.
    pub fn entries_for(&self, key: &RecordKey) -> Vec<QueueEntry> {
        self.inner
            .lock()
            .state
            .entries
            .values()
            .filter(|e| e.is_for(key))
            .cloned()
            .collect()
    }

    /// Returns entries for `key` that have not yet reached the remote.
    pub fn unresolved_for(&self, key: &RecordKey) -> Vec<QueueEntry> {
        let inner = self.inner.lock();
        let cap = inner.options.max_retries;
        inner
            .state
            .entries
            .values()
            .filter(|e| e.is_for(key) && e.is_unresolved(cap))
            .cloned()
            .collect()
    }

    /// Returns failed entries that exhausted the retry cap.
    pub fn parked_entries(&self) -> Vec<QueueEntry> {
        let inner = self.inner.lock();
        let cap = inner.options.max_retries;
        inner
            .state
            .entries
            .values()
            .filter(|e| e.is_parked(cap))
            .cloned()
            .collect()
    }

    /// Returns entry counts by status.
    pub fn counts(&self) -> QueueCounts {
        let inner = self.inner.lock();
        let cap = inner.options.max_retries;
        let mut counts = QueueCounts::default();
        for entry in inner.state.entries.values() {
            counts.total += 1;
            match entry.status {
                EntryStatus::Pending => counts.pending += 1,
                EntryStatus::InFlight => counts.in_flight += 1,
                EntryStatus::Synced => counts.synced += 1,
                EntryStatus::Failed => {
                    counts.failed += 1;
                    if entry.retry_count >= cap {
                        counts.parked += 1;
                    }
                }
            }
        }
        counts
    }

    /// Creates or updates a table's sync settings.
    ///
    /// Writes nothing when the settings are unchanged.
    pub fn configure_table(
        &self,
        table_name: &str,
        conflict_resolution: ConflictStrategy,
        sync_enabled: bool,
    ) -> QueueResult<SyncMetadata> {
        let mut inner = self.inner.lock();
        let unchanged = inner.state.tables.get(table_name).is_some_and(|m| {
            m.conflict_resolution == conflict_resolution && m.sync_enabled == sync_enabled
        });
        if !unchanged {
            inner.commit(JournalRecord::TableConfigured {
                table_name: table_name.to_string(),
                conflict_resolution,
                sync_enabled,
            })?;
            info!(table = table_name, strategy = %conflict_resolution, sync_enabled, "Table configured");
        }
        inner
            .state
            .tables
            .get(table_name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownTable(table_name.to_string()))
    }

    /// Returns a table's metadata.
    pub fn metadata(&self, table_name: &str) -> Option<SyncMetadata> {
        self.inner.lock().state.tables.get(table_name).cloned()
    }

    /// Returns metadata of every configured table, by name.
    pub fn tables(&self) -> Vec<SyncMetadata> {
        self.inner.lock().state.tables.values().cloned().collect()
    }

    /// Moves a table's pull high-water mark forward to `at`.
    ///
    /// Returns `false` without writing when `at` is not past the current mark.
    pub fn advance_pulled_at(&self, table_name: &str, at: Timestamp) -> QueueResult<bool> {
        let mut inner = self.inner.lock();
        let current = inner
            .state
            .tables
            .get(table_name)
            .ok_or_else(|| QueueError::UnknownTable(table_name.to_string()))?
            .last_pulled_at;
        if current.is_some_and(|c| c >= at) {
            return Ok(false);
        }
        inner.commit(JournalRecord::PulledUpTo {
            table_name: table_name.to_string(),
            at,
        })?;
        Ok(true)
    }

    /// Returns the last observed remote version of a record.
    pub fn record_version(&self, key: &RecordKey) -> Option<RecordVersion> {
        self.inner.lock().state.versions.get(key).copied()
    }

    /// Records the remote version of a record.
    pub fn set_record_version(&self, key: &RecordKey, version: RecordVersion) -> QueueResult<()> {
        let mut inner = self.inner.lock();
        if inner.state.versions.get(key) == Some(&version) {
            return Ok(());
        }
        inner.commit(JournalRecord::VersionObserved {
            key: key.clone(),
            version,
        })
    }

    /// Stops tracking the remote version of a record.
    ///
    /// Used once a remote delete has been applied, so the version map only
    /// holds records that still exist.
    pub fn forget_record_version(&self, key: &RecordKey) -> QueueResult<()> {
        let mut inner = self.inner.lock();
        if !inner.state.versions.contains_key(key) {
            return Ok(());
        }
        inner.commit(JournalRecord::VersionForgotten { key: key.clone() })
    }

    /// Records the outcome of a sync cycle.
    pub fn record_cycle(&self, cycle: CycleRecord) -> QueueResult<()> {
        self.inner
            .lock()
            .commit(JournalRecord::CycleFinished { cycle })
    }

    /// Returns the most recent cycle outcome.
    pub fn last_cycle(&self) -> Option<CycleRecord> {
        self.inner.lock().state.last_cycle.clone()
    }

    /// Returns the most recent successful cycle.
    pub fn last_successful_cycle(&self) -> Option<CycleRecord> {
        self.inner.lock().state.last_success.clone()
    }

    /// Returns the journal size in bytes.
    pub fn journal_len(&self) -> QueueResult<u64> {
        self.inner.lock().backend.len()
    }

    /// Rewrites the journal as a snapshot of the current state.
    pub fn compact(&self) -> QueueResult<CompactStats> {
        let mut inner = self.inner.lock();
        let bytes_before = inner.backend.len()?;
        let (bytes, records) = inner.encode_snapshot()?;
        inner.replace_journal(bytes_before, &bytes, records)
    }

    /// Compacts the journal once it outgrows the configured threshold.
    ///
    /// Skips the rewrite when the snapshot would reclaim less than half the
    /// journal, so a large live state is not rewritten on every call.
    pub fn maybe_compact(&self) -> QueueResult<Option<CompactStats>> {
        let mut inner = self.inner.lock();
        let bytes_before = inner.backend.len()?;
        if bytes_before < inner.options.compact_threshold {
            return Ok(None);
        }
        let (bytes, records) = inner.encode_snapshot()?;
        if (bytes.len() as u64).saturating_mul(2) > bytes_before {
            debug!(
                journal_len = bytes_before,
                snapshot_len = bytes.len(),
                "Journal over threshold but mostly live, not compacting"
            );
            return Ok(None);
        }
        inner.replace_journal(bytes_before, &bytes, records).map(Some)
    }

    fn transition(
        &self,
        ids: &[u64],
        allowed: &[EntryStatus],
        to: EntryStatus,
        record: impl FnOnce(Vec<u64>, Timestamp) -> JournalRecord,
    ) -> QueueResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        inner.check(ids, allowed, to)?;
        let mut unique = ids.to_vec();
        unique.sort_unstable();
        unique.dedup();
        inner.commit(record(unique, Timestamp::now()))
    }
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts = self.counts();
        f.debug_struct("QueueStore").field("counts", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> QueueStore {
        QueueStore::in_memory(QueueOptions::default().with_max_retries(3)).unwrap()
    }

    fn ids(entries: &[QueueEntry]) -> Vec<u64> {
        entries.iter().map(|e| e.id).collect()
    }

    #[test]
    fn enqueue_assigns_monotonic_ids() {
        let q = store();
        let a = q.enqueue(NewEntry::create("contacts", "c1", json!({}))).unwrap();
        let b = q.enqueue(NewEntry::create("contacts", "c2", json!({}))).unwrap();
        assert!(b.id > a.id);
        assert!(b.created_at >= a.created_at);
        assert_eq!(a.status, EntryStatus::Pending);
        assert_eq!(a.retry_count, 0);
    }

    #[test]
    fn later_entry_waits_for_earlier_one() {
        let q = store();
        let create = q.enqueue(NewEntry::create("contacts", "c1", json!({"v": 1}))).unwrap();
        let update = q.enqueue(NewEntry::update("contacts", "c1", json!({"v": 2}))).unwrap();
        let other = q.enqueue(NewEntry::create("contacts", "c2", json!({}))).unwrap();

        assert_eq!(ids(&q.next_batch(10).unwrap()), vec![create.id, other.id]);

        q.mark_in_flight(&[create.id]).unwrap();
        assert_eq!(ids(&q.next_batch(10).unwrap()), vec![other.id]);

        q.mark_synced(&[create.id]).unwrap();
        assert_eq!(ids(&q.next_batch(10).unwrap()), vec![update.id, other.id]);
    }

    #[test]
    fn failed_predecessor_blocks_until_parked() {
        let q = store();
        let first = q.enqueue(NewEntry::create("contacts", "c1", json!({}))).unwrap();
        let second = q.enqueue(NewEntry::update("contacts", "c1", json!({}))).unwrap();

        for attempt in 1..=3 {
            q.mark_failed(&[first.id], "rejected").unwrap();
            let batch = q.next_batch(10).unwrap();
            if attempt < 3 {
                assert!(batch.is_empty(), "blocked on attempt {attempt}");
                q.reset_failed(3).unwrap();
            } else {
                assert_eq!(ids(&batch), vec![second.id]);
            }
        }
        assert!(q.get(first.id).unwrap().is_parked(3));
    }

    #[test]
    fn limit_is_respected() {
        let q = store();
        for i in 0..5 {
            q.enqueue(NewEntry::create("contacts", format!("c{i}"), json!({})))
                .unwrap();
        }
        assert_eq!(q.next_batch(2).unwrap().len(), 2);
    }

    #[test]
    fn disabled_table_is_skipped() {
        let q = store();
        q.configure_table("invoices", ConflictStrategy::Merge, false)
            .unwrap();
        q.enqueue(NewEntry::create("invoices", "i1", json!({}))).unwrap();
        let c = q.enqueue(NewEntry::create("contacts", "c1", json!({}))).unwrap();
        assert_eq!(ids(&q.next_batch(10).unwrap()), vec![c.id]);
    }

    #[test]
    fn reset_failed_respects_cap() {
        let q = QueueStore::in_memory(QueueOptions::default().with_max_retries(5)).unwrap();
        let e = q.enqueue(NewEntry::update("contacts", "c1", json!({}))).unwrap();
        for _ in 0..3 {
            q.mark_failed(&[e.id], "network unreachable").unwrap();
            q.reset_failed(5).unwrap();
        }
        let e = q.get(e.id).unwrap();
        assert_eq!(e.status, EntryStatus::Pending);
        assert_eq!(e.retry_count, 3);
        assert_eq!(e.last_error.as_deref(), Some("network unreachable"));
    }

    #[test]
    fn capped_entry_stays_failed() {
        let q = QueueStore::in_memory(QueueOptions::default().with_max_retries(2)).unwrap();
        let e = q.enqueue(NewEntry::update("contacts", "c1", json!({}))).unwrap();
        q.mark_failed(&[e.id], "validation").unwrap();
        assert_eq!(q.reset_failed(2).unwrap(), 1);
        q.mark_failed(&[e.id], "validation").unwrap();
        assert_eq!(q.reset_failed(2).unwrap(), 0);

        assert_eq!(q.get(e.id).unwrap().status, EntryStatus::Failed);
        assert!(q.next_batch(10).unwrap().is_empty());
        assert_eq!(ids(&q.parked_entries()), vec![e.id]);
        assert_eq!(q.counts().parked, 1);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let q = store();
        let e = q.enqueue(NewEntry::delete("contacts", "c1")).unwrap();
        q.mark_synced(&[e.id]).unwrap();
        assert!(matches!(
            q.mark_in_flight(&[e.id]),
            Err(QueueError::InvalidTransition { .. })
        ));
        assert!(matches!(q.release(&[e.id]), Err(QueueError::InvalidTransition { .. })));
        assert!(matches!(q.mark_failed(&[99], "x"), Err(QueueError::NotFound(99))));
    }

    #[test]
    fn release_keeps_retry_budget() {
        let q = store();
        let e = q.enqueue(NewEntry::create("contacts", "c1", json!({}))).unwrap();
        q.mark_in_flight(&[e.id]).unwrap();
        q.release(&[e.id]).unwrap();
        let e = q.get(e.id).unwrap();
        assert_eq!(e.status, EntryStatus::Pending);
        assert_eq!(e.retry_count, 0);
    }

    #[test]
    fn retry_entry_clears_budget() {
        let q = QueueStore::in_memory(QueueOptions::default().with_max_retries(1)).unwrap();
        let e = q.enqueue(NewEntry::create("contacts", "c1", json!({}))).unwrap();
        q.mark_failed(&[e.id], "rejected").unwrap();
        assert!(q.next_batch(10).unwrap().is_empty());

        let e = q.retry_entry(e.id).unwrap();
        assert_eq!(e.status, EntryStatus::Pending);
        assert_eq!(e.retry_count, 0);
        assert_eq!(q.next_batch(10).unwrap().len(), 1);
    }

    #[test]
    fn prune_removes_only_old_synced() {
        let q = store();
        let a = q.enqueue(NewEntry::create("contacts", "c1", json!({}))).unwrap();
        let b = q.enqueue(NewEntry::create("contacts", "c2", json!({}))).unwrap();
        q.mark_synced(&[a.id]).unwrap();

        assert_eq!(q.prune_synced(Timestamp::EPOCH).unwrap(), 0);
        let future = Timestamp::now().saturating_add(std::time::Duration::from_secs(1));
        assert_eq!(q.prune_synced(future).unwrap(), 1);
        assert!(q.get(a.id).is_none());
        assert!(q.get(b.id).is_some());
    }

    #[test]
    fn supersede_marks_synced_with_reason() {
        let q = store();
        let e = q.enqueue(NewEntry::update("contacts", "c1", json!({}))).unwrap();
        q.supersede(&[e.id], "superseded by remote change").unwrap();
        let e = q.get(e.id).unwrap();
        assert_eq!(e.status, EntryStatus::Synced);
        assert!(e.synced_at.is_some());
        assert!(q.unresolved_for(&e.key()).is_empty());
    }

    #[test]
    fn complete_push_records_version() {
        let q = store();
        q.configure_table("contacts", ConflictStrategy::LocalFirst, true)
            .unwrap();
        let e = q.enqueue(NewEntry::create("contacts", "c1", json!({}))).unwrap();
        q.mark_in_flight(&[e.id]).unwrap();
        let version = RecordVersion {
            remote_version: 1,
            remote_updated_at: Timestamp::from_millis(77),
        };
        q.complete_push(e.id, version).unwrap();

        assert_eq!(q.record_version(&e.key()), Some(version));
        assert_eq!(q.get(e.id).unwrap().status, EntryStatus::Synced);
        assert!(q.metadata("contacts").unwrap().last_pushed_at.is_some());
    }

    #[test]
    fn high_water_mark_only_advances() {
        let q = store();
        assert!(matches!(
            q.advance_pulled_at("contacts", Timestamp::from_millis(1)),
            Err(QueueError::UnknownTable(_))
        ));
        q.configure_table("contacts", ConflictStrategy::RemoteFirst, true)
            .unwrap();
        assert!(q.advance_pulled_at("contacts", Timestamp::from_millis(10)).unwrap());
        assert!(!q.advance_pulled_at("contacts", Timestamp::from_millis(5)).unwrap());
        assert!(!q.advance_pulled_at("contacts", Timestamp::from_millis(10)).unwrap());
        assert_eq!(
            q.metadata("contacts").unwrap().last_pulled_at,
            Some(Timestamp::from_millis(10))
        );
    }

    #[test]
    fn configure_table_is_idempotent() {
        let q = store();
        q.configure_table("contacts", ConflictStrategy::Merge, true)
            .unwrap();
        let len = q.journal_len().unwrap();
        q.configure_table("contacts", ConflictStrategy::Merge, true)
            .unwrap();
        assert_eq!(q.journal_len().unwrap(), len);
    }

    #[test]
    fn forgotten_version_survives_reopen() {
        let journal = MemoryJournal::new();
        let q = QueueStore::open(journal.clone(), QueueOptions::default()).unwrap();
        let key = RecordKey::new("contacts", "c1");
        let version = RecordVersion {
            remote_version: 4,
            remote_updated_at: Timestamp::from_millis(40),
        };
        q.set_record_version(&key, version).unwrap();
        q.forget_record_version(&key).unwrap();
        assert_eq!(q.record_version(&key), None);

        let len = journal.data().len();
        q.forget_record_version(&key).unwrap();
        assert_eq!(journal.data().len(), len);

        drop(q);
        let q = QueueStore::open(journal, QueueOptions::default()).unwrap();
        assert_eq!(q.record_version(&key), None);
    }

    #[test]
    fn maybe_compact_waits_for_threshold() {
        let journal = MemoryJournal::new();
        let options = QueueOptions::default().with_compact_threshold(4096);
        let q = QueueStore::open(journal.clone(), options).unwrap();
        let e = q.enqueue(NewEntry::create("contacts", "c1", json!({}))).unwrap();
        assert!(q.maybe_compact().unwrap().is_none());

        while q.journal_len().unwrap() < 4096 {
            q.mark_in_flight(&[e.id]).unwrap();
            q.release(&[e.id]).unwrap();
        }
        let stats = q.maybe_compact().unwrap().expect("journal over threshold");
        assert!(stats.bytes_after < stats.bytes_before);
        assert_eq!(journal.data().len() as u64, stats.bytes_after);
        assert_eq!(q.get(e.id).unwrap().status, EntryStatus::Pending);
    }

    #[test]
    fn maybe_compact_skips_mostly_live_journal() {
        let options = QueueOptions::default().with_compact_threshold(1);
        let q = QueueStore::in_memory(options).unwrap();
        for i in 0..20 {
            q.enqueue(NewEntry::create("contacts", format!("c{i}"), json!({"n": i})))
                .unwrap();
        }
        assert!(q.maybe_compact().unwrap().is_none());
    }

    #[test]
    fn failed_write_leaves_state_untouched() {
        let journal = MemoryJournal::new();
        let q = QueueStore::open(journal.clone(), QueueOptions::default()).unwrap();
        q.enqueue(NewEntry::create("contacts", "c1", json!({}))).unwrap();
        let len = journal.data().len();

        journal.set_fail_writes(true);
        assert!(q.enqueue(NewEntry::create("contacts", "c2", json!({}))).is_err());
        assert_eq!(q.counts().total, 1);
        assert_eq!(journal.data().len(), len);
    }
}
