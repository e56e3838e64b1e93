//! Change capture: the entry point the local data layer calls after every
//! committed write.

use crate::error::{CaptureError, SyncResult};
use crate::local::LocalStore;
use ledgersync_protocol::{NewEntry, Operation, Payload, QueueEntry, RecordKey, Timestamp};
use ledgersync_queue::{QueueError, QueueStore};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a reconciliation pass recovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Backlogged changes that were finally queued.
    pub replayed: usize,
    /// Local modifications found with no covering queue entry.
    pub recovered: usize,
}

/// Translates local mutations into queue entries.
///
/// Changes that cannot be queued are reported to the caller and held in a
/// backlog; later changes queue behind the backlog so per-record order is
/// kept. [`reconcile`](Self::reconcile) drains the backlog and also diffs
/// local records against queue coverage.
pub struct ChangeCapture {
    queue: Arc<QueueStore>,
    backlog: Mutex<VecDeque<NewEntry>>,
}

impl ChangeCapture {
    /// Creates a capture hook over `queue`.
    pub fn new(queue: Arc<QueueStore>) -> Self {
        Self {
            queue,
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    /// Records a committed local write.
    ///
    /// `snapshot` is the record's field set after the write; it is ignored
    /// for deletes.
    pub fn record_change(
        &self,
        table_name: &str,
        record_id: &str,
        operation: Operation,
        snapshot: Option<Payload>,
    ) -> Result<QueueEntry, CaptureError> {
        if table_name.is_empty() {
            return Err(CaptureError::InvalidChange("empty table name".into()));
        }
        if record_id.is_empty() {
            return Err(CaptureError::InvalidChange(format!(
                "empty record id for table '{table_name}'"
            )));
        }

        let change = NewEntry::new(table_name, record_id, operation, snapshot);
        let mut backlog = self.backlog.lock();
        let result = drain(&self.queue, &mut backlog).and_then(|_| self.queue.enqueue(change.clone()));
        match result {
            Ok(entry) => Ok(entry),
            Err(source) => {
                backlog.push_back(change);
                warn!(
                    table = table_name,
                    record_id,
                    backlog = backlog.len(),
                    error = %source,
                    "Change not queued, held for reconciliation"
                );
                Err(CaptureError::Enqueue {
                    table: table_name.to_string(),
                    record_id: record_id.to_string(),
                    backlog: backlog.len(),
                    source,
                })
            }
        }
    }

    /// Returns the number of changes waiting to be queued.
    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }

    /// Queues backlogged changes, then enqueues an update for every local
    /// record modified at or after `since` that no queue entry covers.
    pub fn reconcile<L: LocalStore + ?Sized>(
        &self,
        local: &L,
        tables: &[String],
        since: Timestamp,
    ) -> SyncResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        {
            let mut backlog = self.backlog.lock();
            report.replayed = drain(&self.queue, &mut backlog)?;
        }

        for table in tables {
            for record in local.modified_since(table, since)? {
                let key = RecordKey::new(table, &record.record_id);
                let covered = self
                    .queue
                    .entries_for(&key)
                    .iter()
                    .any(|e| e.created_at >= record.modified_at);
                if covered {
                    continue;
                }
                let entry = self
                    .queue
                    .enqueue(NewEntry::update(table, &record.record_id, record.payload))?;
                debug!(entry_id = entry.id, table = %table, record_id = %entry.record_id, "Recovered uncaptured change");
                report.recovered += 1;
            }
        }

        if report.replayed + report.recovered > 0 {
            info!(
                replayed = report.replayed,
                recovered = report.recovered,
                "Reconciled local changes with queue"
            );
        }
        Ok(report)
    }
}

fn drain(queue: &QueueStore, backlog: &mut VecDeque<NewEntry>) -> Result<usize, QueueError> {
    let mut count = 0;
    while let Some(change) = backlog.front() {
        queue.enqueue(change.clone())?;
        backlog.pop_front();
        count += 1;
    }
    Ok(count)
}

impl std::fmt::Debug for ChangeCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeCapture")
            .field("backlog", &self.backlog_len())
            .finish_non_exhaustive()
    }
}
