//! Persisted sync state: queue entries and per-table metadata.

use crate::time::Timestamp;
use crate::types::{ConflictStrategy, EntryStatus, Operation};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A field snapshot of a local record, as handed over by the data layer.
pub type Payload = serde_json::Value;

/// Identifies one record within one table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Logical entity type.
    pub table_name: String,
    /// Record identifier in string form.
    pub record_id: String,
}

impl RecordKey {
    /// Creates a new record key.
    pub fn new(table_name: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table_name, self.record_id)
    }
}

/// A change to be recorded in the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    /// Logical entity type.
    pub table_name: String,
    /// Affected record.
    pub record_id: String,
    /// Kind of mutation.
    pub operation: Operation,
    /// Field snapshot; ignored for deletes.
    pub payload: Option<Payload>,
}

impl NewEntry {
    /// Creates a new change description.
    ///
    /// Delete snapshots are dropped so the queue never stores a payload for
    /// a delete.
    pub fn new(
        table_name: impl Into<String>,
        record_id: impl Into<String>,
        operation: Operation,
        payload: Option<Payload>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            record_id: record_id.into(),
            operation,
            payload: if operation.carries_payload() {
                payload
            } else {
                None
            },
        }
    }

    /// A create with the given snapshot.
    pub fn create(table: impl Into<String>, id: impl Into<String>, payload: Payload) -> Self {
        Self::new(table, id, Operation::Create, Some(payload))
    }

    /// An update with the given snapshot.
    pub fn update(table: impl Into<String>, id: impl Into<String>, payload: Payload) -> Self {
        Self::new(table, id, Operation::Update, Some(payload))
    }

    /// A delete.
    pub fn delete(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(table, id, Operation::Delete, None)
    }
}

/// One queued local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Monotonic identifier; creation order is apply order.
    pub id: u64,
    /// Logical entity type.
    pub table_name: String,
    /// Affected record.
    pub record_id: String,
    /// Kind of mutation.
    pub operation: Operation,
    /// Snapshot at enqueue time; `None` for deletes.
    pub payload: Option<Payload>,
    /// Lifecycle state.
    pub status: EntryStatus,
    /// Number of failed push attempts.
    pub retry_count: u32,
    /// Reason for the most recent failure.
    pub last_error: Option<String>,
    /// When the entry was enqueued.
    pub created_at: Timestamp,
    /// When the entry last changed state.
    pub updated_at: Timestamp,
    /// When the entry reached `synced`.
    pub synced_at: Option<Timestamp>,
}

impl QueueEntry {
    /// Returns the record this entry applies to.
    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.table_name, &self.record_id)
    }

    /// Returns true if this entry targets `key`.
    #[must_use]
    pub fn is_for(&self, key: &RecordKey) -> bool {
        self.table_name == key.table_name && self.record_id == key.record_id
    }

    /// Returns true if the entry failed and has exhausted its retry budget.
    ///
    /// Parked entries are never reset automatically.
    #[must_use]
    pub fn is_parked(&self, max_retries: u32) -> bool {
        self.status == EntryStatus::Failed && self.retry_count >= max_retries
    }

    /// Returns true if the entry still has to reach the remote.
    ///
    /// Pending and in-flight entries are unresolved, as are failed entries
    /// that will be retried.
    #[must_use]
    pub fn is_unresolved(&self, max_retries: u32) -> bool {
        match self.status {
            EntryStatus::Pending | EntryStatus::InFlight => true,
            EntryStatus::Failed => self.retry_count < max_retries,
            EntryStatus::Synced => false,
        }
    }
}

/// Per-table sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Logical entity type.
    pub table_name: String,
    /// High-water mark for incremental pulls.
    pub last_pulled_at: Option<Timestamp>,
    /// Last time an entry of this table was acknowledged by the remote.
    pub last_pushed_at: Option<Timestamp>,
    /// How conflicts on this table are resolved.
    pub conflict_resolution: ConflictStrategy,
    /// Disabled tables are neither pushed nor pulled.
    pub sync_enabled: bool,
}

impl SyncMetadata {
    /// Creates metadata for a table that has never been pulled.
    pub fn new(table_name: impl Into<String>, conflict_resolution: ConflictStrategy) -> Self {
        Self {
            table_name: table_name.into(),
            last_pulled_at: None,
            last_pushed_at: None,
            conflict_resolution,
            sync_enabled: true,
        }
    }

    /// Returns the most recent push or pull activity.
    #[must_use]
    pub fn last_synced_at(&self) -> Option<Timestamp> {
        self.last_pulled_at.max(self.last_pushed_at)
    }
}

/// The remote version of a record as last observed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordVersion {
    /// Remote optimistic-concurrency version.
    pub remote_version: u64,
    /// Remote modification time.
    pub remote_updated_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(status: EntryStatus, retry_count: u32) -> QueueEntry {
        QueueEntry {
            id: 1,
            table_name: "contacts".into(),
            record_id: "c1".into(),
            operation: Operation::Update,
            payload: Some(json!({"name": "Ada"})),
            status,
            retry_count,
            last_error: None,
            created_at: Timestamp::from_millis(1),
            updated_at: Timestamp::from_millis(1),
            synced_at: None,
        }
    }

    #[test]
    fn new_delete_drops_snapshot() {
        let e = NewEntry::new("contacts", "c1", Operation::Delete, Some(json!({"x": 1})));
        assert!(e.payload.is_none());
    }

    #[test]
    fn parked_and_unresolved() {
        assert!(entry(EntryStatus::Pending, 0).is_unresolved(3));
        assert!(entry(EntryStatus::InFlight, 0).is_unresolved(3));
        assert!(entry(EntryStatus::Failed, 2).is_unresolved(3));
        assert!(!entry(EntryStatus::Failed, 3).is_unresolved(3));
        assert!(entry(EntryStatus::Failed, 3).is_parked(3));
        assert!(!entry(EntryStatus::Synced, 9).is_unresolved(3));
        assert!(!entry(EntryStatus::Pending, 9).is_parked(3));
    }

    #[test]
    fn last_synced_is_latest_activity() {
        let mut meta = SyncMetadata::new("contacts", ConflictStrategy::Merge);
        assert_eq!(meta.last_synced_at(), None);
        meta.last_pulled_at = Some(Timestamp::from_millis(10));
        meta.last_pushed_at = Some(Timestamp::from_millis(7));
        assert_eq!(meta.last_synced_at(), Some(Timestamp::from_millis(10)));
    }
}
