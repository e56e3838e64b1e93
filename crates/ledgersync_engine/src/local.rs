//! The local data layer as seen by the sync engine.

use crate::error::{SyncError, SyncResult};
use ledgersync_protocol::{Payload, RecordKey, Timestamp};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};

/// A locally modified record reported by [`LocalStore::modified_since`].
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    /// Record identifier.
    pub record_id: String,
    /// Current payload.
    pub payload: Payload,
    /// Time of the last business write.
    pub modified_at: Timestamp,
}

/// The application's own record storage.
///
/// The engine writes remote changes through `upsert`/`delete` and reads
/// records back for merging and reconciliation. Writes made through this
/// trait are sync applies and must not count as local modifications.
pub trait LocalStore: Send + Sync {
    /// Inserts or replaces a record with a remote payload.
    fn upsert(&self, table_name: &str, record_id: &str, payload: &Payload) -> SyncResult<()>;

    /// Removes a record deleted remotely. Removing a missing record is not an error.
    fn delete(&self, table_name: &str, record_id: &str) -> SyncResult<()>;

    /// Loads the current payload of a record.
    fn load(&self, table_name: &str, record_id: &str) -> SyncResult<Option<Payload>>;

    /// Lists records changed by business writes at or after `since`.
    fn modified_since(&self, table_name: &str, since: Timestamp) -> SyncResult<Vec<LocalRecord>>;
}

impl<L: LocalStore + ?Sized> LocalStore for std::sync::Arc<L> {
    fn upsert(&self, table_name: &str, record_id: &str, payload: &Payload) -> SyncResult<()> {
        (**self).upsert(table_name, record_id, payload)
    }

    fn delete(&self, table_name: &str, record_id: &str) -> SyncResult<()> {
        (**self).delete(table_name, record_id)
    }

    fn load(&self, table_name: &str, record_id: &str) -> SyncResult<Option<Payload>> {
        (**self).load(table_name, record_id)
    }

    fn modified_since(&self, table_name: &str, since: Timestamp) -> SyncResult<Vec<LocalRecord>> {
        (**self).modified_since(table_name, since)
    }
}

#[derive(Debug, Clone)]
struct Row {
    payload: Payload,
    modified_at: Option<Timestamp>,
}

/// In-memory [`LocalStore`] for tests and demos.
///
/// Business writes go through [`write`](Self::write) and
/// [`remove`](Self::remove); those are the changes an application would
/// also hand to change capture.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    tables: RwLock<BTreeMap<String, BTreeMap<String, Row>>>,
    failing: RwLock<HashSet<RecordKey>>,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Performs a business write.
    pub fn write(&self, table_name: &str, record_id: &str, payload: Payload) -> Timestamp {
        self.write_at(table_name, record_id, payload, Timestamp::now())
    }

    /// Performs a business write with an explicit modification time.
    pub fn write_at(
        &self,
        table_name: &str,
        record_id: &str,
        payload: Payload,
        modified_at: Timestamp,
    ) -> Timestamp {
        self.tables
            .write()
            .entry(table_name.to_string())
            .or_default()
            .insert(
                record_id.to_string(),
                Row {
                    payload,
                    modified_at: Some(modified_at),
                },
            );
        modified_at
    }

    /// Performs a business delete.
    pub fn remove(&self, table_name: &str, record_id: &str) {
        if let Some(table) = self.tables.write().get_mut(table_name) {
            table.remove(record_id);
        }
    }

    /// Returns the stored payload, bypassing failure injection.
    pub fn get(&self, table_name: &str, record_id: &str) -> Option<Payload> {
        self.tables
            .read()
            .get(table_name)
            .and_then(|t| t.get(record_id))
            .map(|row| row.payload.clone())
    }

    /// Makes sync applies to one record fail (or succeed again).
    pub fn set_failing(&self, table_name: &str, record_id: &str, failing: bool) {
        let key = RecordKey::new(table_name, record_id);
        let mut set = self.failing.write();
        if failing {
            set.insert(key);
        } else {
            set.remove(&key);
        }
    }

    fn check(&self, table_name: &str, record_id: &str) -> SyncResult<()> {
        if self
            .failing
            .read()
            .contains(&RecordKey::new(table_name, record_id))
        {
            return Err(SyncError::local_apply(table_name, record_id, "write rejected"));
        }
        Ok(())
    }
}

impl LocalStore for MemoryLocalStore {
    fn upsert(&self, table_name: &str, record_id: &str, payload: &Payload) -> SyncResult<()> {
        self.check(table_name, record_id)?;
        let mut tables = self.tables.write();
        let table = tables.entry(table_name.to_string()).or_default();
        let modified_at = table.get(record_id).and_then(|row| row.modified_at);
        table.insert(
            record_id.to_string(),
            Row {
                payload: payload.clone(),
                modified_at,
            },
        );
        Ok(())
    }

    fn delete(&self, table_name: &str, record_id: &str) -> SyncResult<()> {
        self.check(table_name, record_id)?;
        if let Some(table) = self.tables.write().get_mut(table_name) {
            table.remove(record_id);
        }
        Ok(())
    }

    fn load(&self, table_name: &str, record_id: &str) -> SyncResult<Option<Payload>> {
        Ok(self.get(table_name, record_id))
    }

    fn modified_since(&self, table_name: &str, since: Timestamp) -> SyncResult<Vec<LocalRecord>> {
        let tables = self.tables.read();
        let Some(table) = tables.get(table_name) else {
            return Ok(Vec::new());
        };
        Ok(table
            .iter()
            .filter_map(|(id, row)| {
                let modified_at = row.modified_at.filter(|at| *at >= since)?;
                Some(LocalRecord {
                    record_id: id.clone(),
                    payload: row.payload.clone(),
                    modified_at,
                })
            })
            .collect())
    }
}
