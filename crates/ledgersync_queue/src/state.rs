//! In-memory queue state rebuilt from the journal.

use crate::journal::{CycleRecord, JournalRecord};
use ledgersync_protocol::{
    EntryStatus, QueueEntry, RecordKey, RecordVersion, SyncMetadata, Timestamp,
};
use std::collections::{BTreeMap, HashMap};

/// Everything the journal describes, folded into lookup structures.
#[derive(Debug)]
pub(crate) struct QueueState {
    pub(crate) entries: BTreeMap<u64, QueueEntry>,
    pub(crate) next_id: u64,
    pub(crate) tables: BTreeMap<String, SyncMetadata>,
    pub(crate) versions: HashMap<RecordKey, RecordVersion>,
    pub(crate) last_cycle: Option<CycleRecord>,
    pub(crate) last_success: Option<CycleRecord>,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
            tables: BTreeMap::new(),
            versions: HashMap::new(),
            last_cycle: None,
            last_success: None,
        }
    }
}

impl QueueState {
    /// Applies one journal record. Records referring to pruned ids are ignored.
    pub(crate) fn apply(&mut self, record: &JournalRecord) {
        match record {
            JournalRecord::Enqueued { entry } => {
                self.next_id = self.next_id.max(entry.id + 1);
                self.entries.insert(entry.id, entry.clone());
            }
            JournalRecord::InFlight { ids, at } => {
                self.update(ids, *at, |e| e.status = EntryStatus::InFlight);
            }
            JournalRecord::Synced { ids, at } => {
                self.update(ids, *at, |e| {
                    e.status = EntryStatus::Synced;
                    e.synced_at = Some(*at);
                });
            }
            JournalRecord::PushCompleted { id, version, at } => {
                let mut key = None;
                self.update(std::slice::from_ref(id), *at, |e| {
                    e.status = EntryStatus::Synced;
                    e.synced_at = Some(*at);
                    key = Some(e.key());
                });
                if let Some(key) = key {
                    if let Some(meta) = self.tables.get_mut(&key.table_name) {
                        meta.last_pushed_at = meta.last_pushed_at.max(Some(*at));
                    }
                    self.versions.insert(key, *version);
                }
            }
            JournalRecord::Failed { ids, reason, at } => {
                self.update(ids, *at, |e| {
                    e.status = EntryStatus::Failed;
                    e.retry_count = e.retry_count.saturating_add(1);
                    e.last_error = Some(reason.clone());
                });
            }
            JournalRecord::Released { ids, at } | JournalRecord::Reset { ids, at } => {
                self.update(ids, *at, |e| e.status = EntryStatus::Pending);
            }
            JournalRecord::Superseded { ids, reason, at } => {
                self.update(ids, *at, |e| {
                    e.status = EntryStatus::Synced;
                    e.synced_at = Some(*at);
                    e.last_error = Some(reason.clone());
                });
            }
            JournalRecord::Retried { id, at } => {
                self.update(std::slice::from_ref(id), *at, |e| {
                    e.status = EntryStatus::Pending;
                    e.retry_count = 0;
                });
            }
            JournalRecord::Pruned { ids } => {
                for id in ids {
                    self.entries.remove(id);
                }
            }
            JournalRecord::TableConfigured {
                table_name,
                conflict_resolution,
                sync_enabled,
            } => {
                let meta = self
                    .tables
                    .entry(table_name.clone())
                    .or_insert_with(|| SyncMetadata::new(table_name.clone(), *conflict_resolution));
                meta.conflict_resolution = *conflict_resolution;
                meta.sync_enabled = *sync_enabled;
            }
            JournalRecord::TableSnapshot { metadata } => {
                self.tables
                    .insert(metadata.table_name.clone(), metadata.clone());
            }
            JournalRecord::PulledUpTo { table_name, at } => {
                if let Some(meta) = self.tables.get_mut(table_name) {
                    meta.last_pulled_at = meta.last_pulled_at.max(Some(*at));
                }
            }
            JournalRecord::VersionObserved { key, version } => {
                self.versions.insert(key.clone(), *version);
            }
            JournalRecord::CycleFinished { cycle } => {
                if cycle.success {
                    self.last_success = Some(cycle.clone());
                }
                self.last_cycle = Some(cycle.clone());
            }
            JournalRecord::IdWatermark { next_id } => {
                self.next_id = self.next_id.max(*next_id);
            }
            JournalRecord::VersionForgotten { key } => {
                self.versions.remove(key);
            }
        }
    }

    fn update(&mut self, ids: &[u64], at: Timestamp, mut f: impl FnMut(&mut QueueEntry)) {
        for id in ids {
            if let Some(entry) = self.entries.get_mut(id) {
                f(entry);
                entry.updated_at = at;
            }
        }
    }

    /// Ids of entries left in flight, e.g. by a crash mid-cycle.
    pub(crate) fn in_flight_ids(&self) -> Vec<u64> {
        self.entries
            .values()
            .filter(|e| e.status == EntryStatus::InFlight)
            .map(|e| e.id)
            .collect()
    }

    /// Records that reproduce this state from an empty journal.
    pub(crate) fn snapshot(&self) -> Vec<JournalRecord> {
        let mut records = vec![JournalRecord::IdWatermark {
            next_id: self.next_id,
        }];
        records.extend(self.tables.values().map(|m| JournalRecord::TableSnapshot {
            metadata: m.clone(),
        }));
        records.extend(self.entries.values().map(|e| JournalRecord::Enqueued {
            entry: e.clone(),
        }));
        let mut versions: Vec<_> = self.versions.iter().collect();
        versions.sort_by(|a, b| a.0.cmp(b.0));
        records.extend(versions.into_iter().map(|(k, v)| JournalRecord::VersionObserved {
            key: k.clone(),
            version: *v,
        }));
        if let Some(cycle) = &self.last_success {
            records.push(JournalRecord::CycleFinished {
                cycle: cycle.clone(),
            });
        }
        if let Some(cycle) = self.last_cycle.as_ref().filter(|c| !c.success) {
            records.push(JournalRecord::CycleFinished {
                cycle: cycle.clone(),
            });
        }
        records
    }
}
