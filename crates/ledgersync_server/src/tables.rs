//! Server-side record storage.

use ledgersync_protocol::{Payload, PullCursor, PullPage, RemoteRecord, Timestamp};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Versioned records, per table.
///
/// Every write bumps the record's version and stamps it with a logical
/// clock that never goes backwards, even if the wall clock does. Deletes
/// leave tombstones so pulls can report them.
#[derive(Debug, Default)]
pub struct RemoteTables {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<String, BTreeMap<String, RemoteRecord>>,
    clock: u64,
}

impl RemoteTables {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current copy of a record, tombstones included.
    pub fn get(&self, table: &str, record_id: &str) -> Option<RemoteRecord> {
        self.inner
            .read()
            .tables
            .get(table)
            .and_then(|t| t.get(record_id))
            .cloned()
    }

    /// Writes a record (or a tombstone when `payload` is `None`).
    pub fn write(&self, table: &str, record_id: &str, payload: Option<Payload>) -> RemoteRecord {
        let mut inner = self.inner.write();
        inner.clock = inner.clock.max(Timestamp::now().as_millis()) + 1;
        let at = Timestamp::from_millis(inner.clock);

        let records = inner.tables.entry(table.to_string()).or_default();
        let version = records.get(record_id).map_or(0, |r| r.remote_version) + 1;
        let record = RemoteRecord {
            record_id: record_id.to_string(),
            payload,
            remote_version: version,
            remote_updated_at: at,
        };
        records.insert(record_id.to_string(), record.clone());
        record
    }

    /// Returns records changed at or after `since`, after the keyset
    /// `after`, ordered by `(remote_updated_at, record_id)`.
    pub fn changes(
        &self,
        table: &str,
        since: Timestamp,
        after: Option<&PullCursor>,
        limit: usize,
    ) -> PullPage {
        let inner = self.inner.read();
        let Some(records) = inner.tables.get(table) else {
            return PullPage::default();
        };

        let mut matching: Vec<&RemoteRecord> = records
            .values()
            .filter(|r| r.remote_updated_at >= since)
            .filter(|r| {
                after.map_or(true, |c| {
                    (r.remote_updated_at, r.record_id.as_str())
                        > (c.remote_updated_at, c.record_id.as_str())
                })
            })
            .collect();
        matching.sort_by(|a, b| {
            (a.remote_updated_at, &a.record_id).cmp(&(b.remote_updated_at, &b.record_id))
        });

        let has_more = matching.len() > limit;
        PullPage {
            records: matching.into_iter().take(limit).cloned().collect(),
            has_more,
        }
    }

    /// Returns the number of live (non-tombstone) records in a table.
    pub fn live_count(&self, table: &str) -> usize {
        self.inner
            .read()
            .tables
            .get(table)
            .map_or(0, |t| t.values().filter(|r| !r.is_tombstone()).count())
    }
}
