//! Prune command implementation.

use super::open_store;
use ledgersync_engine::SyncConfig;
use ledgersync_protocol::Timestamp;
use ledgersync_queue::QueueStore;
use std::path::Path;
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Runs the prune command.
pub fn run(path: &Path, days: Option<u64>) -> Result<(), Box<dyn std::error::Error>> {
    let retention = match days {
        Some(days) => DAY.saturating_mul(u32::try_from(days).unwrap_or(u32::MAX)),
        None => SyncConfig::from_env()?.retention,
    };
    let store = open_store(path)?;
    let removed = prune(&store, retention, Timestamp::now())?;
    println!(
        "✓ Removed {removed} synced entries older than {} days",
        retention.as_secs() / DAY.as_secs()
    );
    Ok(())
}

pub(crate) fn prune(
    store: &QueueStore,
    retention: Duration,
    now: Timestamp,
) -> Result<usize, Box<dyn std::error::Error>> {
    Ok(store.prune_synced(now.saturating_sub(retention))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgersync_protocol::{EntryStatus, NewEntry};
    use ledgersync_queue::QueueOptions;
    use serde_json::json;

    #[test]
    fn removes_only_old_synced_entries() {
        let store = QueueStore::in_memory(QueueOptions::default()).unwrap();
        let synced = store.enqueue(NewEntry::create("contacts", "c1", json!({}))).unwrap();
        let pending = store.enqueue(NewEntry::create("contacts", "c2", json!({}))).unwrap();
        store.mark_in_flight(&[synced.id]).unwrap();
        store.mark_synced(&[synced.id]).unwrap();

        assert_eq!(prune(&store, DAY, Timestamp::now()).unwrap(), 0);

        let later = Timestamp::now().saturating_add(DAY * 2);
        assert_eq!(prune(&store, DAY, later).unwrap(), 1);
        assert!(store.get(synced.id).is_none());
        assert_eq!(store.get(pending.id).unwrap().status, EntryStatus::Pending);
    }
}
