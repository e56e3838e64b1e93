//! Durability and ordering tests for the queue store.

use ledgersync_protocol::{
    ConflictStrategy, EntryStatus, NewEntry, RecordKey, RecordVersion, Timestamp,
};
use ledgersync_queue::{
    CycleRecord, JournalBackend, MemoryJournal, QueueError, QueueOptions, QueueStore,
};
use proptest::prelude::*;
use serde_json::json;
use tempfile::tempdir;

fn options() -> QueueOptions {
    QueueOptions::default().with_max_retries(3)
}

#[test]
fn file_store_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sync").join("queue.lsq");

    let (synced, failed) = {
        let q = QueueStore::open_file(&path, options()).unwrap();
        q.configure_table("contacts", ConflictStrategy::RemoteFirst, true)
            .unwrap();
        let a = q.enqueue(NewEntry::create("contacts", "c1", json!({"name": "Ada"}))).unwrap();
        let b = q.enqueue(NewEntry::update("contacts", "c2", json!({"name": "Bo"}))).unwrap();
        q.mark_in_flight(&[a.id, b.id]).unwrap();
        q.mark_synced(&[a.id]).unwrap();
        q.mark_failed(&[b.id], "timeout").unwrap();
        q.advance_pulled_at("contacts", Timestamp::from_millis(500))
            .unwrap();
        (a.id, b.id)
    };

    let q = QueueStore::open_file(&path, options()).unwrap();
    assert_eq!(q.get(synced).unwrap().status, EntryStatus::Synced);
    let failed = q.get(failed).unwrap();
    assert_eq!(failed.status, EntryStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.last_error.as_deref(), Some("timeout"));

    let meta = q.metadata("contacts").unwrap();
    assert_eq!(meta.conflict_resolution, ConflictStrategy::RemoteFirst);
    assert_eq!(meta.last_pulled_at, Some(Timestamp::from_millis(500)));

    let next = q.enqueue(NewEntry::delete("contacts", "c1")).unwrap();
    assert!(next.id > failed.id);
}

#[test]
fn in_flight_entries_return_to_pending_on_restart() {
    let journal = MemoryJournal::new();
    let id = {
        let q = QueueStore::open(journal.clone(), options()).unwrap();
        let e = q.enqueue(NewEntry::create("contacts", "c1", json!({}))).unwrap();
        q.mark_in_flight(&[e.id]).unwrap();
        e.id
    };

    let q = QueueStore::open(journal, options()).unwrap();
    let e = q.get(id).unwrap();
    assert_eq!(e.status, EntryStatus::Pending);
    assert_eq!(e.retry_count, 0);
    assert_eq!(q.next_batch(10).unwrap().len(), 1);
}

#[test]
fn torn_tail_is_discarded() {
    let journal = MemoryJournal::new();
    {
        let q = QueueStore::open(journal.clone(), options()).unwrap();
        q.enqueue(NewEntry::create("contacts", "c1", json!({}))).unwrap();
        q.enqueue(NewEntry::create("contacts", "c2", json!({}))).unwrap();
    }
    let mut bytes = journal.data();
    bytes.truncate(bytes.len() - 5);
    let torn = MemoryJournal::with_data(bytes);

    let q = QueueStore::open(torn.clone(), options()).unwrap();
    assert_eq!(q.counts().total, 1);

    // Appends after recovery land on a clean frame boundary.
    q.enqueue(NewEntry::create("contacts", "c3", json!({}))).unwrap();
    drop(q);
    let q = QueueStore::open(torn, options()).unwrap();
    assert_eq!(q.counts().total, 2);
}

#[test]
fn corrupted_journal_refuses_to_open() {
    let journal = MemoryJournal::new();
    {
        let q = QueueStore::open(journal.clone(), options()).unwrap();
        q.enqueue(NewEntry::create("contacts", "c1", json!({"name": "Ada"})))
            .unwrap();
    }
    let mut bytes = journal.data();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x55;

    let result = QueueStore::open(MemoryJournal::with_data(bytes), options());
    assert!(matches!(result, Err(QueueError::Corrupted { .. })));
}

#[test]
fn compaction_preserves_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("queue.lsq");
    let key = RecordKey::new("contacts", "c1");
    let version = RecordVersion {
        remote_version: 4,
        remote_updated_at: Timestamp::from_millis(900),
    };

    {
        let q = QueueStore::open_file(&path, options()).unwrap();
        q.configure_table("contacts", ConflictStrategy::Merge, true)
            .unwrap();
        for i in 0..20 {
            let e = q
                .enqueue(NewEntry::update("contacts", "c1", json!({"rev": i})))
                .unwrap();
            q.mark_in_flight(&[e.id]).unwrap();
            q.mark_synced(&[e.id]).unwrap();
        }
        q.prune_synced(Timestamp::now().saturating_add(std::time::Duration::from_secs(1)))
            .unwrap();
        q.enqueue(NewEntry::delete("contacts", "c1")).unwrap();
        q.set_record_version(&key, version).unwrap();
        q.record_cycle(CycleRecord {
            started_at: Timestamp::from_millis(1),
            finished_at: Timestamp::from_millis(2),
            success: true,
            error: None,
            critical: false,
            pushed: 20,
            pulled: 0,
        })
        .unwrap();

        let stats = q.compact().unwrap();
        assert!(stats.bytes_after < stats.bytes_before);
    }

    let q = QueueStore::open_file(&path, options()).unwrap();
    let pending = q.entries(Some(EntryStatus::Pending));
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, 21);
    assert_eq!(q.record_version(&key), Some(version));
    assert_eq!(
        q.metadata("contacts").unwrap().conflict_resolution,
        ConflictStrategy::Merge
    );
    assert!(q.last_successful_cycle().is_some());
    assert_eq!(q.enqueue(NewEntry::delete("contacts", "c9")).unwrap().id, 22);
}

#[test]
fn memory_journal_reports_length() {
    let journal = MemoryJournal::new();
    let q = QueueStore::open(journal.clone(), options()).unwrap();
    q.enqueue(NewEntry::create("contacts", "c1", json!({}))).unwrap();
    assert_eq!(q.journal_len().unwrap(), journal.len().unwrap());
}

#[derive(Debug, Clone)]
enum Step {
    Enqueue(u8),
    Push,
    Fail,
    Reset,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0u8..4).prop_map(Step::Enqueue),
        Just(Step::Push),
        Just(Step::Fail),
        Just(Step::Reset),
    ]
}

proptest! {
    /// No batch ever contains an entry while an earlier entry for the same
    /// record is still unresolved.
    #[test]
    fn batches_preserve_per_record_order(steps in prop::collection::vec(step(), 1..60)) {
        let q = QueueStore::in_memory(options()).unwrap();

        for step in steps {
            match step {
                Step::Enqueue(r) => {
                    q.enqueue(NewEntry::update("contacts", format!("r{r}"), json!({}))).unwrap();
                }
                Step::Push | Step::Fail => {
                    let batch = q.next_batch(3).unwrap();
                    for entry in &batch {
                        let earlier_unresolved = q
                            .entries_for(&entry.key())
                            .into_iter()
                            .any(|e| e.id < entry.id && e.is_unresolved(q.max_retries()));
                        prop_assert!(!earlier_unresolved, "entry {} pushed out of order", entry.id);
                    }
                    let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
                    q.mark_in_flight(&ids).unwrap();
                    if matches!(step, Step::Push) {
                        q.mark_synced(&ids).unwrap();
                    } else {
                        q.mark_failed(&ids, "boom").unwrap();
                    }
                }
                Step::Reset => {
                    q.reset_failed(q.max_retries()).unwrap();
                }
            }
        }

        let counts = q.counts();
        prop_assert_eq!(counts.in_flight, 0);
        prop_assert_eq!(
            counts.pending + counts.synced + counts.failed,
            counts.total
        );
    }
}
