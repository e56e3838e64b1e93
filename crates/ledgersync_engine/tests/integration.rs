//! End-to-end sync tests against the reference server over a loopback client.

use ledgersync_engine::{
    CycleOutcome, HttpRemote, LoopbackClient, LoopbackServer, MemoryLocalStore, MockRemote,
    RemoteAdapter, SyncConfig, SyncEngine, SyncError,
};
use ledgersync_protocol::{ConflictStrategy, EntryStatus, HttpReply, Operation, RecordKey};
use ledgersync_queue::{MemoryJournal, QueueOptions, QueueStore};
use ledgersync_server::{ServerConfig, SyncServer};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

struct Loopback(Arc<SyncServer>);

impl LoopbackServer for Loopback {
    fn handle_post(&self, path: &str, bearer: Option<&str>, body: &[u8]) -> HttpReply {
        self.0.handle_post(path, bearer, body)
    }
}

type Remote = HttpRemote<LoopbackClient<Loopback>>;
type Engine = SyncEngine<Remote, Arc<MemoryLocalStore>>;

struct Harness {
    server: Arc<SyncServer>,
    local: Arc<MemoryLocalStore>,
    engine: Engine,
}

impl Harness {
    fn new(server_config: ServerConfig, config: SyncConfig) -> Self {
        let queue = Arc::new(QueueStore::in_memory(QueueOptions::default()).unwrap());
        Self::with_queue(Arc::new(SyncServer::new(server_config)), queue, config)
    }

    fn with_queue(server: Arc<SyncServer>, queue: Arc<QueueStore>, config: SyncConfig) -> Self {
        Self::with_parts(server, queue, Arc::new(MemoryLocalStore::new()), config, None)
    }

    fn with_parts(
        server: Arc<SyncServer>,
        queue: Arc<QueueStore>,
        local: Arc<MemoryLocalStore>,
        config: SyncConfig,
        token: Option<&str>,
    ) -> Self {
        let client = LoopbackClient::new(Loopback(Arc::clone(&server)));
        let mut remote = HttpRemote::new("http://sync.test", client);
        if let Some(token) = token {
            remote = remote.with_token(token);
        }
        let engine = SyncEngine::new(config, queue, remote, Arc::clone(&local)).unwrap();
        Self {
            server,
            local,
            engine,
        }
    }

    fn write(&self, id: &str, op: Operation, payload: Value) -> u64 {
        self.local.write("contacts", id, payload.clone());
        self.engine
            .capture()
            .record_change("contacts", id, op, Some(payload))
            .unwrap()
            .id
    }
}

fn contacts(strategy: ConflictStrategy) -> SyncConfig {
    SyncConfig::new().with_table("contacts", strategy)
}

#[test]
fn local_create_reaches_remote() {
    let h = Harness::new(ServerConfig::default(), contacts(ConflictStrategy::LocalFirst));
    let id = h.write("c1", Operation::Create, json!({"name": "Ada"}));

    let outcome = h.engine.sync().unwrap();
    assert_eq!(outcome.last_report().unwrap().pushed, 1);

    let stored = h.engine.queue().get(id).unwrap();
    assert_eq!(stored.status, EntryStatus::Synced);
    assert!(stored.synced_at.is_some());
    let remote = h.server.record("contacts", "c1").unwrap();
    assert_eq!(remote.payload, Some(json!({"name": "Ada"})));
    assert_eq!(remote.remote_version, 1);
    assert!(h.engine.get_status().is_clean());
}

#[test]
fn remote_first_conflict_takes_remote_copy() {
    let h = Harness::new(ServerConfig::default(), contacts(ConflictStrategy::RemoteFirst));
    h.server.write("contacts", "c1", json!({"name": "Remote"}));
    let id = h.write("c1", Operation::Update, json!({"name": "Local"}));

    let report = h.engine.sync().unwrap().last_report().cloned().unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.superseded, 1);

    assert_eq!(h.local.get("contacts", "c1"), Some(json!({"name": "Remote"})));
    let stored = h.engine.queue().get(id).unwrap();
    assert_eq!(stored.status, EntryStatus::Synced);
    assert!(stored.last_error.unwrap().contains("superseded"));
    assert_eq!(
        h.server.record("contacts", "c1").unwrap().payload,
        Some(json!({"name": "Remote"}))
    );
}

#[test]
fn local_first_conflict_overwrites_remote() {
    let h = Harness::new(ServerConfig::default(), contacts(ConflictStrategy::LocalFirst));
    h.server.write("contacts", "c1", json!({"name": "Remote"}));
    h.write("c1", Operation::Update, json!({"name": "Local"}));

    h.engine.sync().unwrap();
    let remote = h.server.record("contacts", "c1").unwrap();
    assert_eq!(remote.payload, Some(json!({"name": "Local"})));
    assert_eq!(remote.remote_version, 2);
    assert_eq!(h.local.get("contacts", "c1"), Some(json!({"name": "Local"})));
}

#[test]
fn unavailable_remote_keeps_entry_retryable() {
    let h = Harness::new(
        ServerConfig::default(),
        contacts(ConflictStrategy::LocalFirst).with_max_retries(5),
    );
    let id = h.write("c1", Operation::Create, json!({"name": "Ada"}));

    h.server.set_unavailable(true);
    for _ in 0..3 {
        let report = h.engine.sync().unwrap().last_report().cloned().unwrap();
        assert_eq!(report.failed, 1);
    }
    let stored = h.engine.queue().get(id).unwrap();
    assert_eq!(stored.status, EntryStatus::Pending);
    assert_eq!(stored.retry_count, 3);
    assert!(stored.last_error.unwrap().contains("unavailable"));

    h.server.set_unavailable(false);
    h.engine.sync().unwrap();
    assert_eq!(h.engine.queue().get(id).unwrap().status, EntryStatus::Synced);
}

#[test]
fn rejected_payload_is_parked_at_cap() {
    let h = Harness::new(
        ServerConfig::new().with_required_fields("contacts", ["name"]),
        contacts(ConflictStrategy::LocalFirst).with_max_retries(2),
    );
    let id = h.write("c1", Operation::Create, json!({"email": "ada@example.com"}));

    h.engine.sync().unwrap();
    assert_eq!(h.engine.queue().get(id).unwrap().status, EntryStatus::Pending);
    h.engine.sync().unwrap();
    h.engine.sync().unwrap();

    let stored = h.engine.queue().get(id).unwrap();
    assert_eq!(stored.status, EntryStatus::Failed);
    assert_eq!(stored.retry_count, 2);
    assert!(stored.last_error.unwrap().contains("name"));
    let status = h.engine.get_status();
    assert_eq!(status.needs_attention, 1);
    assert_eq!(status.failed, 0);
    assert!(h.server.record("contacts", "c1").is_none());
}

#[test]
fn pull_after_restart_is_idempotent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("queue.lsq");
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let local = Arc::new(MemoryLocalStore::new());
    server.write("contacts", "c1", json!({"name": "Ada"}));
    server.write("contacts", "c2", json!({"name": "Bo"}));

    {
        let queue = Arc::new(QueueStore::open_file(&path, QueueOptions::default()).unwrap());
        let h = Harness::with_parts(
            Arc::clone(&server),
            queue,
            Arc::clone(&local),
            contacts(ConflictStrategy::LocalFirst),
            None,
        );
        let report = h.engine.sync().unwrap().last_report().cloned().unwrap();
        assert_eq!(report.pulled_applied, 2);
    }

    let queue = Arc::new(QueueStore::open_file(&path, QueueOptions::default()).unwrap());
    let h = Harness::with_parts(
        server,
        queue,
        Arc::clone(&local),
        contacts(ConflictStrategy::LocalFirst),
        None,
    );
    let report = h.engine.sync().unwrap().last_report().cloned().unwrap();
    assert_eq!(report.pulled_applied, 0);
    assert_eq!(h.engine.queue().counts().total, 0);
    assert_eq!(local.get("contacts", "c2"), Some(json!({"name": "Bo"})));
}

#[test]
fn own_push_is_not_reapplied() {
    let h = Harness::new(ServerConfig::default(), contacts(ConflictStrategy::LocalFirst));
    h.write("c1", Operation::Create, json!({"name": "Ada"}));
    h.engine.sync().unwrap();

    let report = h.engine.sync().unwrap().last_report().cloned().unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(report.pulled_applied, 0);
    assert_eq!(report.conflicts, 0);
    assert_eq!(h.engine.queue().counts().total, 1);
    assert_eq!(h.local.get("contacts", "c1"), Some(json!({"name": "Ada"})));
}

#[test]
fn remote_delete_removes_local_record() {
    let h = Harness::new(ServerConfig::default(), contacts(ConflictStrategy::LocalFirst));
    h.server.write("contacts", "c1", json!({"name": "Ada"}));
    h.engine.sync().unwrap();
    assert!(h.local.get("contacts", "c1").is_some());

    h.server.delete("contacts", "c1");
    h.engine.sync().unwrap();
    assert!(h.local.get("contacts", "c1").is_none());
}

#[test]
fn rejected_credentials_abort_cycle() {
    let server = Arc::new(SyncServer::new(ServerConfig::new().with_auth(b"secret".to_vec())));
    let queue = Arc::new(QueueStore::in_memory(QueueOptions::default()).unwrap());
    let h = Harness::with_parts(
        Arc::clone(&server),
        queue,
        Arc::new(MemoryLocalStore::new()),
        contacts(ConflictStrategy::LocalFirst),
        Some("desk-01.0.bad"),
    );
    let first = h.write("c1", Operation::Create, json!({"name": "Ada"}));
    let second = h.write("c2", Operation::Create, json!({"name": "Bo"}));

    let err = h.engine.sync().unwrap_err();
    assert!(matches!(err, SyncError::Authentication(_)));
    for id in [first, second] {
        let stored = h.engine.queue().get(id).unwrap();
        assert_eq!(stored.status, EntryStatus::Pending);
        assert_eq!(stored.retry_count, 0);
    }
    assert!(!h.engine.get_status().critical);
}

#[test]
fn valid_token_syncs() {
    let server = Arc::new(SyncServer::new(ServerConfig::new().with_auth(b"secret".to_vec())));
    let token = server.create_token("desk-01").unwrap();
    let queue = Arc::new(QueueStore::in_memory(QueueOptions::default()).unwrap());
    let h = Harness::with_parts(
        server,
        queue,
        Arc::new(MemoryLocalStore::new()),
        contacts(ConflictStrategy::LocalFirst),
        Some(&token),
    );
    h.write("c1", Operation::Create, json!({"name": "Ada"}));
    assert_eq!(h.engine.sync().unwrap().last_report().unwrap().pushed, 1);
}

#[test]
fn failing_queue_storage_is_critical() {
    let journal = MemoryJournal::new();
    let queue = Arc::new(QueueStore::open(journal.clone(), QueueOptions::default()).unwrap());
    let h = Harness::with_queue(
        Arc::new(SyncServer::new(ServerConfig::default())),
        queue,
        contacts(ConflictStrategy::LocalFirst),
    );
    h.write("c1", Operation::Create, json!({"name": "Ada"}));

    journal.set_fail_writes(true);
    let err = h.engine.sync().unwrap_err();
    assert!(err.is_critical());
    let status = h.engine.get_status();
    assert!(status.critical);
    assert!(status.last_error.is_some());
}

#[test]
fn overlapping_requests_coalesce_into_one_cycle() {
    let remote = Arc::new(MockRemote::new());
    let queue = Arc::new(QueueStore::in_memory(QueueOptions::default()).unwrap());
    let engine = Arc::new(
        SyncEngine::new(
            contacts(ConflictStrategy::LocalFirst),
            queue,
            Arc::clone(&remote),
            MemoryLocalStore::new(),
        )
        .unwrap(),
    );
    engine
        .capture()
        .record_change("contacts", "c1", Operation::Create, Some(json!({})))
        .unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let blocked = AtomicBool::new(false);
    remote.set_push_hook(move |_| {
        if !blocked.swap(true, Ordering::SeqCst) {
            entered_tx.send(()).unwrap();
            release_rx.lock().recv().unwrap();
        }
    });

    let worker = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.sync())
    };
    entered_rx.recv().unwrap();
    for _ in 0..3 {
        assert!(matches!(engine.sync().unwrap(), CycleOutcome::Coalesced));
    }
    assert!(engine.get_status().is_syncing);
    release_tx.send(()).unwrap();

    let outcome = worker.join().unwrap().unwrap();
    assert_eq!(outcome.reports().len(), 2);
    assert_eq!(remote.pushes().len(), 1);
    assert_eq!(engine.queue().last_cycle().map(|c| c.success), Some(true));
    assert!(!engine.get_status().is_syncing);
}

#[test]
fn closed_adapter_leaves_queue_intact() {
    let h = Harness::new(ServerConfig::default(), contacts(ConflictStrategy::LocalFirst));
    let id = h.write("c1", Operation::Create, json!({"name": "Ada"}));
    let key = RecordKey::new("contacts", "c1");

    h.engine.remote().close().unwrap();
    assert!(!h.engine.remote().is_connected());
    let report = h.engine.sync().unwrap().last_report().cloned().unwrap();
    assert_eq!(report.failed, 1);
    assert!(!report.errors.is_empty());

    let entries = h.engine.queue().entries_for(&key);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, id);
    assert_eq!(entries[0].status, EntryStatus::Pending);
    assert!(h.server.record("contacts", "c1").is_none());
}

#[test]
fn configured_timeout_reaches_http_adapter() {
    let config =
        contacts(ConflictStrategy::LocalFirst).with_request_timeout(Duration::from_secs(7));
    let h = Harness::new(ServerConfig::default(), config);
    assert_eq!(h.engine.remote().timeout(), Duration::from_secs(7));

    h.write("c1", Operation::Create, json!({"name": "Ada"}));
    assert_eq!(h.engine.sync().unwrap().last_report().unwrap().pushed, 1);
}
