//! The remote adapter boundary.
//!
//! The engine talks to the remote store only through [`RemoteAdapter`], so
//! the concrete technology (HTTP, an SDK, a test double) is swappable.

use crate::error::{SyncError, SyncResult};
use ledgersync_protocol::{
    Payload, PullCursor, PullPage, PullRequest, PushRequest, PushResponse, RemoteRecord,
    Timestamp,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Protocol client for the remote store.
///
/// Every failure surfaces as a classified [`SyncError`]: transient network
/// problems, timeouts, rejected credentials and rejected payloads are
/// distinct variants. A conflict is not an error; it comes back as a
/// non-accepted [`PushResponse`].
pub trait RemoteAdapter: Send + Sync {
    /// Sends one mutation.
    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse>;

    /// Fetches one page of changes ordered by `(remote_updated_at, record_id)`.
    fn pull(&self, request: &PullRequest) -> SyncResult<PullPage>;

    /// Returns the current remote copy of a record, if any.
    fn version(&self, table_name: &str, record_id: &str) -> SyncResult<Option<RemoteRecord>>;

    /// Returns true if the adapter believes the remote is reachable.
    fn is_connected(&self) -> bool;

    /// Releases the connection.
    fn close(&self) -> SyncResult<()>;

    /// Sets the deadline for each request. Adapters without one ignore it.
    fn set_timeout(&self, _timeout: Duration) {}
}

impl<R: RemoteAdapter + ?Sized> RemoteAdapter for Arc<R> {
    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        (**self).push(request)
    }

    fn pull(&self, request: &PullRequest) -> SyncResult<PullPage> {
        (**self).pull(request)
    }

    fn version(&self, table_name: &str, record_id: &str) -> SyncResult<Option<RemoteRecord>> {
        (**self).version(table_name, record_id)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn close(&self) -> SyncResult<()> {
        (**self).close()
    }

    fn set_timeout(&self, timeout: Duration) {
        (**self).set_timeout(timeout)
    }
}

/// A lazy, finite sequence of remote changes since a high-water mark.
///
/// Pages are fetched on demand with a keyset cursor, so a window can be
/// restarted from any `since` and records sharing a timestamp are never
/// skipped or repeated across page boundaries. After the first error the
/// stream ends.
pub struct PullStream<'a, R: RemoteAdapter + ?Sized> {
    remote: &'a R,
    table_name: String,
    since: Timestamp,
    page_size: u32,
    after: Option<PullCursor>,
    buffer: VecDeque<RemoteRecord>,
    exhausted: bool,
}

impl<'a, R: RemoteAdapter + ?Sized> PullStream<'a, R> {
    /// Starts a stream over `table_name` from `since` (inclusive).
    pub fn new(remote: &'a R, table_name: impl Into<String>, since: Timestamp, page_size: u32) -> Self {
        Self {
            remote,
            table_name: table_name.into(),
            since,
            page_size: page_size.max(1),
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn fetch(&mut self) -> SyncResult<()> {
        let page = self.remote.pull(&PullRequest {
            table_name: self.table_name.clone(),
            since: self.since,
            after: self.after.clone(),
            limit: self.page_size,
        })?;

        if let Some(last) = page.records.last() {
            let cursor = PullCursor {
                remote_updated_at: last.remote_updated_at,
                record_id: last.record_id.clone(),
            };
            if self.after.as_ref() == Some(&cursor) {
                return Err(SyncError::Protocol(format!(
                    "pull of '{}' did not advance past {}",
                    self.table_name, cursor.record_id
                )));
            }
            self.after = Some(cursor);
        }
        self.exhausted = !page.has_more || page.records.is_empty();
        self.buffer.extend(page.records);
        Ok(())
    }
}

impl<R: RemoteAdapter + ?Sized> Iterator for PullStream<'_, R> {
    type Item = SyncResult<RemoteRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}

type PushHook = Box<dyn Fn(&PushRequest) + Send + Sync>;

/// A scriptable in-memory remote for tests and demos.
///
/// Without scripted responses it behaves like a small remote store:
/// versions increase per record, modification times strictly increase, and
/// checked writes on a stale base version are rejected with a conflict.
#[derive(Default)]
pub struct MockRemote {
    connected: AtomicBool,
    state: Mutex<MockState>,
    push_hook: Mutex<Option<Arc<PushHook>>>,
}

#[derive(Default)]
struct MockState {
    tables: BTreeMap<String, BTreeMap<String, RemoteRecord>>,
    clock: u64,
    push_script: VecDeque<SyncResult<PushResponse>>,
    pull_script: VecDeque<SyncError>,
    pushes: Vec<PushRequest>,
}

impl MockState {
    fn tick(&mut self) -> Timestamp {
        self.clock = self.clock.max(Timestamp::now().as_millis()) + 1;
        Timestamp::from_millis(self.clock)
    }

    fn write(&mut self, table: &str, record_id: &str, payload: Option<Payload>) -> RemoteRecord {
        let at = self.tick();
        let records = self.tables.entry(table.to_string()).or_default();
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
}

impl MockRemote {
    /// Creates a connected, empty remote.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Queues a response for the next push, taking precedence over the
    /// built-in store.
    pub fn script_push(&self, response: SyncResult<PushResponse>) {
        self.state.lock().push_script.push_back(response);
    }

    /// Makes the next pull fail with `error`.
    pub fn script_pull_error(&self, error: SyncError) {
        self.state.lock().pull_script.push_back(error);
    }

    /// Writes a record as another client would, returning the stored copy.
    pub fn remote_write(&self, table: &str, record_id: &str, payload: Payload) -> RemoteRecord {
        self.state.lock().write(table, record_id, Some(payload))
    }

    /// Deletes a record as another client would.
    pub fn remote_delete(&self, table: &str, record_id: &str) -> RemoteRecord {
        self.state.lock().write(table, record_id, None)
    }

    /// Returns the stored copy of a record.
    pub fn record(&self, table: &str, record_id: &str) -> Option<RemoteRecord> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.get(record_id))
            .cloned()
    }

    /// Returns every push received, in order.
    pub fn pushes(&self) -> Vec<PushRequest> {
        self.state.lock().pushes.clone()
    }

    /// Installs a callback invoked at the start of every push.
    pub fn set_push_hook(&self, hook: impl Fn(&PushRequest) + Send + Sync + 'static) {
        *self.push_hook.lock() = Some(Arc::new(Box::new(hook)));
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn ensure_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::TransientNetwork("remote unreachable".into()))
        }
    }
}

impl RemoteAdapter for MockRemote {
    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        let hook = self.push_hook.lock().clone();
        if let Some(hook) = hook {
            hook(request);
        }
        self.ensure_connected()?;

        let mut state = self.state.lock();
        state.pushes.push(request.clone());
        if let Some(scripted) = state.push_script.pop_front() {
            return scripted;
        }

        let current = state
            .tables
            .get(&request.table_name)
            .and_then(|t| t.get(&request.record_id))
            .cloned();
        if let Some(current) = current.filter(|c| request.conflicts_with(c)) {
            return Ok(PushResponse::conflict(current));
        }

        let payload = if request.operation.carries_payload() {
            request.payload.clone()
        } else {
            None
        };
        let stored = state.write(&request.table_name, &request.record_id, payload);
        Ok(PushResponse::accepted(stored.remote_version, stored.remote_updated_at))
    }

    fn pull(&self, request: &PullRequest) -> SyncResult<PullPage> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        if let Some(error) = state.pull_script.pop_front() {
            return Err(error);
        }

        let mut matching: Vec<RemoteRecord> = state
            .tables
            .get(&request.table_name)
            .map(|t| {
                t.values()
                    .filter(|r| r.remote_updated_at >= request.since)
                    .filter(|r| {
                        request.after.as_ref().map_or(true, |c| {
                            (r.remote_updated_at, r.record_id.as_str())
                                > (c.remote_updated_at, c.record_id.as_str())
                        })
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matching.sort_by(|a, b| {
            (a.remote_updated_at, &a.record_id).cmp(&(b.remote_updated_at, &b.record_id))
        });

        let limit = request.limit as usize;
        let has_more = matching.len() > limit;
        matching.truncate(limit);
        Ok(PullPage {
            records: matching,
            has_more,
        })
    }

    fn version(&self, table_name: &str, record_id: &str) -> SyncResult<Option<RemoteRecord>> {
        self.ensure_connected()?;
        Ok(self.record(table_name, record_id))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgersync_protocol::{Operation, WriteMode};
    use serde_json::json;

    fn push(record_id: &str, base_version: Option<u64>, mode: WriteMode) -> PushRequest {
        PushRequest {
            table_name: "contacts".into(),
            record_id: record_id.into(),
            operation: Operation::Update,
            payload: Some(json!({"name": "Ada"})),
            base_version,
            mode,
        }
    }

    #[test]
    fn stale_base_version_conflicts() {
        let remote = MockRemote::new();
        remote.remote_write("contacts", "c1", json!({"name": "Grace"}));

        let response = remote.push(&push("c1", None, WriteMode::Checked)).unwrap();
        assert!(!response.accepted);
        assert_eq!(response.conflict.unwrap().remote_version, 1);

        let response = remote.push(&push("c1", Some(1), WriteMode::Checked)).unwrap();
        assert!(response.accepted);
        assert_eq!(response.remote_version, 2);

        let response = remote.push(&push("c1", None, WriteMode::Overwrite)).unwrap();
        assert!(response.accepted);
        assert_eq!(response.remote_version, 3);
    }

    #[test]
    fn scripted_push_takes_precedence() {
        let remote = MockRemote::new();
        remote.script_push(Err(SyncError::RemoteValidation("missing email".into())));
        let result = remote.push(&push("c1", None, WriteMode::Checked));
        assert!(matches!(result, Err(SyncError::RemoteValidation(_))));
        assert_eq!(remote.pushes().len(), 1);
        assert!(remote.push(&push("c1", None, WriteMode::Checked)).unwrap().accepted);
    }

    #[test]
    fn disconnected_remote_is_transient() {
        let remote = MockRemote::new();
        remote.set_connected(false);
        let err = remote.push(&push("c1", None, WriteMode::Checked)).unwrap_err();
        assert!(err.is_retryable());
        remote.set_connected(true);
        remote.close().unwrap();
        assert!(!remote.is_connected());
    }

    #[test]
    fn pull_stream_pages_through_window() {
        let remote = MockRemote::new();
        for i in 0..7 {
            remote.remote_write("contacts", &format!("c{i}"), json!({"i": i}));
        }
        let records: Vec<RemoteRecord> = PullStream::new(&remote, "contacts", Timestamp::EPOCH, 3)
            .collect::<SyncResult<_>>()
            .unwrap();
        assert_eq!(records.len(), 7);
        assert!(records
            .windows(2)
            .all(|w| w[0].remote_updated_at <= w[1].remote_updated_at));
    }

    #[test]
    fn pull_stream_restarts_from_since() {
        let remote = MockRemote::new();
        remote.remote_write("contacts", "c1", json!({}));
        let second = remote.remote_write("contacts", "c2", json!({}));

        let records: Vec<RemoteRecord> =
            PullStream::new(&remote, "contacts", second.remote_updated_at, 10)
                .collect::<SyncResult<_>>()
                .unwrap();
        assert_eq!(records, vec![second]);
    }

    #[test]
    fn pull_stream_stops_after_error() {
        let remote = MockRemote::new();
        remote.remote_write("contacts", "c1", json!({}));
        remote.script_pull_error(SyncError::Timeout);

        let mut stream = PullStream::new(&remote, "contacts", Timestamp::EPOCH, 10);
        assert!(matches!(stream.next(), Some(Err(SyncError::Timeout))));
        assert!(stream.next().is_none());
    }
}
