//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::RequestHandler;
use crate::tables::RemoteTables;
use ledgersync_protocol::{
    decode, encode, HttpReply, Payload, PullPage, PullRequest, PushRequest, PushResponse,
    RemoteRecord, VersionRequest, VersionResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

const PUSH: &str = "/sync/push";
const PULL: &str = "/sync/pull";
const VERSION: &str = "/sync/version";

/// The reference remote store.
///
/// Holds versioned records per table and answers the three sync endpoints.
/// Bodies are CBOR; failures are reported through HTTP status codes so the
/// client can tell transient from permanent errors.
///
/// # Example
///
/// ```
/// use ledgersync_server::{ServerConfig, SyncServer};
/// use serde_json::json;
///
/// let server = SyncServer::new(ServerConfig::default());
/// let record = server.write("contacts", "c1", json!({"name": "Ada"}));
/// assert_eq!(record.remote_version, 1);
/// ```
#[derive(Debug)]
pub struct SyncServer {
    handler: RequestHandler,
    tables: Arc<RemoteTables>,
    unavailable: AtomicBool,
}

impl SyncServer {
    /// Creates an empty server.
    pub fn new(config: ServerConfig) -> Self {
        let tables = Arc::new(RemoteTables::new());
        Self {
            handler: RequestHandler::new(config, Arc::clone(&tables)),
            tables,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Handles a push request.
    pub fn handle_push(&self, request: &PushRequest) -> ServerResult<PushResponse> {
        self.check_available()?;
        self.handler.handle_push(request)
    }

    /// Handles a pull request.
    pub fn handle_pull(&self, request: &PullRequest) -> ServerResult<PullPage> {
        self.check_available()?;
        self.handler.handle_pull(request)
    }

    /// Handles a version lookup.
    pub fn handle_version(&self, request: &VersionRequest) -> ServerResult<VersionResponse> {
        self.check_available()?;
        self.handler.handle_version(request)
    }

    /// Handles an encoded POST and returns the HTTP reply.
    pub fn handle_post(&self, path: &str, bearer: Option<&str>, body: &[u8]) -> HttpReply {
        let result = self
            .check_available()
            .and_then(|()| self.handler.authorize(bearer))
            .and_then(|_| self.dispatch(path, body));
        match result {
            Ok(body) => HttpReply::ok(body),
            Err(e) => {
                if e.is_server_error() {
                    warn!(path, error = %e, "Sync request failed");
                }
                HttpReply::error(e.status_code(), e.to_string())
            }
        }
    }

    fn dispatch(&self, path: &str, body: &[u8]) -> ServerResult<Vec<u8>> {
        match path {
            PUSH => self.call(body, |r| self.handler.handle_push(r)),
            PULL => self.call(body, |r| self.handler.handle_pull(r)),
            VERSION => self.call(body, |r| self.handler.handle_version(r)),
            other => Err(ServerError::UnknownEndpoint(other.to_string())),
        }
    }

    fn call<Req, Resp>(
        &self,
        body: &[u8],
        handle: impl FnOnce(&Req) -> ServerResult<Resp>,
    ) -> ServerResult<Vec<u8>>
    where
        Req: DeserializeOwned,
        Resp: Serialize,
    {
        let request: Req = decode(body)?;
        let response = handle(&request)?;
        Ok(encode(&response)?)
    }

    fn check_available(&self) -> ServerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ServerError::Unavailable);
        }
        Ok(())
    }

    /// Makes every request fail with 503 until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Writes a record as another client would.
    pub fn write(&self, table: &str, record_id: &str, payload: Payload) -> RemoteRecord {
        self.tables.write(table, record_id, Some(payload))
    }

    /// Deletes a record as another client would.
    pub fn delete(&self, table: &str, record_id: &str) -> RemoteRecord {
        self.tables.write(table, record_id, None)
    }

    /// Returns the current copy of a record, tombstones included.
    pub fn record(&self, table: &str, record_id: &str) -> Option<RemoteRecord> {
        self.tables.get(table, record_id)
    }

    /// Issues a bearer token for `client_id`, if authentication is enabled.
    pub fn create_token(&self, client_id: &str) -> Option<String> {
        self.handler
            .validator()
            .map(|validator| validator.create_token(client_id))
    }

    /// Returns the record tables.
    pub fn tables(&self) -> &Arc<RemoteTables> {
        &self.tables
    }
}
