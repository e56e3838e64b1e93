//! HTTP remote adapter.
//!
//! The actual HTTP client is abstracted via [`HttpClient`] so the adapter
//! works with any HTTP library. Request and response bodies are CBOR.

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteAdapter;
use ledgersync_protocol::{
    decode, encode, HttpReply, PullPage, PullRequest, PushRequest, PushResponse, RemoteRecord,
    VersionRequest, VersionResponse,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Path of the push endpoint.
pub const PUSH_PATH: &str = "/sync/push";
/// Path of the pull endpoint.
pub const PULL_PATH: &str = "/sync/pull";
/// Path of the version lookup endpoint.
pub const VERSION_PATH: &str = "/sync/version";

/// An outgoing POST.
#[derive(Debug, Clone)]
pub struct HttpRequest<'a> {
    /// Absolute URL.
    pub url: String,
    /// CBOR request body.
    pub body: Vec<u8>,
    /// Bearer token, if configured.
    pub bearer: Option<&'a str>,
    /// Deadline for the whole exchange.
    pub timeout: Duration,
}

/// Failure to obtain any HTTP response.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// The server could not be reached.
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// No response within the deadline.
    #[error("timed out")]
    TimedOut,
}

/// HTTP client abstraction.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the status and body.
    fn post(&self, request: HttpRequest<'_>) -> Result<HttpReply, HttpError>;

    /// Checks if the client is healthy.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based remote adapter.
pub struct HttpRemote<C: HttpClient> {
    base_url: String,
    client: C,
    token: Option<String>,
    timeout: RwLock<Duration>,
    connected: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpRemote<C> {
    /// Creates a new HTTP adapter.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            token: None,
            timeout: RwLock::new(Duration::from_secs(30)),
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Sets the bearer token sent with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        *self.timeout.get_mut() = timeout;
        self
    }

    /// Returns the per-request timeout.
    pub fn timeout(&self) -> Duration {
        *self.timeout.read()
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn post_cbor<Req, Res>(&self, endpoint: &str, request: &Req) -> SyncResult<Res>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::TransientNetwork("adapter closed".into()));
        }

        let body = encode(request)?;
        let reply = self
            .client
            .post(HttpRequest {
                url: format!("{}{}", self.base_url, endpoint),
                body,
                bearer: self.token.as_deref(),
                timeout: self.timeout(),
            })
            .map_err(|e| self.fail(classify_transport(e)))?;

        if !reply.is_success() {
            return Err(self.fail(classify_status(reply.status, reply.error_message())));
        }
        *self.last_error.write() = None;
        Ok(decode(&reply.body)?)
    }

    fn fail(&self, err: SyncError) -> SyncError {
        tracing::debug!(error = %err, "remote request failed");
        *self.last_error.write() = Some(err.to_string());
        err
    }
}

impl<C: HttpClient> RemoteAdapter for HttpRemote<C> {
    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.post_cbor(PUSH_PATH, request)
    }

    fn pull(&self, request: &PullRequest) -> SyncResult<PullPage> {
        self.post_cbor(PULL_PATH, request)
    }

    fn version(&self, table_name: &str, record_id: &str) -> SyncResult<Option<RemoteRecord>> {
        let request = VersionRequest {
            table_name: table_name.to_string(),
            record_id: record_id.to_string(),
        };
        let response: VersionResponse = self.post_cbor(VERSION_PATH, &request)?;
        Ok(response.record)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write() = timeout;
    }
}

/// Maps a non-success status code to an error category.
pub fn classify_status(status: u16, message: String) -> SyncError {
    match status {
        401 | 403 => SyncError::Authentication(message),
        400 | 422 => SyncError::RemoteValidation(message),
        408 | 504 => SyncError::Timeout,
        429 | 500..=599 => SyncError::TransientNetwork(message),
        _ => SyncError::Protocol(format!("unexpected status {status}: {message}")),
    }
}

fn classify_transport(err: HttpError) -> SyncError {
    match err {
        HttpError::TimedOut => SyncError::Timeout,
        HttpError::Unreachable(reason) => SyncError::TransientNetwork(reason),
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a POST to `path` and returns the reply.
    fn handle_post(&self, path: &str, bearer: Option<&str>, body: &[u8]) -> HttpReply;
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    healthy: AtomicBool,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self {
            server,
            healthy: AtomicBool::new(true),
        }
    }

    /// Simulates losing or regaining the network.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Returns the wrapped server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn post(&self, request: HttpRequest<'_>) -> Result<HttpReply, HttpError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(HttpError::Unreachable("network down".into()));
        }
        let path = request
            .url
            .find("/sync/")
            .map(|i| &request.url[i..])
            .unwrap_or(&request.url);
        Ok(self.server.handle_post(path, request.bearer, &request.body))
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
