//! # Ledgersync Server
//!
//! Reference remote store for ledgersync clients.
//!
//! This crate provides:
//! - Sync endpoints (push, pull, version lookup) over CBOR bodies
//! - Versioned record tables with tombstones and a monotonic clock
//! - Optimistic concurrency on checked writes
//! - Authentication (HMAC-SHA256 bearer tokens)
//! - Per-table payload validation
//!
//! # Authentication
//!
//! Authentication is optional:
//!
//! ```rust
//! use ledgersync_server::{ServerConfig, SyncServer};
//!
//! let config = ServerConfig::default().with_auth(b"my-secure-secret".to_vec());
//! let server = SyncServer::new(config);
//! let token = server.create_token("desk-01");
//! assert!(token.is_some());
//! ```
//!
//! # Protocol
//!
//! 1. Client pushes each queued mutation with the version it last saw
//! 2. Server applies it, or answers with the current copy on a version mismatch
//! 3. Client pulls changes ordered by `(remote_updated_at, record_id)`

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod server;
mod tables;

pub use auth::{AuthConfig, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::RequestHandler;
pub use server::SyncServer;
pub use tables::RemoteTables;
