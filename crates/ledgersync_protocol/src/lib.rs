//! # Ledgersync Protocol
//!
//! Data types shared by every ledgersync crate.
//!
//! This crate provides:
//! - [`QueueEntry`] and [`SyncMetadata`], the persisted sync state
//! - [`RemoteRecord`] and the push/pull/version wire messages
//! - [`Timestamp`], a millisecond wall-clock instant
//! - CBOR encoding helpers for wire bodies
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entry;
mod error;
mod messages;
mod time;
mod types;

pub use entry::{NewEntry, Payload, QueueEntry, RecordKey, RecordVersion, SyncMetadata};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    decode, encode, ErrorBody, HttpReply, PullCursor, PullPage, PullRequest, PushRequest,
    PushResponse, RemoteRecord, VersionRequest, VersionResponse, WriteMode,
};
pub use time::Timestamp;
pub use types::{ConflictStrategy, EntryStatus, Operation};
