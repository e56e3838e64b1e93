//! # Ledgersync Engine
//!
//! Offline-first synchronization between a local-primary data store and a
//! remote store it does not control.
//!
//! This crate provides:
//! - Change capture (local write → queue entry)
//! - The remote adapter boundary, with HTTP and in-memory adapters
//! - The sync engine (push → pull → reconcile)
//! - Conflict resolution: local-first, remote-first, merge
//! - A tokio scheduler with startup, interval and on-demand triggers
//!
//! ## Architecture
//!
//! The engine implements a **push-then-pull** model:
//! 1. Drain the queue to the remote in bounded batches
//! 2. Pull remote changes per table since its high-water mark
//! 3. Reset retryable failures, prune old entries, recover missed changes
//!
//! ## Key Invariants
//!
//! - The queue store is the only sync state; the engine re-reads it every cycle
//! - Entries for one record reach the remote in creation order
//! - At most one cycle runs at a time; overlapping requests coalesce
//! - A table's high-water mark advances only after its pull window is applied
//! - Re-applying a remote record already seen is a no-op

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod capture;
mod config;
mod engine;
mod error;
mod flight;
mod http;
mod local;
mod merge;
mod remote;
mod scheduler;
mod status;

pub use capture::{ChangeCapture, ReconcileReport};
pub use config::{RetryConfig, SyncConfig};
pub use engine::{CycleOutcome, CycleReport, SyncEngine};
pub use error::{CaptureError, ErrorKind, SyncError, SyncResult};
pub use flight::SingleFlight;
pub use http::{
    classify_status, HttpClient, HttpError, HttpRemote, HttpRequest, LoopbackClient,
    LoopbackServer, PULL_PATH, PUSH_PATH, VERSION_PATH,
};
pub use local::{LocalRecord, LocalStore, MemoryLocalStore};
pub use merge::{FieldMerger, MergeRegistry, RecordMerger};
pub use remote::{MockRemote, PullStream, RemoteAdapter};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use status::{SyncPhase, SyncStatus};
