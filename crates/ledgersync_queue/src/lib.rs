//! # Ledgersync Queue
//!
//! The queue store: a durable, ordered record of local mutations that
//! still have to reach the remote, plus the per-table sync metadata.
//!
//! ## Design
//!
//! - One append-only journal of checksummed CBOR records is the only state
//! - The journal is replayed on open; in-flight entries return to pending
//! - Every operation is a single journal append under one lock
//! - Entries for the same record are released for push strictly in
//!   creation order
//!
//! ## Example
//!
//! ```rust
//! use ledgersync_protocol::{EntryStatus, NewEntry};
//! use ledgersync_queue::{QueueOptions, QueueStore};
//! use serde_json::json;
//!
//! let queue = QueueStore::in_memory(QueueOptions::default()).unwrap();
//! let entry = queue.enqueue(NewEntry::update("contacts", "c1", json!({"name": "Ada"}))).unwrap();
//!
//! let batch = queue.next_batch(50).unwrap();
//! queue.mark_in_flight(&[entry.id]).unwrap();
//! queue.mark_synced(&[entry.id]).unwrap();
//! assert_eq!(queue.get(entry.id).unwrap().status, EntryStatus::Synced);
//! # assert_eq!(batch.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod backend;
mod error;
mod journal;
mod state;
mod store;

pub use backend::{FileJournal, JournalBackend, MemoryJournal};
pub use error::{QueueError, QueueResult};
pub use journal::{
    compute_crc32, scan, CycleRecord, JournalRecord, JournalScan, JOURNAL_MAGIC, JOURNAL_VERSION,
};
pub use store::{
    CompactStats, QueueCounts, QueueOptions, QueueStore, DEFAULT_COMPACT_THRESHOLD,
};
