//! Error types for queue operations.

use ledgersync_protocol::EntryStatus;
use std::io;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors that can occur while reading or mutating the queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// An I/O error occurred in the journal backend.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The journal contains a record that cannot be trusted.
    #[error("journal corrupted at offset {offset}: {reason}")]
    Corrupted {
        /// Offset of the offending frame.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// A journal record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// No entry with the given id exists.
    #[error("queue entry {0} not found")]
    NotFound(u64),

    /// The requested status change is not allowed from the entry's status.
    #[error("entry {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Entry id.
        id: u64,
        /// Current status.
        from: EntryStatus,
        /// Requested status.
        to: EntryStatus,
    },

    /// No metadata exists for the table.
    #[error("table '{0}' is not configured for sync")]
    UnknownTable(String),

    /// The journal backend refused the write.
    #[error("journal unavailable: {0}")]
    Unavailable(String),
}

impl QueueError {
    /// Creates a corruption error.
    pub fn corrupted(offset: u64, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            reason: reason.into(),
        }
    }

    /// Returns true if the error means the journal itself is unusable.
    #[must_use]
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            QueueError::Io(_) | QueueError::Corrupted { .. } | QueueError::Unavailable(_)
        )
    }
}
