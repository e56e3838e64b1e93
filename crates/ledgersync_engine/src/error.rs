//! Error types for the sync engine.

use ledgersync_protocol::ProtocolError;
use ledgersync_queue::QueueError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Broad classification of a [`SyncError`], used for routing and status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network unreachable or remote temporarily failing.
    TransientNetwork,
    /// A request exceeded its deadline.
    Timeout,
    /// Credentials were rejected.
    Authentication,
    /// The remote rejected a payload as malformed.
    RemoteValidation,
    /// The queue store is unavailable.
    LocalStorage,
    /// A remote change could not be written to the local data layer.
    LocalApply,
    /// A message could not be encoded or decoded, or the remote misbehaved.
    Protocol,
    /// The cycle was cancelled by shutdown.
    Cancelled,
    /// Sync is switched off.
    Disabled,
    /// Configuration is invalid.
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Authentication => "authentication",
            ErrorKind::RemoteValidation => "remote_validation",
            ErrorKind::LocalStorage => "local_storage",
            ErrorKind::LocalApply => "local_apply",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Disabled => "disabled",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network unreachable or the remote failed temporarily.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// A request exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// The remote rejected the credentials.
    #[error("authentication rejected: {0}")]
    Authentication(String),

    /// The remote rejected the payload.
    #[error("remote validation failed: {0}")]
    RemoteValidation(String),

    /// The queue store failed.
    #[error("local storage error: {0}")]
    LocalStorage(#[from] QueueError),

    /// The local data layer refused a remote change.
    #[error("local apply failed for {table}/{record_id}: {message}")]
    LocalApply {
        /// Table of the record.
        table: String,
        /// Record identifier.
        record_id: String,
        /// Reason reported by the data layer.
        message: String,
    },

    /// Encoding, decoding or protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The cycle stopped because of a shutdown request.
    #[error("sync cancelled")]
    Cancelled,

    /// Sync is disabled by configuration.
    #[error("sync is disabled")]
    Disabled,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Errors reported by change capture to the local data layer.
///
/// A capture failure does not undo the local write; it tells the caller the
/// change is not yet durable for sync.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The change is missing a table or record identifier.
    #[error("invalid change: {0}")]
    InvalidChange(String),

    /// The queue could not record the change; it is held for reconciliation.
    #[error("change for {table}/{record_id} not queued ({backlog} held for retry): {source}")]
    Enqueue {
        /// Table of the record.
        table: String,
        /// Record identifier.
        record_id: String,
        /// Changes now held in the backlog.
        backlog: usize,
        /// Underlying queue failure.
        #[source]
        source: QueueError,
    },
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl SyncError {
    /// Creates a local apply error.
    pub fn local_apply(
        table: impl Into<String>,
        record_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::LocalApply {
            table: table.into(),
            record_id: record_id.into(),
            message: message.into(),
        }
    }

    /// Returns the error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::TransientNetwork(_) => ErrorKind::TransientNetwork,
            SyncError::Timeout => ErrorKind::Timeout,
            SyncError::Authentication(_) => ErrorKind::Authentication,
            SyncError::RemoteValidation(_) => ErrorKind::RemoteValidation,
            SyncError::LocalStorage(_) => ErrorKind::LocalStorage,
            SyncError::LocalApply { .. } => ErrorKind::LocalApply,
            SyncError::Protocol(_) => ErrorKind::Protocol,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Disabled => ErrorKind::Disabled,
            SyncError::Config(_) => ErrorKind::Config,
        }
    }

    /// Returns true if retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_) | SyncError::Timeout)
    }

    /// Returns true if the error ends the whole cycle rather than one entry.
    ///
    /// Rejected credentials would fail every remaining entry identically, and
    /// a failing queue store leaves nothing safe to do.
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Authentication(_) | SyncError::LocalStorage(_) | SyncError::Cancelled
        )
    }

    /// Returns true if the error should be reported as critical.
    pub fn is_critical(&self) -> bool {
        matches!(self, SyncError::LocalStorage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::TransientNetwork("connection reset".into()).is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(!SyncError::RemoteValidation("missing name".into()).is_retryable());
        assert!(!SyncError::Authentication("expired".into()).is_retryable());
    }

    #[test]
    fn cycle_fatal_errors() {
        assert!(SyncError::Authentication("expired".into()).is_cycle_fatal());
        assert!(SyncError::LocalStorage(QueueError::Unavailable("disk".into())).is_cycle_fatal());
        assert!(!SyncError::Timeout.is_cycle_fatal());
        assert!(!SyncError::RemoteValidation("bad".into()).is_cycle_fatal());
        assert!(!SyncError::local_apply("contacts", "c1", "locked").is_cycle_fatal());
    }

    #[test]
    fn kinds_and_display() {
        let err = SyncError::local_apply("contacts", "c1", "row locked");
        assert_eq!(err.kind(), ErrorKind::LocalApply);
        assert_eq!(err.to_string(), "local apply failed for contacts/c1: row locked");
        assert_eq!(ErrorKind::RemoteValidation.to_string(), "remote_validation");
        assert!(SyncError::LocalStorage(QueueError::NotFound(1)).is_critical());
    }
}
