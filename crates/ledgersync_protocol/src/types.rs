//! Enumerations for operations, entry status and conflict strategy.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of local mutation a queue entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// A record was inserted.
    Create,
    /// A record was modified.
    Update,
    /// A record was removed.
    Delete,
}

impl Operation {
    /// Returns the lowercase name used in logs and wire bodies.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Returns true if the operation carries a field snapshot.
    #[must_use]
    pub const fn carries_payload(self) -> bool {
        !matches!(self, Operation::Delete)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" | "insert" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(ProtocolError::UnknownVariant {
                kind: "operation",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryStatus {
    /// Waiting to be pushed.
    Pending,
    /// Claimed by the running sync cycle.
    InFlight,
    /// Acknowledged by the remote, or superseded by a remote change.
    Synced,
    /// The last push attempt failed.
    Failed,
}

impl EntryStatus {
    /// Returns the lowercase name used in logs and CLI output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::InFlight => "in_flight",
            EntryStatus::Synced => "synced",
            EntryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a table resolves a record changed both locally and remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// The pending local change is force-written over the remote copy.
    #[default]
    LocalFirst,
    /// The remote copy overwrites local state and the local change is dropped.
    RemoteFirst,
    /// A registered merge function combines both copies.
    Merge,
}

impl ConflictStrategy {
    /// Returns the configuration name of the strategy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ConflictStrategy::LocalFirst => "local-first",
            ConflictStrategy::RemoteFirst => "remote-first",
            ConflictStrategy::Merge => "merge",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local-first" | "local_first" | "local" => Ok(ConflictStrategy::LocalFirst),
            "remote-first" | "remote_first" | "remote" => Ok(ConflictStrategy::RemoteFirst),
            "merge" => Ok(ConflictStrategy::Merge),
            other => Err(ProtocolError::UnknownVariant {
                kind: "conflict strategy",
                value: other.to_string(),
            }),
        }
    }
}
