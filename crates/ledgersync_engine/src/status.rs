//! Derived sync status for the UI and operator layers.

use ledgersync_protocol::Timestamp;
use ledgersync_queue::{CycleRecord, QueueCounts, QueueStore};
use serde::Serialize;
use std::fmt;

/// Phase of the running cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// No cycle running.
    #[default]
    Idle,
    /// Draining the queue to the remote.
    Pushing,
    /// Applying remote changes locally.
    Pulling,
    /// Resetting retryable failures, pruning, and recording the outcome.
    Reconciling,
}

impl SyncPhase {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        !matches!(self, SyncPhase::Idle)
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Pushing => "pushing",
            SyncPhase::Pulling => "pulling",
            SyncPhase::Reconciling => "reconciling",
        })
    }
}

/// Snapshot of sync health, computed on demand from the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Entries waiting to be pushed.
    pub pending: usize,
    /// Entries claimed by the running cycle.
    pub in_flight: usize,
    /// Entries acknowledged or superseded and not yet pruned.
    pub synced: usize,
    /// Failed entries that will be retried.
    pub failed: usize,
    /// Failed entries past the retry cap, waiting for manual review.
    pub needs_attention: usize,
    /// All retained entries.
    pub total: usize,
    /// Start of the last successful cycle.
    pub last_success_at: Option<Timestamp>,
    /// End of the most recent cycle.
    pub last_cycle_at: Option<Timestamp>,
    /// Error of the most recent cycle.
    pub last_error: Option<String>,
    /// The most recent cycle aborted because the queue store failed.
    pub critical: bool,
    /// A cycle is running.
    pub is_syncing: bool,
    /// Sync is switched on.
    pub enabled: bool,
    /// Phase of the running cycle.
    pub phase: SyncPhase,
}

impl SyncStatus {
    /// Computes the status of a queue no engine is running against.
    pub fn from_queue(queue: &QueueStore, enabled: bool) -> Self {
        Self::compute(
            queue.counts(),
            queue.last_cycle().as_ref(),
            queue.last_successful_cycle().as_ref(),
            SyncPhase::Idle,
            enabled,
        )
    }

    pub(crate) fn compute(
        counts: QueueCounts,
        last_cycle: Option<&CycleRecord>,
        last_success: Option<&CycleRecord>,
        phase: SyncPhase,
        enabled: bool,
    ) -> Self {
        Self {
            pending: counts.pending,
            in_flight: counts.in_flight,
            synced: counts.synced,
            failed: counts.failed - counts.parked,
            needs_attention: counts.parked,
            total: counts.total,
            last_success_at: last_success.map(|c| c.started_at),
            last_cycle_at: last_cycle.map(|c| c.finished_at),
            last_error: last_cycle.and_then(|c| c.error.clone()),
            critical: last_cycle.is_some_and(|c| c.critical),
            is_syncing: phase.is_active(),
            enabled,
            phase,
        }
    }

    /// Returns true if nothing is waiting and nothing needs attention.
    pub fn is_clean(&self) -> bool {
        self.pending == 0 && self.in_flight == 0 && self.failed == 0 && self.needs_attention == 0
    }
}
