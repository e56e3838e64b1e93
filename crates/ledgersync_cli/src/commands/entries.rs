//! Failed-entry listing and manual retry.

use super::open_store;
use ledgersync_protocol::{EntryStatus, QueueEntry};
use ledgersync_queue::QueueStore;
use serde::Serialize;
use std::path::Path;

/// Failed entry representation for output.
#[derive(Debug, Serialize)]
pub struct FailedEntryInfo {
    /// Entry id.
    pub id: u64,
    /// `table/record` key.
    pub key: String,
    /// Operation name.
    pub operation: String,
    /// Attempts so far.
    pub retry_count: u32,
    /// Whether the entry is past the retry cap.
    pub parked: bool,
    /// Most recent failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Runs the failed command.
pub fn list_failed(
    path: &Path,
    parked_only: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let entries = failed_entries(&store, parked_only);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&entries)?),
        _ => {
            if entries.is_empty() {
                println!("No failed entries");
            }
            for e in &entries {
                println!(
                    "#{:<6} {:<8} {:<30} attempts={}{}",
                    e.id,
                    e.operation,
                    e.key,
                    e.retry_count,
                    if e.parked { " (needs attention)" } else { "" }
                );
                if let Some(err) = &e.last_error {
                    println!("        {err}");
                }
            }
        }
    }
    Ok(())
}

pub(crate) fn failed_entries(store: &QueueStore, parked_only: bool) -> Vec<FailedEntryInfo> {
    let max_retries = store.max_retries();
    let entries: Vec<QueueEntry> = if parked_only {
        store.parked_entries()
    } else {
        store.entries(Some(EntryStatus::Failed))
    };
    entries
        .into_iter()
        .map(|e| FailedEntryInfo {
            id: e.id,
            key: e.key().to_string(),
            operation: e.operation.to_string(),
            retry_count: e.retry_count,
            parked: e.is_parked(max_retries),
            last_error: e.last_error,
        })
        .collect()
}

/// Runs the retry command.
pub fn retry(path: &Path, id: u64) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let entry = store.retry_entry(id)?;
    tracing::info!(entry_id = id, key = %entry.key(), "Entry re-armed");
    println!("✓ Entry #{id} ({}) will be pushed on the next cycle", entry.key());
    Ok(())
}
