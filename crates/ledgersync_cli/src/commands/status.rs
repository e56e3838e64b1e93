//! Status command implementation.

use super::open_store;
use ledgersync_engine::{SyncConfig, SyncStatus};
use ledgersync_queue::QueueStore;
use serde::Serialize;
use std::path::Path;

/// Per-table view for output.
#[derive(Debug, Serialize)]
pub struct TableInfo {
    /// Table name.
    pub table_name: String,
    /// Conflict strategy.
    pub conflict_resolution: String,
    /// Whether the table participates in sync.
    pub sync_enabled: bool,
    /// Pull high-water mark, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pulled_at: Option<u64>,
}

/// Full status report.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Derived sync status.
    pub status: SyncStatus,
    /// Configured tables.
    pub tables: Vec<TableInfo>,
    /// Journal size in bytes.
    pub journal_bytes: u64,
}

/// Runs the status command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let enabled = SyncConfig::from_env()?.enabled;
    let report = collect(&store, enabled)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text(path, &report),
    }
    Ok(())
}

pub(crate) fn collect(
    store: &QueueStore,
    enabled: bool,
) -> Result<StatusReport, Box<dyn std::error::Error>> {
    let tables = store
        .tables()
        .into_iter()
        .map(|m| TableInfo {
            table_name: m.table_name,
            conflict_resolution: m.conflict_resolution.to_string(),
            sync_enabled: m.sync_enabled,
            last_pulled_at: m.last_pulled_at.map(|t| t.as_millis()),
        })
        .collect();
    Ok(StatusReport {
        status: SyncStatus::from_queue(store, enabled),
        tables,
        journal_bytes: store.journal_len()?,
    })
}

fn print_text(path: &Path, report: &StatusReport) {
    let s = &report.status;
    println!("Queue journal: {}", path.display());
    println!("  Size:            {} bytes", report.journal_bytes);
    println!("  Sync enabled:    {}", s.enabled);
    println!();
    println!("Entries:");
    println!("  Pending:         {}", s.pending);
    println!("  In flight:       {}", s.in_flight);
    println!("  Synced:          {}", s.synced);
    println!("  Failed:          {}", s.failed);
    println!("  Needs attention: {}", s.needs_attention);
    println!("  Total:           {}", s.total);
    println!();
    match s.last_cycle_at {
        Some(at) => println!("Last cycle:        {at}"),
        None => println!("Last cycle:        never"),
    }
    if let Some(at) = s.last_success_at {
        println!("Last success:      {at}");
    }
    if let Some(err) = &s.last_error {
        println!("Last error:        {err}");
    }
    if s.critical {
        println!("CRITICAL: the last cycle could not write the queue journal");
    }
    if !report.tables.is_empty() {
        println!();
        println!("Tables:");
        for t in &report.tables {
            println!(
                "  {:<20} {:<12} {}",
                t.table_name,
                t.conflict_resolution,
                if t.sync_enabled { "enabled" } else { "disabled" }
            );
        }
    }
}
