//! Dump command implementation.

use ledgersync_queue::{scan, JournalRecord};
use serde::Serialize;
use std::path::Path;

/// Journal record representation for output.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// Frame offset in the journal file.
    pub offset: u64,
    /// Record kind.
    pub kind: &'static str,
    /// Decoded record.
    pub record: JournalRecord,
}

/// Runs the dump command.
///
/// Reads the file directly so a torn tail is reported rather than repaired.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(format!("Journal not found: {}", path.display()).into());
    }
    let bytes = std::fs::read(path)?;
    let (records, torn_tail) = read_records(&bytes, limit)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&records)?),
        _ => {
            for r in &records {
                println!("{:>10}  {:<18} {}", r.offset, r.kind, summarize(&r.record));
            }
            println!();
            println!("{} records", records.len());
        }
    }
    if torn_tail {
        tracing::warn!("Journal ends with an incomplete frame");
    }
    Ok(())
}

pub(crate) fn read_records(
    bytes: &[u8],
    limit: Option<usize>,
) -> Result<(Vec<RecordInfo>, bool), Box<dyn std::error::Error>> {
    let scanned = scan(bytes)?;
    let records = scanned
        .records
        .into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|(offset, record)| RecordInfo {
            offset,
            kind: record.kind(),
            record,
        })
        .collect();
    Ok((records, scanned.torn_tail))
}

fn summarize(record: &JournalRecord) -> String {
    match record {
        JournalRecord::Enqueued { entry } => format!(
            "#{} {} {} ({})",
            entry.id,
            entry.operation,
            entry.key(),
            entry.status
        ),
        JournalRecord::InFlight { ids, .. }
        | JournalRecord::Synced { ids, .. }
        | JournalRecord::Released { ids, .. }
        | JournalRecord::Reset { ids, .. }
        | JournalRecord::Pruned { ids } => format!("ids={ids:?}"),
        JournalRecord::Failed { ids, reason, .. } | JournalRecord::Superseded { ids, reason, .. } => {
            format!("ids={ids:?} reason={reason}")
        }
        JournalRecord::PushCompleted { id, version, .. } => {
            format!("#{id} remote_version={}", version.remote_version)
        }
        JournalRecord::Retried { id, .. } => format!("#{id}"),
        JournalRecord::TableConfigured {
            table_name,
            conflict_resolution,
            sync_enabled,
        } => format!("{table_name} {conflict_resolution} enabled={sync_enabled}"),
        JournalRecord::TableSnapshot { metadata } => format!(
            "{} {} enabled={}",
            metadata.table_name, metadata.conflict_resolution, metadata.sync_enabled
        ),
        JournalRecord::PulledUpTo { table_name, at } => format!("{table_name} at={at}"),
        JournalRecord::VersionObserved { key, version } => {
            format!("{key} remote_version={}", version.remote_version)
        }
        JournalRecord::CycleFinished { cycle } => format!(
            "success={} pushed={} pulled={}",
            cycle.success, cycle.pushed, cycle.pulled
        ),
        JournalRecord::IdWatermark { next_id } => format!("next_id={next_id}"),
        JournalRecord::VersionForgotten { key } => key.to_string(),
    }
}
