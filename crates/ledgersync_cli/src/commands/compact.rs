//! Compact command implementation.

use super::open_store;
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;

    println!("Compacting queue journal at {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
        println!("  Size:    {} bytes", store.journal_len()?);
        println!("  Entries: {}", store.counts().total);
        return Ok(());
    }

    let stats = store.compact()?;
    println!("  Size before: {} bytes", stats.bytes_before);
    println!("  Size after:  {} bytes", stats.bytes_after);
    println!("  Records:     {}", stats.records);
    println!(
        "  Space saved: {} bytes ({:.1}%)",
        stats.bytes_before.saturating_sub(stats.bytes_after),
        if stats.bytes_before > 0 {
            (stats.bytes_before.saturating_sub(stats.bytes_after) as f64
                / stats.bytes_before as f64)
                * 100.0
        } else {
            0.0
        }
    );
    println!("✓ Compaction complete");
    Ok(())
}
