//! CLI command implementations.

pub mod compact;
pub mod dump;
pub mod entries;
pub mod prune;
pub mod status;

use ledgersync_engine::SyncConfig;
use ledgersync_queue::QueueStore;
use std::path::Path;

/// Opens an existing journal. Never creates one.
pub(crate) fn open_store(path: &Path) -> Result<QueueStore, Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(format!("Journal not found: {}", path.display()).into());
    }
    let config = SyncConfig::from_env()?;
    Ok(QueueStore::open_file(path, config.queue_options())?)
}
