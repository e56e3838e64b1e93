//! Per-table merge functions for the merge conflict strategy.

use ledgersync_protocol::Payload;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Combines a local and a remote payload into one.
pub trait RecordMerger: Send + Sync {
    /// Returns the merged payload.
    fn merge(&self, table_name: &str, local: &Payload, remote: &Payload) -> Payload;
}

impl<F> RecordMerger for F
where
    F: Fn(&str, &Payload, &Payload) -> Payload + Send + Sync,
{
    fn merge(&self, table_name: &str, local: &Payload, remote: &Payload) -> Payload {
        self(table_name, local, remote)
    }
}

/// Shallow object merge: remote fields first, local fields on top.
///
/// Non-object payloads resolve to the local value.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMerger;

impl RecordMerger for FieldMerger {
    fn merge(&self, _table_name: &str, local: &Payload, remote: &Payload) -> Payload {
        match (local, remote) {
            (Payload::Object(l), Payload::Object(r)) => {
                let mut merged = r.clone();
                for (k, v) in l {
                    merged.insert(k.clone(), v.clone());
                }
                Payload::Object(merged)
            }
            _ => local.clone(),
        }
    }
}

/// Table-to-merger lookup.
#[derive(Clone, Default)]
pub struct MergeRegistry {
    mergers: HashMap<String, Arc<dyn RecordMerger>>,
}

impl MergeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the merger for a table, replacing any previous one.
    pub fn register(&mut self, table_name: impl Into<String>, merger: impl RecordMerger + 'static) {
        self.mergers.insert(table_name.into(), Arc::new(merger));
    }

    /// Returns the merger for a table.
    pub fn get(&self, table_name: &str) -> Option<Arc<dyn RecordMerger>> {
        self.mergers.get(table_name).cloned()
    }

    /// Merges with the table's merger, if one is registered.
    pub fn merge(&self, table_name: &str, local: &Payload, remote: &Payload) -> Option<Payload> {
        self.mergers
            .get(table_name)
            .map(|m| m.merge(table_name, local, remote))
    }
}

impl fmt::Debug for MergeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tables: Vec<&String> = self.mergers.keys().collect();
        tables.sort();
        f.debug_struct("MergeRegistry").field("tables", &tables).finish()
    }
}
