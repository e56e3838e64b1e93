//! Journal records and their on-disk framing.
//!
//! Every mutation of the queue is one record. A frame is laid out as:
//!
//! ```text
//! magic "LSQJ" (4) | version u16 LE (2) | body length u32 LE (4) | CBOR body | crc32 LE (4)
//! ```
//!
//! The checksum covers the header and the body. A frame cut short at the
//! end of the journal is a torn write from a crash and marks the end of the
//! log; a checksum mismatch anywhere is corruption.

use crate::error::{QueueError, QueueResult};
use ledgersync_protocol::{
    ConflictStrategy, QueueEntry, RecordKey, RecordVersion, SyncMetadata, Timestamp,
};
use serde::{Deserialize, Serialize};

/// Magic bytes opening every frame.
pub const JOURNAL_MAGIC: [u8; 4] = *b"LSQJ";

/// Current frame format version.
pub const JOURNAL_VERSION: u16 = 1;

const HEADER_SIZE: usize = 10;
const CRC_SIZE: usize = 4;

/// Summary of one finished sync cycle, kept for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// When the cycle started.
    pub started_at: Timestamp,
    /// When the cycle finished.
    pub finished_at: Timestamp,
    /// Whether every phase ran to completion.
    pub success: bool,
    /// Error that ended the cycle early, or the last entry-level error.
    pub error: Option<String>,
    /// Whether the cycle was aborted by a local storage failure.
    pub critical: bool,
    /// Entries acknowledged by the remote.
    pub pushed: u64,
    /// Remote records applied locally.
    pub pulled: u64,
}

/// One journaled mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalRecord {
    /// A new entry, or an entry snapshot written by compaction.
    Enqueued {
        /// The full entry.
        entry: QueueEntry,
    },
    /// Entries claimed by a sync cycle.
    InFlight {
        /// Claimed ids.
        ids: Vec<u64>,
        /// Claim time.
        at: Timestamp,
    },
    /// Entries acknowledged without version information.
    Synced {
        /// Acknowledged ids.
        ids: Vec<u64>,
        /// Acknowledgment time.
        at: Timestamp,
    },
    /// An entry acknowledged by the remote at a known version.
    PushCompleted {
        /// Acknowledged id.
        id: u64,
        /// Remote version after the write.
        version: RecordVersion,
        /// Acknowledgment time.
        at: Timestamp,
    },
    /// Entries whose push failed.
    Failed {
        /// Failed ids.
        ids: Vec<u64>,
        /// Failure reason.
        reason: String,
        /// Failure time.
        at: Timestamp,
    },
    /// In-flight entries returned to pending without spending retry budget.
    Released {
        /// Released ids.
        ids: Vec<u64>,
        /// Release time.
        at: Timestamp,
    },
    /// Entries dropped in favour of a remote change.
    Superseded {
        /// Superseded ids.
        ids: Vec<u64>,
        /// Why the entries were dropped.
        reason: String,
        /// Supersede time.
        at: Timestamp,
    },
    /// Failed entries moved back to pending for another attempt.
    Reset {
        /// Reset ids.
        ids: Vec<u64>,
        /// Reset time.
        at: Timestamp,
    },
    /// A parked entry re-armed by an operator, retry budget cleared.
    Retried {
        /// Entry id.
        id: u64,
        /// Retry time.
        at: Timestamp,
    },
    /// Synced entries removed by retention.
    Pruned {
        /// Removed ids.
        ids: Vec<u64>,
    },
    /// Table conflict strategy or enablement changed.
    TableConfigured {
        /// Table name.
        table_name: String,
        /// Conflict strategy.
        conflict_resolution: ConflictStrategy,
        /// Whether the table participates in sync.
        sync_enabled: bool,
    },
    /// Full table metadata written by compaction.
    TableSnapshot {
        /// Metadata snapshot.
        metadata: SyncMetadata,
    },
    /// A pull window was fully applied up to `at`.
    PulledUpTo {
        /// Table name.
        table_name: String,
        /// New high-water mark.
        at: Timestamp,
    },
    /// The remote version of a record was observed during a pull.
    VersionObserved {
        /// Record key.
        key: RecordKey,
        /// Observed version.
        version: RecordVersion,
    },
    /// A sync cycle finished.
    CycleFinished {
        /// Cycle summary.
        cycle: CycleRecord,
    },
    /// Lowest id the next enqueue may use.
    IdWatermark {
        /// Next id.
        next_id: u64,
    },
    /// The remote version of a deleted record is no longer tracked.
    VersionForgotten {
        /// Record key.
        key: RecordKey,
    },
}

impl JournalRecord {
    /// Returns a short name for logging and dumps.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::InFlight { .. } => "in_flight",
            Self::Synced { .. } => "synced",
            Self::PushCompleted { .. } => "push_completed",
            Self::Failed { .. } => "failed",
            Self::Released { .. } => "released",
            Self::Superseded { .. } => "superseded",
            Self::Reset { .. } => "reset",
            Self::Retried { .. } => "retried",
            Self::Pruned { .. } => "pruned",
            Self::TableConfigured { .. } => "table_configured",
            Self::TableSnapshot { .. } => "table_snapshot",
            Self::PulledUpTo { .. } => "pulled_up_to",
            Self::VersionObserved { .. } => "version_observed",
            Self::CycleFinished { .. } => "cycle_finished",
            Self::IdWatermark { .. } => "id_watermark",
            Self::VersionForgotten { .. } => "version_forgotten",
        }
    }

    /// Encodes the record as a checksummed frame.
    pub fn encode_frame(&self) -> QueueResult<Vec<u8>> {
        let mut body = Vec::new();
        ciborium::into_writer(self, &mut body).map_err(|e| QueueError::Codec(e.to_string()))?;
        let len = u32::try_from(body.len())
            .map_err(|_| QueueError::Codec(format!("record of {} bytes is too large", body.len())))?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len() + CRC_SIZE);
        frame.extend_from_slice(&JOURNAL_MAGIC);
        frame.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);
        let crc = compute_crc32(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }
}

/// Result of scanning a journal.
#[derive(Debug, Default)]
pub struct JournalScan {
    /// Valid records with their frame offsets.
    pub records: Vec<(u64, JournalRecord)>,
    /// Length of the valid prefix.
    pub valid_len: u64,
    /// Whether an incomplete frame followed the valid prefix.
    pub torn_tail: bool,
}

/// Decodes every frame in `bytes`.
///
/// # Errors
///
/// Returns [`QueueError::Corrupted`] on a bad magic, unsupported version,
/// checksum mismatch or undecodable body.
pub fn scan(bytes: &[u8]) -> QueueResult<JournalScan> {
    let mut out = JournalScan::default();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let offset = pos as u64;
        let rest = &bytes[pos..];
        if rest.len() < HEADER_SIZE {
            out.torn_tail = true;
            break;
        }
        if rest[0..4] != JOURNAL_MAGIC {
            return Err(QueueError::corrupted(offset, "invalid magic"));
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version > JOURNAL_VERSION {
            return Err(QueueError::corrupted(
                offset,
                format!("unsupported version {version}"),
            ));
        }
        let len = u32::from_le_bytes([rest[6], rest[7], rest[8], rest[9]]) as usize;
        let frame_len = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < frame_len {
            out.torn_tail = true;
            break;
        }

        let checked = &rest[..HEADER_SIZE + len];
        let stored = &rest[HEADER_SIZE + len..frame_len];
        let stored = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        if compute_crc32(checked) != stored {
            return Err(QueueError::corrupted(offset, "checksum mismatch"));
        }

        let record: JournalRecord = ciborium::from_reader(&rest[HEADER_SIZE..HEADER_SIZE + len])
            .map_err(|e| QueueError::corrupted(offset, format!("undecodable record: {e}")))?;
        out.records.push((offset, record));
        pos += frame_len;
        out.valid_len = pos as u64;
    }

    Ok(out)
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgersync_protocol::{EntryStatus, Operation};
    use serde_json::json;

    fn enqueued(id: u64) -> JournalRecord {
        JournalRecord::Enqueued {
            entry: QueueEntry {
                id,
                table_name: "contacts".into(),
                record_id: format!("c{id}"),
                operation: Operation::Create,
                payload: Some(json!({"name": "Ada"})),
                status: EntryStatus::Pending,
                retry_count: 0,
                last_error: None,
                created_at: Timestamp::from_millis(10),
                updated_at: Timestamp::from_millis(10),
                synced_at: None,
            },
        }
    }

    fn frames(records: &[JournalRecord]) -> Vec<u8> {
        records
            .iter()
            .flat_map(|r| r.encode_frame().unwrap())
            .collect()
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn scan_reads_all_frames() {
        let bytes = frames(&[
            enqueued(1),
            JournalRecord::Failed {
                ids: vec![1],
                reason: "timeout".into(),
                at: Timestamp::from_millis(20),
            },
        ]);
        let scan = scan(&bytes).unwrap();
        assert_eq!(scan.records.len(), 2);
        assert_eq!(scan.records[0].0, 0);
        assert_eq!(scan.records[1].1.kind(), "failed");
        assert_eq!(scan.valid_len, bytes.len() as u64);
        assert!(!scan.torn_tail);
    }

    #[test]
    fn torn_tail_ends_the_log() {
        let mut bytes = frames(&[enqueued(1), enqueued(2)]);
        let first_len = enqueued(1).encode_frame().unwrap().len() as u64;
        bytes.truncate(bytes.len() - 3);

        let scan = scan(&bytes).unwrap();
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.valid_len, first_len);
        assert!(scan.torn_tail);
    }

    #[test]
    fn flipped_byte_is_corruption() {
        let mut bytes = frames(&[enqueued(1)]);
        bytes[HEADER_SIZE + 2] ^= 0xFF;
        assert!(matches!(
            scan(&bytes),
            Err(QueueError::Corrupted { offset: 0, .. })
        ));
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut bytes = frames(&[enqueued(1)]);
        bytes[0] = b'X';
        assert!(matches!(scan(&bytes), Err(QueueError::Corrupted { .. })));
    }
}
