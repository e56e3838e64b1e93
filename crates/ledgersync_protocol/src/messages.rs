//! Wire messages exchanged with the remote store.
//!
//! Bodies are CBOR-encoded with [`encode`] and [`decode`].

use crate::entry::{Payload, RecordKey, RecordVersion};
use crate::error::{ProtocolError, ProtocolResult};
use crate::time::Timestamp;
use crate::types::Operation;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A record as it currently exists on the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Record identifier.
    pub record_id: String,
    /// Remote field snapshot; `None` when the record was deleted remotely.
    pub payload: Option<Payload>,
    /// Remote optimistic-concurrency version.
    pub remote_version: u64,
    /// Remote modification time.
    pub remote_updated_at: Timestamp,
}

impl RemoteRecord {
    /// Returns true if the remote copy is a deletion marker.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    /// Returns the version information carried by this record.
    #[must_use]
    pub fn version(&self) -> RecordVersion {
        RecordVersion {
            remote_version: self.remote_version,
            remote_updated_at: self.remote_updated_at,
        }
    }

    /// Returns the key of this record within `table_name`.
    #[must_use]
    pub fn key(&self, table_name: &str) -> RecordKey {
        RecordKey::new(table_name, &self.record_id)
    }
}

/// Whether a push honors the remote's optimistic-concurrency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    /// Rejected with a conflict unless `base_version` matches the remote.
    #[default]
    Checked,
    /// Written regardless of the remote version.
    Overwrite,
}

/// Sends one queued mutation to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Target table.
    pub table_name: String,
    /// Target record.
    pub record_id: String,
    /// Kind of mutation.
    pub operation: Operation,
    /// Field snapshot for create/update.
    pub payload: Option<Payload>,
    /// Remote version the local change was based on, if known.
    pub base_version: Option<u64>,
    /// Concurrency mode.
    pub mode: WriteMode,
}

impl PushRequest {
    /// Returns true if a checked write must be rejected in favor of `current`.
    ///
    /// A write without a base version may land on a tombstone: the client
    /// never saw the record, and neither does anyone else any more.
    #[must_use]
    pub fn conflicts_with(&self, current: &RemoteRecord) -> bool {
        if self.mode != WriteMode::Checked {
            return false;
        }
        if current.is_tombstone() && self.base_version.is_none() {
            return false;
        }
        self.base_version != Some(current.remote_version)
    }
}

/// Outcome of a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Whether the write was applied.
    pub accepted: bool,
    /// Remote version after the write, or the current version on conflict.
    pub remote_version: u64,
    /// Remote modification time after the write.
    pub remote_updated_at: Timestamp,
    /// The remote copy that caused a rejection.
    pub conflict: Option<RemoteRecord>,
}

impl PushResponse {
    /// An accepted write.
    #[must_use]
    pub fn accepted(remote_version: u64, remote_updated_at: Timestamp) -> Self {
        Self {
            accepted: true,
            remote_version,
            remote_updated_at,
            conflict: None,
        }
    }

    /// A write rejected because `current` changed after the local base version.
    #[must_use]
    pub fn conflict(current: RemoteRecord) -> Self {
        Self {
            accepted: false,
            remote_version: current.remote_version,
            remote_updated_at: current.remote_updated_at,
            conflict: Some(current),
        }
    }

    /// Returns the version the remote reported.
    #[must_use]
    pub fn version(&self) -> RecordVersion {
        RecordVersion {
            remote_version: self.remote_version,
            remote_updated_at: self.remote_updated_at,
        }
    }
}

/// Keyset position inside a pull window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullCursor {
    /// Modification time of the last record received.
    pub remote_updated_at: Timestamp,
    /// Identifier of the last record received.
    pub record_id: String,
}

/// Requests one page of remote changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Table to read.
    pub table_name: String,
    /// Inclusive lower bound on `remote_updated_at`.
    pub since: Timestamp,
    /// Resume strictly after this position within the window.
    pub after: Option<PullCursor>,
    /// Maximum records in the page.
    pub limit: u32,
}

/// One page of remote changes, ordered by `(remote_updated_at, record_id)`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PullPage {
    /// Records in the page.
    pub records: Vec<RemoteRecord>,
    /// Whether another page follows.
    pub has_more: bool,
}

/// Asks for the current remote copy of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRequest {
    /// Table to read.
    pub table_name: String,
    /// Record to read.
    pub record_id: String,
}

/// The current remote copy, if the record exists remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionResponse {
    /// Remote copy; absent when the record was never written.
    pub record: Option<RemoteRecord>,
}

/// Body returned with non-success statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable reason.
    pub message: String,
}

/// A status code and body, as returned by an HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpReply {
    /// A 200 reply carrying `body`.
    #[must_use]
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }

    /// An error reply carrying an encoded [`ErrorBody`].
    #[must_use]
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        let body = encode(&ErrorBody {
            message: message.into(),
        })
        .unwrap_or_default();
        Self { status, body }
    }

    /// Returns true for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Extracts the error message from a non-success body.
    #[must_use]
    pub fn error_message(&self) -> String {
        decode::<ErrorBody>(&self.body)
            .map(|b| b.message)
            .unwrap_or_else(|_| format!("HTTP {}", self.status))
    }
}

/// Encodes a message as CBOR.
pub fn encode<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR message.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_request_survives_cbor() {
        let request = PushRequest {
            table_name: "contacts".into(),
            record_id: "c1".into(),
            operation: Operation::Update,
            payload: Some(json!({"name": "Ada", "age": 36, "tags": ["vip"], "score": 1.5})),
            base_version: Some(4),
            mode: WriteMode::Overwrite,
        };
        let bytes = encode(&request).unwrap();
        assert_eq!(decode::<PushRequest>(&bytes).unwrap(), request);
    }

    #[test]
    fn checked_write_conflicts_on_stale_base() {
        let mut request = PushRequest {
            table_name: "contacts".into(),
            record_id: "c1".into(),
            operation: Operation::Create,
            payload: Some(json!({"name": "Ada"})),
            base_version: None,
            mode: WriteMode::Checked,
        };
        let live = RemoteRecord {
            record_id: "c1".into(),
            payload: Some(json!({"name": "Grace"})),
            remote_version: 3,
            remote_updated_at: Timestamp::from_millis(5),
        };
        let tombstone = RemoteRecord {
            payload: None,
            ..live.clone()
        };

        assert!(request.conflicts_with(&live));
        assert!(!request.conflicts_with(&tombstone));

        request.base_version = Some(2);
        assert!(request.conflicts_with(&live));
        assert!(request.conflicts_with(&tombstone));

        request.base_version = Some(3);
        assert!(!request.conflicts_with(&live));

        request.base_version = Some(1);
        request.mode = WriteMode::Overwrite;
        assert!(!request.conflicts_with(&live));
    }

    #[test]
    fn tombstone_has_no_payload() {
        let record = RemoteRecord {
            record_id: "c1".into(),
            payload: None,
            remote_version: 3,
            remote_updated_at: Timestamp::from_millis(99),
        };
        assert!(record.is_tombstone());
        let page = PullPage {
            records: vec![record.clone()],
            has_more: false,
        };
        let decoded: PullPage = decode(&encode(&page).unwrap()).unwrap();
        assert_eq!(decoded.records[0], record);
    }

    #[test]
    fn conflict_response_reports_current_version() {
        let current = RemoteRecord {
            record_id: "c1".into(),
            payload: Some(json!({"name": "Grace"})),
            remote_version: 7,
            remote_updated_at: Timestamp::from_millis(500),
        };
        let response = PushResponse::conflict(current.clone());
        assert!(!response.accepted);
        assert_eq!(response.version(), current.version());
    }

    #[test]
    fn error_reply_message() {
        let reply = HttpReply::error(422, "missing field 'name'");
        assert!(!reply.is_success());
        assert_eq!(reply.error_message(), "missing field 'name'");

        let garbage = HttpReply {
            status: 502,
            body: vec![0xff],
        };
        assert_eq!(garbage.error_message(), "HTTP 502");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode::<PullPage>(&[0xff, 0x00]),
            Err(ProtocolError::Decode(_))
        ));
    }
}
