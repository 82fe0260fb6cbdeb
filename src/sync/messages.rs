//! Sync Wire Records
//!
//! JSON records exchanged on the announce/request/response topics. Unknown
//! fields are ignored on decode so peers can add fields without breaking
//! older nodes.

use crate::error::Result;
use crate::index::ManifestEntry;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// One partition as described in an announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnouncedPartition {
    pub partition_id: u64,
    pub content_hash: String,
    #[serde(default)]
    pub row_count: usize,
    #[serde(default)]
    pub created_at_ms: u64,
}

impl From<&ManifestEntry> for AnnouncedPartition {
    fn from(entry: &ManifestEntry) -> Self {
        Self {
            partition_id: entry.partition_id,
            content_hash: entry.content_hash.clone(),
            row_count: entry.row_count,
            created_at_ms: entry.created_at_ms,
        }
    }
}

impl AnnouncedPartition {
    /// Manifest entry a consumer installs once the bytes validate
    pub fn to_manifest_entry(&self) -> ManifestEntry {
        ManifestEntry {
            partition_id: self.partition_id,
            file_name: format!("part-{:06}.col", self.partition_id),
            row_count: self.row_count,
            content_hash: self.content_hash.clone(),
            created_at_ms: self.created_at_ms,
        }
    }
}

/// Periodic manifest announcement from a coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionAnnouncement {
    pub node_id: String,
    #[serde(default)]
    pub partitions: Vec<AnnouncedPartition>,
}

/// A consumer asking for one partition it is missing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionRequest {
    pub requester: String,
    pub partition_id: u64,
}

/// A producer's reply: the partition body is in the content store under
/// `partition_fingerprint`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionResponse {
    pub partition_id: u64,
    pub partition_fingerprint: String,
}

/// Encode any sync message as JSON bytes
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Decode a sync message, ignoring unknown fields
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let ann = PartitionAnnouncement {
            node_id: "n1".into(),
            partitions: vec![AnnouncedPartition {
                partition_id: 7,
                content_hash: "abc123".into(),
                row_count: 42,
                created_at_ms: 1000,
            }],
        };
        let bytes = encode(&ann).unwrap();
        let back: PartitionAnnouncement = decode(&bytes).unwrap();
        assert_eq!(back.node_id, "n1");
        assert_eq!(back.partitions[0].partition_id, 7);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = br#"{
            "requester": "edge-1",
            "partition_id": 3,
            "priority": "high",
            "future_field": {"nested": true}
        }"#;
        let req: PartitionRequest = decode(json).unwrap();
        assert_eq!(req.requester, "edge-1");
        assert_eq!(req.partition_id, 3);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = br#"{"node_id": "n2", "partitions": [{"partition_id": 1, "content_hash": "ff"}]}"#;
        let ann: PartitionAnnouncement = decode(json).unwrap();
        assert_eq!(ann.partitions[0].row_count, 0);
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(decode::<PartitionRequest>(b"not json").is_err());
    }
}
