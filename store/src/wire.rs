//! Replicated operation payloads.
//!
//! Everything crossing the wire replicator is one of these structs, encoded
//! with the length-framed bincode codec. Field order is part of the format;
//! do not reorder fields.

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::error::CResult;
use crate::local::{Lsn, StoreItem};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationOperationKind {
    Copy = 0,
    Insert = 1,
    Update = 2,
    Delete = 3,
}

impl std::fmt::Display for ReplicationOperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplicationOperationKind::Copy => "Copy",
            ReplicationOperationKind::Insert => "Insert",
            ReplicationOperationKind::Update => "Update",
            ReplicationOperationKind::Delete => "Delete",
        };
        write!(f, "{}", s)
    }
}

/// One row write inside a replicated batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationOperation {
    pub kind: ReplicationOperationKind,
    pub item_type: String,
    pub key: String,
    /// Key rename target for updates; None leaves the key unchanged.
    pub new_key: Option<String>,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
    pub operation_lsn: Lsn,
    pub last_modified_on_primary_utc: Option<DateTime<Utc>>,
}

impl ReplicationOperation {
    pub fn insert(item_type: &str, key: &str, bytes: Vec<u8>) -> Self {
        Self::new(ReplicationOperationKind::Insert, item_type, key, None, bytes, 0, None)
    }

    pub fn update(item_type: &str, key: &str, new_key: Option<&str>, bytes: Vec<u8>) -> Self {
        Self::new(ReplicationOperationKind::Update, item_type, key, new_key, bytes, 0, None)
    }

    pub fn delete(item_type: &str, key: &str) -> Self {
        Self::new(ReplicationOperationKind::Delete, item_type, key, None, Vec::new(), 0, None)
    }

    pub fn copy(item: &StoreItem) -> Self {
        Self::new(
            ReplicationOperationKind::Copy,
            &item.item_type,
            &item.key,
            None,
            item.value.clone(),
            item.operation_lsn,
            item.last_modified_on_primary_utc,
        )
    }

    pub fn copy_metadata(item_type: &str, key: &str, bytes: Vec<u8>, lsn: Lsn) -> Self {
        Self::new(ReplicationOperationKind::Copy, item_type, key, None, bytes, lsn, None)
    }

    fn new(
        kind: ReplicationOperationKind,
        item_type: &str,
        key: &str,
        new_key: Option<&str>,
        bytes: Vec<u8>,
        operation_lsn: Lsn,
        last_modified_on_primary_utc: Option<DateTime<Utc>>,
    ) -> Self {
        ReplicationOperation {
            kind,
            item_type: item_type.to_string(),
            key: key.to_string(),
            new_key: new_key.map(|k| k.to_string()),
            bytes,
            operation_lsn,
            last_modified_on_primary_utc,
        }
    }

    /// Rough serialized footprint, used when paging copy streams. It does
    /// not need to be exact, only stable.
    pub fn approximate_size(&self) -> usize {
        self.item_type.len()
            + self.key.len()
            + self.new_key.as_ref().map_or(0, |k| k.len())
            + self.bytes.len()
            + 4   // kind tag
            + 8   // operation lsn
            + 12 // timestamp
    }
}

/// One committed primary batch; the unit of replication.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AtomicOperation {
    pub activity_id: Uuid,
    pub operations: Vec<ReplicationOperation>,
    pub last_quorum_acked_lsn: Lsn,
}

impl AtomicOperation {
    pub fn new(
        activity_id: Uuid,
        operations: Vec<ReplicationOperation>,
        last_quorum_acked_lsn: Lsn,
    ) -> Self {
        AtomicOperation { activity_id, operations, last_quorum_acked_lsn }
    }

    pub fn encode(&self) -> CResult<Vec<u8>> {
        FrameCodec::new().encode(self)
    }

    pub fn decode(buf: &[u8]) -> CResult<Self> {
        FrameCodec::new().decode(buf)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyType {
    PagedCopy = 0,
    FirstFullCopy = 1,
    FirstPartialCopy = 2,
    FirstSnapshotPartialCopy = 3,
    FileStreamFullCopy = 4,
    FileStreamRebuildCopy = 5,
}

impl std::fmt::Display for CopyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CopyType::PagedCopy => "PagedCopy",
            CopyType::FirstFullCopy => "FirstFullCopy",
            CopyType::FirstPartialCopy => "FirstPartialCopy",
            CopyType::FirstSnapshotPartialCopy => "FirstSnapshotPartialCopy",
            CopyType::FileStreamFullCopy => "FileStreamFullCopy",
            CopyType::FileStreamRebuildCopy => "FileStreamRebuildCopy",
        };
        write!(f, "{}", s)
    }
}

/// A chunk of the zipped backup streamed during physical full builds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileStreamCopyOperationData {
    pub is_first_chunk: bool,
    pub is_last_chunk: bool,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
    pub operation_lsn: Lsn,
}

/// One page of the copy stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CopyOperation {
    /// Obsolete field preserved for peers that only sent this flag.
    pub is_first_full_copy: bool,
    pub operations: Vec<ReplicationOperation>,
    pub copy_type: CopyType,
    pub file_stream_data: Option<FileStreamCopyOperationData>,
}

impl CopyOperation {
    pub fn new(copy_type: CopyType, operations: Vec<ReplicationOperation>) -> Self {
        CopyOperation {
            is_first_full_copy: copy_type == CopyType::FirstFullCopy,
            operations,
            copy_type,
            file_stream_data: None,
        }
    }

    pub fn new_file_stream(data: FileStreamCopyOperationData, rebuild: bool) -> Self {
        CopyOperation {
            is_first_full_copy: false,
            operations: Vec::new(),
            copy_type: if rebuild {
                CopyType::FileStreamRebuildCopy
            } else {
                CopyType::FileStreamFullCopy
            },
            file_stream_data: Some(data),
        }
    }

    /// Backwards compatibility: old peers sent only the legacy flag with the
    /// default copy type.
    pub fn copy_type(&self) -> CopyType {
        if self.is_first_full_copy {
            CopyType::FirstFullCopy
        } else {
            self.copy_type
        }
    }

    pub fn is_empty(&self) -> bool {
        self.copy_type != CopyType::FileStreamFullCopy
            && self.copy_type != CopyType::FileStreamRebuildCopy
            && self.operations.is_empty()
    }

    pub fn encode(&self) -> CResult<Vec<u8>> {
        FrameCodec::new().encode(self)
    }

    pub fn decode(buf: &[u8]) -> CResult<Self> {
        FrameCodec::new().decode(buf)
    }
}

/// The secondary's self-description, sent upstream to negotiate the build.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CopyContextData {
    pub id: String,
    pub is_epoch_valid: bool,
    pub epoch: crate::progress::Epoch,
    pub last_operation_lsn: Lsn,
    pub replica_id: u64,
    pub is_file_stream_full_copy_supported: bool,
}

impl CopyContextData {
    pub fn encode(&self) -> CResult<Vec<u8>> {
        FrameCodec::new().encode(self)
    }

    pub fn decode(buf: &[u8]) -> CResult<Self> {
        FrameCodec::new().decode(buf)
    }
}
