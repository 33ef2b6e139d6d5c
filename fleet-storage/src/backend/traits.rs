//! Carve Block Storage Backend Trait

use async_trait::async_trait;
use fleet_core::ids::path_component;
use fleet_core::{ArchiveLocation, BlockData, CarveBlock};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::StorageResult;

/// Block storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Blocks kept inline in the database
    Db,
    /// Local filesystem
    Local,
    /// S3-compatible object storage
    S3,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Db => "db",
            Self::Local => "local",
            Self::S3 => "s3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "db" => Some(Self::Db),
            "local" => Some(Self::Local),
            "s3" => Some(Self::S3),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slot of one block: `{environment}/{uuid}/{session}/{block}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockKey {
    pub environment: String,
    pub uuid: String,
    pub session_id: String,
    pub block_id: u64,
}

impl BlockKey {
    /// `environment/uuid/session/block`, each segment confined to one component
    pub fn object_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            path_component(&self.environment),
            path_component(&self.uuid),
            path_component(&self.session_id),
            self.block_id
        )
    }
}

/// The carve being reassembled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveTarget {
    pub environment: String,
    pub uuid: String,
    pub session_id: String,
    /// Carved path on the node
    pub path: String,
}

impl ArchiveTarget {
    /// Carved path made safe for file names and object keys
    pub fn sanitized_path(&self) -> String {
        path_component(&self.path)
    }

    /// Local archive file name without extension
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}_{}",
            path_component(&self.uuid),
            path_component(&self.session_id),
            self.sanitized_path()
        )
    }

    /// Object key of the archive without extension
    pub fn object_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            path_component(&self.environment),
            path_component(&self.uuid),
            path_component(&self.session_id),
            self.sanitized_path()
        )
    }
}

/// Archive file extension for the given leading bytes
pub fn archive_extension(head: &[u8]) -> &'static str {
    if head.len() >= 4 && head[..4] == fleet_core::ZSTD_MAGIC {
        "tar.zst"
    } else {
        "tar"
    }
}

/// A downloadable carve
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// Stream this local file
    File {
        path: PathBuf,
        size: u64,
        file_name: String,
    },
    /// Redirect to a short-lived link
    Presigned { url: String, expires_in_secs: u64 },
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: Option<String>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
        }
    }
}

/// Carve block storage backend
#[async_trait]
pub trait BlockStore: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// Store one block, overwriting any earlier copy of the same slot
    async fn put_block(&self, key: &BlockKey, data: &[u8]) -> StorageResult<BlockData>;

    /// An archive already produced for this target, if any
    async fn find_archive(&self, target: &ArchiveTarget) -> StorageResult<Option<ArchiveLocation>>;

    /// Reassemble `blocks` into one object.
    ///
    /// `blocks` must be sorted by ascending block id and cover 0..N-1.
    async fn archive(&self, target: &ArchiveTarget, blocks: &[CarveBlock]) -> StorageResult<ArchiveLocation>;

    /// Resolve an archive into something a client can download
    async fn download(&self, location: &ArchiveLocation) -> StorageResult<Artifact>;

    async fn health_check(&self) -> StorageResult<HealthStatus>;
}

/// Check that `blocks` are exactly 0..N-1 in order and sum to `expected_size`
pub fn verify_blocks(blocks: &[CarveBlock], block_count: u64, expected_size: u64) -> StorageResult<()> {
    use crate::error::StorageError;

    if blocks.len() as u64 != block_count {
        return Err(StorageError::IntegrityFailed(format!(
            "expected {} blocks, found {}",
            block_count,
            blocks.len()
        )));
    }
    for (index, block) in blocks.iter().enumerate() {
        if block.block_id != index as u64 {
            return Err(StorageError::IntegrityFailed(format!(
                "missing block {}",
                index
            )));
        }
    }
    let total: u64 = blocks.iter().map(|b| b.size).sum();
    if expected_size > 0 && total != expected_size {
        return Err(StorageError::IntegrityFailed(format!(
            "size mismatch: carve declared {} bytes, blocks hold {}",
            expected_size, total
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn block(id: u64, size: u64) -> CarveBlock {
        CarveBlock {
            session_id: "s".into(),
            block_id: id,
            size,
            data: BlockData::Inline(vec![0; size as usize]),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_keys() {
        let key = BlockKey {
            environment: "acme".into(),
            uuid: "N1".into(),
            session_id: "s1".into(),
            block_id: 3,
        };
        assert_eq!(key.object_key(), "acme/N1/s1/3");

        let target = ArchiveTarget {
            environment: "acme".into(),
            uuid: "N1".into(),
            session_id: "s1".into(),
            path: "/etc/hosts".into(),
        };
        assert_eq!(target.file_stem(), "N1_s1_-etc-hosts");
        assert_eq!(target.object_key(), "acme/N1/s1/-etc-hosts");
    }

    #[test]
    fn test_keys_never_climb_out_of_their_prefix() {
        let key = BlockKey {
            environment: "acme".into(),
            uuid: "../../../ESCAPED".into(),
            session_id: "..".into(),
            block_id: 0,
        };
        let object_key = key.object_key();
        assert_eq!(object_key, "acme/..-..-..-ESCAPED/__/0");
        assert!(object_key.split('/').all(|segment| segment != ".."));

        let target = ArchiveTarget {
            environment: "acme".into(),
            uuid: "../x".into(),
            session_id: "s1".into(),
            path: "/etc/hosts".into(),
        };
        assert_eq!(target.file_stem(), "..-x_s1_-etc-hosts");
        assert!(!target.file_stem().contains('/'));
    }

    #[test]
    fn test_archive_extension() {
        assert_eq!(archive_extension(&[0x28, 0xb5, 0x2f, 0xfd, 0x00]), "tar.zst");
        assert_eq!(archive_extension(b"ustar"), "tar");
        assert_eq!(archive_extension(&[0x28]), "tar");
    }

    #[test]
    fn test_verify_blocks() {
        assert!(verify_blocks(&[block(0, 4), block(1, 2)], 2, 6).is_ok());
        assert!(verify_blocks(&[block(0, 4)], 2, 6).is_err());
        assert!(verify_blocks(&[block(0, 4), block(2, 2)], 2, 6).is_err());
        assert!(verify_blocks(&[block(0, 4), block(1, 2)], 2, 7).is_err());
    }
}
