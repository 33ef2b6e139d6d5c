//! Database-inline block storage
//!
//! Block bytes travel with the block row; archives are reassembled to a
//! local directory.

use async_trait::async_trait;
use fleet_core::{ArchiveLocation, BlockData, CarveBlock};
use std::path::Path;

use super::local::ArchiveDir;
use super::traits::{Artifact, ArchiveTarget, BackendType, BlockKey, BlockStore, HealthStatus};
use crate::error::StorageResult;

/// Inline block store
pub struct InlineBlockStore {
    archives: ArchiveDir,
}

impl InlineBlockStore {
    pub async fn new(archive_path: impl AsRef<Path>) -> StorageResult<Self> {
        Ok(Self {
            archives: ArchiveDir::new(archive_path).await?,
        })
    }
}

#[async_trait]
impl BlockStore for InlineBlockStore {
    fn backend_type(&self) -> BackendType {
        BackendType::Db
    }

    async fn put_block(&self, _key: &BlockKey, data: &[u8]) -> StorageResult<BlockData> {
        Ok(BlockData::Inline(data.to_vec()))
    }

    async fn find_archive(&self, target: &ArchiveTarget) -> StorageResult<Option<ArchiveLocation>> {
        Ok(self.archives.find(target).await)
    }

    async fn archive(&self, target: &ArchiveTarget, blocks: &[CarveBlock]) -> StorageResult<ArchiveLocation> {
        self.archives.assemble(target, blocks).await
    }

    async fn download(&self, location: &ArchiveLocation) -> StorageResult<Artifact> {
        self.archives.download(location).await
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        if self.archives.path().is_dir() {
            Ok(HealthStatus::healthy())
        } else {
            Ok(HealthStatus::unhealthy("archive directory missing"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_inline_blocks_archive_to_disk() {
        let temp_dir = TempDir::new().unwrap();
        let store = InlineBlockStore::new(temp_dir.path()).await.unwrap();
        let key = BlockKey {
            environment: "acme".into(),
            uuid: "N1".into(),
            session_id: "s".into(),
            block_id: 0,
        };
        let data = store.put_block(&key, b"hello").await.unwrap();
        assert_eq!(data, BlockData::Inline(b"hello".to_vec()));

        let block = CarveBlock {
            session_id: "s".into(),
            block_id: 0,
            size: 5,
            data,
            created_at: Utc::now(),
        };
        let target = ArchiveTarget {
            environment: "acme".into(),
            uuid: "N1".into(),
            session_id: "s".into(),
            path: "/tmp/x".into(),
        };
        let location = store.archive(&target, &[block]).await.unwrap();
        let ArchiveLocation::Local { path } = location else {
            panic!("expected local archive");
        };
        assert_eq!(tokio::fs::read(path).await.unwrap(), b"hello");
    }
}
