//! Local Filesystem Block Storage Backend
//!
//! Blocks are written to `{base}/blocks/{environment}/{uuid}/{session}/{block}`
//! and reassembled archives to `{base}/archives/`.

use async_trait::async_trait;
use fleet_core::{ArchiveLocation, BlockData, CarveBlock};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::traits::{
    archive_extension, Artifact, ArchiveTarget, BackendType, BlockKey, BlockStore, HealthStatus,
};
use crate::error::{StorageError, StorageResult};

/// Directory holding reassembled archives
pub struct ArchiveDir {
    path: PathBuf,
}

impl ArchiveDir {
    pub async fn new(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path).await.map_err(|e| {
            StorageError::Backend(format!("Failed to create directory {:?}: {}", path, e))
        })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Existing archive for `target`, either plain or zstd
    pub async fn find(&self, target: &ArchiveTarget) -> Option<ArchiveLocation> {
        for ext in ["tar", "tar.zst"] {
            let path = self.path.join(format!("{}.{}", target.file_stem(), ext));
            if fs::metadata(&path).await.is_ok() {
                return Some(ArchiveLocation::Local { path });
            }
        }
        None
    }

    /// Concatenate blocks, in the given order, into one archive file.
    ///
    /// Only one block is held in memory at a time.
    pub async fn assemble(&self, target: &ArchiveTarget, blocks: &[CarveBlock]) -> StorageResult<ArchiveLocation> {
        let (first, rest) = match blocks.split_first() {
            Some((first, rest)) => (read_block(&first.data).await?, rest),
            None => (Vec::new(), blocks),
        };
        let ext = archive_extension(&first);

        let final_path = self.path.join(format!("{}.{}", target.file_stem(), ext));
        let partial = self.path.join(format!("{}.{}.partial", target.file_stem(), ext));

        if let Err(e) = write_archive(&partial, first, rest).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e);
        }

        fs::rename(&partial, &final_path)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Failed to finalize archive: {}", e)))?;

        info!(path = ?final_path, blocks = blocks.len(), "Carve archived");
        Ok(ArchiveLocation::Local { path: final_path })
    }

    pub async fn download(&self, location: &ArchiveLocation) -> StorageResult<Artifact> {
        let ArchiveLocation::Local { path } = location else {
            return Err(StorageError::UnsupportedReference(format!("{:?}", location)));
        };
        let meta = fs::metadata(path)
            .await
            .map_err(|_| StorageError::NotFound(path.display().to_string()))?;
        Ok(Artifact::File {
            path: path.clone(),
            size: meta.len(),
            file_name: location.file_name(),
        })
    }
}

async fn write_archive(partial: &Path, first: Vec<u8>, rest: &[CarveBlock]) -> StorageResult<()> {
    let mut file = fs::File::create(partial)
        .await
        .map_err(|e| StorageError::WriteFailed(format!("Failed to create archive: {}", e)))?;
    file.write_all(&first)
        .await
        .map_err(|e| StorageError::WriteFailed(format!("Failed to write archive: {}", e)))?;
    drop(first);
    for block in rest {
        let chunk = read_block(&block.data).await?;
        file.write_all(&chunk)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Failed to write archive: {}", e)))?;
    }
    file.sync_all()
        .await
        .map_err(|e| StorageError::WriteFailed(format!("Failed to sync archive: {}", e)))
}

/// Read the bytes behind an inline or local block reference
pub async fn read_block(data: &BlockData) -> StorageResult<Vec<u8>> {
    match data {
        BlockData::Inline(bytes) => Ok(bytes.clone()),
        BlockData::Local(path) => fs::read(path)
            .await
            .map_err(|e| StorageError::ReadFailed(format!("Failed to read block {:?}: {}", path, e))),
        BlockData::Remote(url) => Err(StorageError::UnsupportedReference(url.clone())),
    }
}

/// Local filesystem block store
pub struct LocalBlockStore {
    blocks_path: PathBuf,
    archives: ArchiveDir,
}

impl LocalBlockStore {
    /// Create a new local block store rooted at `base_path`
    pub async fn new(base_path: impl AsRef<Path>) -> StorageResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        let blocks_path = base_path.join("blocks");
        fs::create_dir_all(&blocks_path).await.map_err(|e| {
            StorageError::Backend(format!("Failed to create directory {:?}: {}", blocks_path, e))
        })?;
        let archives = ArchiveDir::new(base_path.join("archives")).await?;

        info!("Initialized local carve storage at {:?}", base_path);

        Ok(Self {
            blocks_path,
            archives,
        })
    }

    fn block_path(&self, key: &BlockKey) -> PathBuf {
        self.blocks_path.join(key.object_key())
    }
}

#[async_trait]
impl BlockStore for LocalBlockStore {
    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }

    async fn put_block(&self, key: &BlockKey, data: &[u8]) -> StorageResult<BlockData> {
        let path = self.block_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::WriteFailed(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }

        // Write-then-rename so a retried block fully replaces its slot
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Failed to create block file: {}", e)))?;
        file.write_all(data)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Failed to write block: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Failed to sync block: {}", e)))?;
        drop(file);
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Failed to finalize block: {}", e)))?;

        debug!("Stored block {} ({} bytes)", key.object_key(), data.len());
        Ok(BlockData::Local(path))
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
        match fs::metadata(&self.blocks_path).await {
            Ok(meta) if meta.is_dir() => Ok(HealthStatus::healthy()),
            Ok(_) => Ok(HealthStatus::unhealthy("blocks path is not a directory")),
            Err(e) => Ok(HealthStatus::unhealthy(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    async fn create_test_backend() -> (LocalBlockStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBlockStore::new(temp_dir.path()).await.unwrap();
        (backend, temp_dir)
    }

    fn key(block_id: u64) -> BlockKey {
        BlockKey {
            environment: "acme".into(),
            uuid: "N1".into(),
            session_id: "s1".into(),
            block_id,
        }
    }

    fn target() -> ArchiveTarget {
        ArchiveTarget {
            environment: "acme".into(),
            uuid: "N1".into(),
            session_id: "s1".into(),
            path: "/var/log/syslog".into(),
        }
    }

    async fn stored(backend: &LocalBlockStore, id: u64, data: &[u8]) -> CarveBlock {
        let reference = backend.put_block(&key(id), data).await.unwrap();
        CarveBlock {
            session_id: "s1".into(),
            block_id: id,
            size: data.len() as u64,
            data: reference,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_put_block_overwrites_slot() {
        let (backend, _temp_dir) = create_test_backend().await;

        backend.put_block(&key(0), b"first").await.unwrap();
        let reference = backend.put_block(&key(0), b"second").await.unwrap();

        assert_eq!(read_block(&reference).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_archive_concatenates_and_is_found_again() {
        let (backend, _temp_dir) = create_test_backend().await;

        let b1 = stored(&backend, 1, b"BBBB").await;
        let b0 = stored(&backend, 0, b"AAAA").await;
        let b2 = stored(&backend, 2, b"CC").await;

        assert!(backend.find_archive(&target()).await.unwrap().is_none());

        let location = backend.archive(&target(), &[b0, b1, b2]).await.unwrap();
        let ArchiveLocation::Local { path } = &location else {
            panic!("expected local archive");
        };
        assert!(path.to_string_lossy().ends_with("N1_s1_-var-log-syslog.tar"));
        assert_eq!(fs::read(path).await.unwrap(), b"AAAABBBBCC");

        assert_eq!(backend.find_archive(&target()).await.unwrap(), Some(location.clone()));

        match backend.download(&location).await.unwrap() {
            Artifact::File { size, file_name, .. } => {
                assert_eq!(size, 10);
                assert_eq!(file_name, "N1_s1_-var-log-syslog.tar");
            }
            other => panic!("unexpected artifact {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zstd_archive_extension() {
        let (backend, _temp_dir) = create_test_backend().await;
        let b0 = stored(&backend, 0, &[0x28, 0xb5, 0x2f, 0xfd, 1, 2]).await;

        let location = backend.archive(&target(), &[b0]).await.unwrap();
        assert!(location.file_name().ends_with(".tar.zst"));
    }

    #[tokio::test]
    async fn test_hostile_uuid_stays_under_blocks_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("carves");
        let backend = LocalBlockStore::new(&root).await.unwrap();

        let hostile = BlockKey {
            environment: "acme".into(),
            uuid: "../../../ESCAPED".into(),
            session_id: "s".into(),
            block_id: 0,
        };
        let reference = backend.put_block(&hostile, b"data").await.unwrap();

        let BlockData::Local(path) = reference else {
            panic!("expected a local block");
        };
        assert!(path.starts_with(root.join("blocks")));
        assert!(!temp_dir.path().join("ESCAPED").exists());
        assert_eq!(fs::read(&path).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_missing_block_leaves_no_partial_archive() {
        let (backend, temp_dir) = create_test_backend().await;
        let b0 = stored(&backend, 0, b"AAAA").await;
        let gone = CarveBlock {
            session_id: "s1".into(),
            block_id: 1,
            size: 4,
            data: BlockData::Local(temp_dir.path().join("missing")),
            created_at: Utc::now(),
        };

        assert!(backend.archive(&target(), &[b0, gone]).await.is_err());
        let mut entries = fs::read_dir(temp_dir.path().join("archives")).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_health_check() {
        let (backend, _temp_dir) = create_test_backend().await;
        assert!(backend.health_check().await.unwrap().healthy);
    }
}
