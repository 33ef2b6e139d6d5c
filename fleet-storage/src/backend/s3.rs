//! S3-Compatible Block Storage Backend
//!
//! Blocks are uploaded as individual objects. Archival builds the final
//! object with a multipart upload whose parts are server-side copies of the
//! block objects, so block bytes never pass back through the service.

use async_trait::async_trait;
use fleet_core::{ArchiveLocation, BlockData, CarveBlock, PRESIGNED_URL_EXPIRY_SECS};
use tracing::{debug, info, warn};

use super::traits::{
    archive_extension, Artifact, ArchiveTarget, BackendType, BlockKey, BlockStore, HealthStatus,
};
use crate::error::{StorageError, StorageResult};
use crate::s3::{CompletedPart, S3Client, S3Config, MAX_PARTS, MIN_PART_SIZE};

/// S3 block store
pub struct S3BlockStore {
    client: S3Client,
}

impl S3BlockStore {
    pub fn new(config: S3Config) -> StorageResult<Self> {
        Ok(Self {
            client: S3Client::new(config)?,
        })
    }

    pub fn client(&self) -> &S3Client {
        &self.client
    }

    fn block_key(&self, block: &CarveBlock) -> StorageResult<String> {
        match &block.data {
            BlockData::Remote(url) => self.client.key_from_url(url),
            other => Err(StorageError::UnsupportedReference(format!(
                "{} block {} in S3 store",
                other.kind(),
                block.block_id
            ))),
        }
    }

    /// Every part but the last must meet the S3 minimum for copy-only assembly,
    /// and one part per block must fit under the part number ceiling
    fn copyable(blocks: &[CarveBlock]) -> bool {
        if blocks.len() > MAX_PARTS {
            return false;
        }
        match blocks.split_last() {
            Some((_, rest)) => rest.iter().all(|b| b.size >= MIN_PART_SIZE),
            None => false,
        }
    }

    async fn copy_parts(&self, key: &str, upload_id: &str, blocks: &[CarveBlock]) -> StorageResult<Vec<CompletedPart>> {
        let mut parts = Vec::with_capacity(blocks.len());
        for block in blocks {
            let source = self.block_key(block)?;
            let part_number = block.block_id as u32 + 1;
            let part = self
                .client
                .upload_part_copy(key, upload_id, part_number, &source)
                .await?;
            parts.push(part);
        }
        Ok(parts)
    }

    /// Re-upload blocks, coalescing them into parts large enough for the carve
    /// to fit in the part number ceiling
    async fn buffered_parts(&self, key: &str, upload_id: &str, blocks: &[CarveBlock]) -> StorageResult<Vec<CompletedPart>> {
        let part_size = buffered_part_size(blocks);
        let mut parts = Vec::new();
        let mut buffer: Vec<u8> = Vec::new();
        for block in blocks {
            let source = self.block_key(block)?;
            buffer.extend(self.client.get_object(&source).await?);
            if buffer.len() as u64 >= part_size {
                let part_number = parts.len() as u32 + 1;
                let part = self
                    .client
                    .upload_part(key, upload_id, part_number, std::mem::take(&mut buffer))
                    .await?;
                parts.push(part);
            }
        }
        if !buffer.is_empty() || parts.is_empty() {
            let part_number = parts.len() as u32 + 1;
            parts.push(self.client.upload_part(key, upload_id, part_number, buffer).await?);
        }
        Ok(parts)
    }
}

fn buffered_part_size(blocks: &[CarveBlock]) -> u64 {
    let total: u64 = blocks.iter().map(|b| b.size).sum();
    MIN_PART_SIZE.max(total.div_ceil(MAX_PARTS as u64))
}

#[async_trait]
impl BlockStore for S3BlockStore {
    fn backend_type(&self) -> BackendType {
        BackendType::S3
    }

    async fn put_block(&self, key: &BlockKey, data: &[u8]) -> StorageResult<BlockData> {
        let object_key = self.client.full_key(&key.object_key());
        self.client
            .put_object(&object_key, data.to_vec(), "application/octet-stream")
            .await?;
        debug!("Uploaded block {} ({} bytes)", object_key, data.len());
        Ok(BlockData::Remote(self.client.object_url(&object_key)))
    }

    async fn find_archive(&self, target: &ArchiveTarget) -> StorageResult<Option<ArchiveLocation>> {
        let base = self.client.full_key(&target.object_key());
        for ext in ["tar", "tar.zst"] {
            let key = format!("{}.{}", base, ext);
            if self.client.head_object(&key).await? {
                return Ok(Some(ArchiveLocation::Remote {
                    bucket: self.client.bucket().to_string(),
                    key,
                }));
            }
        }
        Ok(None)
    }

    async fn archive(&self, target: &ArchiveTarget, blocks: &[CarveBlock]) -> StorageResult<ArchiveLocation> {
        let first = blocks
            .first()
            .ok_or_else(|| StorageError::IntegrityFailed("carve has no blocks".to_string()))?;
        let head = self.client.get_object_prefix(&self.block_key(first)?, 4).await?;
        let key = format!(
            "{}.{}",
            self.client.full_key(&target.object_key()),
            archive_extension(&head)
        );

        let upload_id = self.client.create_multipart_upload(&key).await?;
        let parts = if Self::copyable(blocks) {
            self.copy_parts(&key, &upload_id, blocks).await
        } else {
            debug!(key = %key, blocks = blocks.len(), "Blocks not copyable as parts, re-uploading buffered parts");
            self.buffered_parts(&key, &upload_id, blocks).await
        };

        let parts = match parts {
            Ok(parts) => parts,
            Err(e) => {
                warn!(key = %key, error = %e, "Carve archive failed, aborting upload");
                self.client.abort_multipart_upload(&key, &upload_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .client
            .complete_multipart_upload(&key, &upload_id, &parts)
            .await
        {
            self.client.abort_multipart_upload(&key, &upload_id).await;
            return Err(e);
        }

        info!(key = %key, parts = parts.len(), "Carve archived to S3");
        Ok(ArchiveLocation::Remote {
            bucket: self.client.bucket().to_string(),
            key,
        })
    }

    async fn download(&self, location: &ArchiveLocation) -> StorageResult<Artifact> {
        let ArchiveLocation::Remote { key, .. } = location else {
            return Err(StorageError::UnsupportedReference(format!("{:?}", location)));
        };
        let url = self.client.presign_get(key, PRESIGNED_URL_EXPIRY_SECS)?;
        Ok(Artifact::Presigned {
            url,
            expires_in_secs: PRESIGNED_URL_EXPIRY_SECS,
        })
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match self.client.head_object(&self.client.full_key(".health")).await {
            Ok(_) => Ok(HealthStatus::healthy()),
            Err(e) => Ok(HealthStatus::unhealthy(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn remote_block(id: u64, size: u64) -> CarveBlock {
        CarveBlock {
            session_id: "s".into(),
            block_id: id,
            size,
            data: BlockData::Remote(format!("s3://carves/acme/N1/s/{}", id)),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_copyable_requires_minimum_part_size() {
        let big = MIN_PART_SIZE;
        assert!(S3BlockStore::copyable(&[remote_block(0, big), remote_block(1, 10)]));
        assert!(S3BlockStore::copyable(&[remote_block(0, 10)]));
        assert!(!S3BlockStore::copyable(&[remote_block(0, 10), remote_block(1, big)]));
        assert!(!S3BlockStore::copyable(&[]));
    }

    #[test]
    fn test_copyable_caps_part_count() {
        let at_limit: Vec<_> = (0..MAX_PARTS as u64).map(|i| remote_block(i, MIN_PART_SIZE)).collect();
        assert!(S3BlockStore::copyable(&at_limit));

        let over: Vec<_> = (0..=MAX_PARTS as u64).map(|i| remote_block(i, MIN_PART_SIZE)).collect();
        assert!(!S3BlockStore::copyable(&over));
    }

    #[test]
    fn test_buffered_part_size_grows_with_carve() {
        assert_eq!(buffered_part_size(&[remote_block(0, 10)]), MIN_PART_SIZE);

        let huge: Vec<_> = (0..20_000).map(|i| remote_block(i, MIN_PART_SIZE)).collect();
        let size = buffered_part_size(&huge);
        assert_eq!(size, 2 * MIN_PART_SIZE);
        assert!(20_000 * MIN_PART_SIZE / size <= MAX_PARTS as u64);
    }

    #[test]
    fn test_block_key_rejects_local_refs() {
        let store = S3BlockStore::new(S3Config::minio("http://localhost:9000", "carves")).unwrap();
        assert_eq!(store.block_key(&remote_block(2, 1)).unwrap(), "acme/N1/s/2");

        let mut local = remote_block(0, 1);
        local.data = BlockData::Local("/tmp/x".into());
        assert!(matches!(
            store.block_key(&local),
            Err(StorageError::UnsupportedReference(_))
        ));
    }

    #[tokio::test]
    async fn test_download_is_presigned() {
        let store = S3BlockStore::new(
            S3Config::minio("http://localhost:9000", "carves").with_credentials("AK", "SK"),
        )
        .unwrap();
        let artifact = store
            .download(&ArchiveLocation::Remote {
                bucket: "carves".into(),
                key: "acme/N1/s/-etc-hosts.tar".into(),
            })
            .await
            .unwrap();
        match artifact {
            Artifact::Presigned { url, expires_in_secs } => {
                assert_eq!(expires_in_secs, 300);
                assert!(url.starts_with("http://localhost:9000/carves/acme/N1/s/-etc-hosts.tar?"));
            }
            other => panic!("unexpected artifact {:?}", other),
        }
    }
}
