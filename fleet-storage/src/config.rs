//! Carver backend configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::{BackendType, BlockStore, InlineBlockStore, LocalBlockStore, S3BlockStore};
use crate::error::{StorageError, StorageResult};
use crate::s3::S3Config;

/// Carver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CarverConfig {
    /// Block storage backend
    pub backend: BackendType,
    /// Base directory for local blocks and archives
    pub path: PathBuf,
    /// Object storage settings, required for the s3 backend
    pub s3: Option<S3Config>,
}

impl Default for CarverConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Db,
            path: PathBuf::from("carved_files"),
            s3: None,
        }
    }
}

/// Open the configured block store
pub async fn open_block_store(config: &CarverConfig) -> StorageResult<Arc<dyn BlockStore>> {
    let store: Arc<dyn BlockStore> = match config.backend {
        BackendType::Db => Arc::new(InlineBlockStore::new(&config.path).await?),
        BackendType::Local => Arc::new(LocalBlockStore::new(&config.path).await?),
        BackendType::S3 => {
            let s3 = config.s3.clone().ok_or_else(|| {
                StorageError::Configuration("carver backend s3 requires [carver.s3]".to_string())
            })?;
            Arc::new(S3BlockStore::new(s3)?)
        }
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_configured_backend() {
        let temp_dir = TempDir::new().unwrap();
        let config = CarverConfig {
            backend: BackendType::Local,
            path: temp_dir.path().to_path_buf(),
            s3: None,
        };
        let store = open_block_store(&config).await.unwrap();
        assert_eq!(store.backend_type(), BackendType::Local);

        let missing_s3 = CarverConfig {
            backend: BackendType::S3,
            ..config
        };
        assert!(matches!(
            open_block_store(&missing_s3).await,
            Err(StorageError::Configuration(_))
        ));
    }
}
