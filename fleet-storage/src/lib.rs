//! Fleet Carve Storage Layer
//!
//! Block storage backends for carved files.
//!
//! # Backends
//!
//! - **db**: block bytes kept inline with the block row, archives on local disk
//! - **local**: blocks and archives on the local filesystem
//! - **s3**: blocks as objects, archives built by multipart upload-part-copy,
//!   downloads served as pre-signed links
//!
//! # Usage
//!
//! ```ignore
//! use fleet_storage::backend::{BlockKey, BlockStore, LocalBlockStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = LocalBlockStore::new("/var/lib/fleet/carves").await?;
//!     let key = BlockKey {
//!         environment: "acme".into(),
//!         uuid: "N1".into(),
//!         session_id: "s1".into(),
//!         block_id: 0,
//!     };
//!     let reference = store.put_block(&key, b"block bytes").await?;
//!     println!("stored as {:?}", reference);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod s3;

pub use backend::{
    Artifact, ArchiveTarget, BackendType, BlockKey, BlockStore, HealthStatus, InlineBlockStore,
    LocalBlockStore, S3BlockStore,
};
pub use config::{open_block_store, CarverConfig};
pub use error::{StorageError, StorageResult};
pub use s3::{S3Client, S3Config};
