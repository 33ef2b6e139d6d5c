//! Carve Block Storage Backends

pub mod inline;
pub mod local;
pub mod s3;
pub mod traits;

pub use inline::InlineBlockStore;
pub use local::{read_block, LocalBlockStore};
pub use s3::S3BlockStore;
pub use traits::{
    archive_extension, verify_blocks, Artifact, ArchiveTarget, BackendType, BlockKey, BlockStore,
    HealthStatus,
};
