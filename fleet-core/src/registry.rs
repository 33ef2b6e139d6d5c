//! Environment lookup consumed by the engines

use async_trait::async_trait;

use crate::error::CoreResult;
use crate::types::Environment;

/// Read access to the environment registry
#[async_trait]
pub trait Environments: Send + Sync {
    /// Get an environment by name or UUID
    async fn get(&self, identifier: &str) -> CoreResult<Environment>;

    /// Whether an environment with this name or UUID exists
    async fn exists(&self, identifier: &str) -> CoreResult<bool>;
}
