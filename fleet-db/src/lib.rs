//! Fleet Database Layer
//!
//! Persistence for environments, nodes, distributed queries, carve sessions
//! and structured logs, plus the engine services built on it.
//!
//! # Stores
//!
//! - `MemoryStore` - lock-guarded maps, for tests and single-process use
//! - `SqliteStore` - `rusqlite` with WAL journaling
//!
//! # Services
//!
//! - `EnvironmentService` - tenant creation and secret/path rotation
//! - `NodeService` - enrollment, node-key authentication, liveness
//! - `QueryService` - distributed query lifecycle and delivery
//! - `CarveService` - carve sessions, block uploads, archival

pub mod error;
pub mod schema;
pub mod services;
pub mod store;

pub use error::{DbError, DbResult};
pub use schema::FLEET_SCHEMA;
pub use services::{
    BlockUpload, CarveService, EnrollOutcome, EnrollRejection, EnvironmentService, NodeService,
    QueryService, ResultAccounting,
};
pub use store::{FleetStore, MemoryStore, QueryFlags, SqliteStore, Touch};

use std::sync::Arc;

/// Open a store from a database URL: `memory` or `sqlite:<path>`
pub fn open_store(url: &str) -> DbResult<Arc<dyn FleetStore>> {
    match url.trim() {
        "memory" | "" => Ok(Arc::new(MemoryStore::new())),
        "sqlite::memory:" => Ok(Arc::new(SqliteStore::open_in_memory()?)),
        other => match other.strip_prefix("sqlite:") {
            Some(path) if !path.is_empty() => Ok(Arc::new(SqliteStore::open(path)?)),
            _ => Err(DbError::Validation(format!("unsupported database url '{other}'"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_store_urls() {
        open_store("memory").unwrap().ping().await.unwrap();
        open_store("sqlite::memory:").unwrap().ping().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("fleet.db").display());
        open_store(&url).unwrap().ping().await.unwrap();

        assert!(open_store("postgres://nope").is_err());
    }
}
