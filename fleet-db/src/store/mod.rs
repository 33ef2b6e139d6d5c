//! Persistence abstraction
//!
//! Every read/write the engines perform goes through `FleetStore`. Two
//! implementations exist: `MemoryStore` for tests and single-process
//! deployments, and `SqliteStore` for durable storage.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{
    ArchiveLocation, ArchiveTrigger, ArchivedNode, CarveBlock, CarveSession, DistributedQuery,
    Environment, LivenessKind, LogRecord, LogType, Node, NodeMetadata, QueryExecution, QueryTarget,
};
use std::collections::HashSet;

use crate::error::DbResult;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Flags that move a query through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryFlags {
    pub active: bool,
    pub completed: bool,
    pub deleted: bool,
}

impl QueryFlags {
    pub const ACTIVE: Self = Self {
        active: true,
        completed: false,
        deleted: false,
    };
    pub const COMPLETED: Self = Self {
        active: false,
        completed: true,
        deleted: false,
    };
    pub const DELETED: Self = Self {
        active: false,
        completed: false,
        deleted: true,
    };
}

/// Liveness stamp applied by `touch_node`
#[derive(Debug, Clone)]
pub struct Touch<'a> {
    pub kind: LivenessKind,
    pub at: DateTime<Utc>,
    pub ip_address: Option<&'a str>,
    pub bytes: u64,
}

/// Persistent store for the control plane
#[async_trait]
pub trait FleetStore: Send + Sync {
    // ==================== Environments ====================

    async fn create_environment(&self, env: &Environment) -> DbResult<()>;

    /// Look up by name or UUID
    async fn get_environment(&self, identifier: &str) -> DbResult<Option<Environment>>;

    async fn list_environments(&self) -> DbResult<Vec<Environment>>;

    async fn update_environment(&self, env: &Environment) -> DbResult<()>;

    // ==================== Nodes ====================

    async fn get_node_by_key(&self, node_key: &str) -> DbResult<Option<Node>>;

    async fn get_node_by_uuid(&self, environment: &str, uuid: &str) -> DbResult<Option<Node>>;

    async fn create_node(&self, node: &Node) -> DbResult<()>;

    /// Replace the live record for (environment, uuid), including its node key
    async fn update_node(&self, node: &Node) -> DbResult<()>;

    /// Stamp liveness on the node holding `node_key`; false when no such node
    async fn touch_node(&self, node_key: &str, touch: Touch<'_>) -> DbResult<bool>;

    /// Merge batch metadata into the node holding `node_key`
    async fn update_node_metadata(&self, node_key: &str, metadata: &NodeMetadata) -> DbResult<bool>;

    async fn archive_node(&self, node: &Node, trigger: ArchiveTrigger) -> DbResult<()>;

    /// Remove the live record (archive first)
    async fn delete_node(&self, environment: &str, uuid: &str) -> DbResult<bool>;

    async fn list_nodes(&self, environment: &str) -> DbResult<Vec<Node>>;

    async fn list_archived_nodes(&self, environment: &str, uuid: &str) -> DbResult<Vec<ArchivedNode>>;

    // ==================== Queries ====================

    /// Persist a query together with its targets
    async fn create_query(&self, query: &DistributedQuery, targets: &[QueryTarget]) -> DbResult<()>;

    async fn get_query(&self, name: &str) -> DbResult<Option<DistributedQuery>>;

    async fn get_targets(&self, name: &str) -> DbResult<Vec<QueryTarget>>;

    async fn list_queries(&self, environment: &str) -> DbResult<Vec<DistributedQuery>>;

    /// Active, non-deleted queries of an environment with their targets
    async fn active_queries(&self, environment: &str) -> DbResult<Vec<(DistributedQuery, Vec<QueryTarget>)>>;

    async fn set_query_flags(&self, name: &str, flags: QueryFlags) -> DbResult<bool>;

    /// Increment `executions` (success) or `errors`
    async fn increment_query(&self, name: &str, success: bool) -> DbResult<bool>;

    /// Mark completed when `executions + errors >= expected`; true when it transitioned
    async fn complete_if_accounted(&self, name: &str) -> DbResult<bool>;

    async fn record_execution(&self, execution: &QueryExecution) -> DbResult<()>;

    async fn has_execution(&self, name: &str, uuid: &str) -> DbResult<bool>;

    /// Names of queries node `uuid` already has execution facts for
    async fn executed_queries(&self, environment: &str, uuid: &str) -> DbResult<HashSet<String>>;

    async fn list_executions(&self, name: &str) -> DbResult<Vec<QueryExecution>>;

    // ==================== Carves ====================

    async fn create_carve(&self, carve: &CarveSession) -> DbResult<()>;

    async fn get_carve(&self, session_id: &str) -> DbResult<Option<CarveSession>>;

    async fn get_carve_by_carve_id(&self, carve_id: &str) -> DbResult<Option<CarveSession>>;

    /// Replace the session identified by its carve id
    async fn update_carve(&self, carve: &CarveSession) -> DbResult<()>;

    async fn list_carves(&self, environment: &str) -> DbResult<Vec<CarveSession>>;

    /// Compare-and-swap the session status
    async fn transition_carve(
        &self,
        session_id: &str,
        from: fleet_core::CarveStatus,
        to: fleet_core::CarveStatus,
    ) -> DbResult<bool>;

    /// Record the archive and move `archiving → archived`
    async fn set_carve_archive(&self, session_id: &str, location: &ArchiveLocation) -> DbResult<bool>;

    /// Store a block, replacing any earlier copy of the same (session, block id)
    async fn upsert_block(&self, block: &CarveBlock) -> DbResult<()>;

    /// Distinct block ids received for a session
    async fn count_blocks(&self, session_id: &str) -> DbResult<u64>;

    /// Blocks of a session sorted by ascending block id
    async fn list_blocks(&self, session_id: &str) -> DbResult<Vec<CarveBlock>>;

    /// Record `completed` received blocks; `in_progress → completed` once all arrived
    async fn record_carve_progress(&self, session_id: &str, completed: u64) -> DbResult<Option<CarveSession>>;

    // ==================== Logs ====================

    async fn append_logs(&self, records: &[LogRecord]) -> DbResult<()>;

    async fn list_logs(
        &self,
        environment: &str,
        uuid: &str,
        log_type: LogType,
        limit: usize,
    ) -> DbResult<Vec<LogRecord>>;

    // ==================== Health ====================

    async fn ping(&self) -> DbResult<()>;
}
