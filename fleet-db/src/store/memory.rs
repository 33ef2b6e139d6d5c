//! In-memory store
//!
//! Thread-safe store backed by `RwLock`-guarded maps, used for tests,
//! development and single-process deployments.

use async_trait::async_trait;
use fleet_core::{
    ArchiveLocation, ArchiveTrigger, ArchivedNode, CarveBlock, CarveSession, CarveStatus,
    DistributedQuery, Environment, LogRecord, LogType, Node, NodeMetadata, QueryExecution,
    QueryTarget,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{FleetStore, QueryFlags, Touch};
use crate::error::{DbError, DbResult};

type NodeId = (String, String);

/// Nodes and their key index share one lock so the two never disagree
#[derive(Debug, Default)]
struct NodeTables {
    nodes: HashMap<NodeId, Node>,
    // node_key → (environment, uuid)
    keys: HashMap<String, NodeId>,
}

impl NodeTables {
    fn by_key_mut(&mut self, node_key: &str) -> Option<&mut Node> {
        let id = self.keys.get(node_key)?;
        self.nodes.get_mut(id)
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    environments: Arc<RwLock<HashMap<String, Environment>>>,
    nodes: Arc<RwLock<NodeTables>>,
    archived_nodes: Arc<RwLock<Vec<ArchivedNode>>>,
    queries: Arc<RwLock<HashMap<String, DistributedQuery>>>,
    targets: Arc<RwLock<HashMap<String, Vec<QueryTarget>>>>,
    executions: Arc<RwLock<Vec<QueryExecution>>>,
    // carve_id → session
    carves: Arc<RwLock<HashMap<String, CarveSession>>>,
    // session_id → carve_id
    sessions: Arc<RwLock<HashMap<String, String>>>,
    blocks: Arc<RwLock<BTreeMap<(String, u64), CarveBlock>>>,
    logs: Arc<RwLock<Vec<LogRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all data
    pub async fn clear(&self) {
        self.environments.write().await.clear();
        *self.nodes.write().await = NodeTables::default();
        self.archived_nodes.write().await.clear();
        self.queries.write().await.clear();
        self.targets.write().await.clear();
        self.executions.write().await.clear();
        self.carves.write().await.clear();
        self.sessions.write().await.clear();
        self.blocks.write().await.clear();
        self.logs.write().await.clear();
    }

    async fn carve_id_for(&self, session_id: &str) -> Option<String> {
        self.sessions.read().await.get(session_id).cloned()
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
    // ==================== Environments ====================

    async fn create_environment(&self, env: &Environment) -> DbResult<()> {
        let mut envs = self.environments.write().await;
        if envs.values().any(|e| e.name == env.name || e.uuid == env.uuid) {
            return Err(DbError::AlreadyExists(format!("environment {}", env.name)));
        }
        envs.insert(env.uuid.clone(), env.clone());
        Ok(())
    }

    async fn get_environment(&self, identifier: &str) -> DbResult<Option<Environment>> {
        let envs = self.environments.read().await;
        Ok(envs.values().find(|e| e.matches(identifier)).cloned())
    }

    async fn list_environments(&self) -> DbResult<Vec<Environment>> {
        let mut envs: Vec<Environment> = self.environments.read().await.values().cloned().collect();
        envs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(envs)
    }

    async fn update_environment(&self, env: &Environment) -> DbResult<()> {
        let mut envs = self.environments.write().await;
        match envs.get_mut(&env.uuid) {
            Some(existing) => {
                *existing = env.clone();
                Ok(())
            }
            None => Err(DbError::NotFound(format!("environment {}", env.uuid))),
        }
    }

    // ==================== Nodes ====================

    async fn get_node_by_key(&self, node_key: &str) -> DbResult<Option<Node>> {
        let tables = self.nodes.read().await;
        Ok(tables
            .keys
            .get(node_key)
            .and_then(|id| tables.nodes.get(id))
            .cloned())
    }

    async fn get_node_by_uuid(&self, environment: &str, uuid: &str) -> DbResult<Option<Node>> {
        let id = (environment.to_string(), uuid.to_string());
        Ok(self.nodes.read().await.nodes.get(&id).cloned())
    }

    async fn create_node(&self, node: &Node) -> DbResult<()> {
        let id = (node.environment.clone(), node.uuid.clone());
        let mut tables = self.nodes.write().await;
        if tables.nodes.contains_key(&id) {
            return Err(DbError::AlreadyExists(format!("node {}", node.uuid)));
        }
        if tables.keys.contains_key(&node.node_key) {
            return Err(DbError::AlreadyExists("node key".to_string()));
        }
        tables.keys.insert(node.node_key.clone(), id.clone());
        tables.nodes.insert(id, node.clone());
        Ok(())
    }

    async fn update_node(&self, node: &Node) -> DbResult<()> {
        let id = (node.environment.clone(), node.uuid.clone());
        let mut tables = self.nodes.write().await;
        let NodeTables { nodes, keys } = &mut *tables;
        let Some(existing) = nodes.get_mut(&id) else {
            return Err(DbError::NotFound(format!("node {}", node.uuid)));
        };
        if existing.node_key != node.node_key {
            if keys.contains_key(&node.node_key) {
                return Err(DbError::AlreadyExists("node key".to_string()));
            }
            keys.remove(&existing.node_key);
            keys.insert(node.node_key.clone(), id);
        }
        *existing = node.clone();
        Ok(())
    }

    async fn touch_node(&self, node_key: &str, touch: Touch<'_>) -> DbResult<bool> {
        let mut tables = self.nodes.write().await;
        let Some(node) = tables.by_key_mut(node_key) else {
            return Ok(false);
        };
        touch.kind.stamp(node, touch.at);
        if let Some(ip) = touch.ip_address {
            node.ip_address = ip.to_string();
        }
        node.bytes_received += touch.bytes;
        node.updated_at = touch.at;
        Ok(true)
    }

    async fn update_node_metadata(&self, node_key: &str, metadata: &NodeMetadata) -> DbResult<bool> {
        let mut tables = self.nodes.write().await;
        let Some(node) = tables.by_key_mut(node_key) else {
            return Ok(false);
        };
        metadata.apply(node);
        node.updated_at = Utc::now();
        Ok(true)
    }

    async fn archive_node(&self, node: &Node, trigger: ArchiveTrigger) -> DbResult<()> {
        self.archived_nodes.write().await.push(ArchivedNode {
            node: node.clone(),
            trigger,
            archived_at: Utc::now(),
        });
        Ok(())
    }

    async fn delete_node(&self, environment: &str, uuid: &str) -> DbResult<bool> {
        let id = (environment.to_string(), uuid.to_string());
        let mut tables = self.nodes.write().await;
        match tables.nodes.remove(&id) {
            Some(node) => {
                tables.keys.remove(&node.node_key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_nodes(&self, environment: &str) -> DbResult<Vec<Node>> {
        let mut nodes: Vec<Node> = self
            .nodes
            .read()
            .await
            .nodes
            .values()
            .filter(|n| n.environment == environment)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        Ok(nodes)
    }

    async fn list_archived_nodes(&self, environment: &str, uuid: &str) -> DbResult<Vec<ArchivedNode>> {
        Ok(self
            .archived_nodes
            .read()
            .await
            .iter()
            .filter(|a| a.node.environment == environment && a.node.uuid == uuid)
            .cloned()
            .collect())
    }

    // ==================== Queries ====================

    async fn create_query(&self, query: &DistributedQuery, targets: &[QueryTarget]) -> DbResult<()> {
        let mut queries = self.queries.write().await;
        let mut all_targets = self.targets.write().await;
        if queries.contains_key(&query.name) {
            return Err(DbError::AlreadyExists(format!("query {}", query.name)));
        }
        all_targets.insert(query.name.clone(), targets.to_vec());
        queries.insert(query.name.clone(), query.clone());
        Ok(())
    }

    async fn get_query(&self, name: &str) -> DbResult<Option<DistributedQuery>> {
        Ok(self.queries.read().await.get(name).cloned())
    }

    async fn get_targets(&self, name: &str) -> DbResult<Vec<QueryTarget>> {
        Ok(self.targets.read().await.get(name).cloned().unwrap_or_default())
    }

    async fn list_queries(&self, environment: &str) -> DbResult<Vec<DistributedQuery>> {
        let mut queries: Vec<DistributedQuery> = self
            .queries
            .read()
            .await
            .values()
            .filter(|q| q.environment == environment)
            .cloned()
            .collect();
        queries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(queries)
    }

    async fn active_queries(&self, environment: &str) -> DbResult<Vec<(DistributedQuery, Vec<QueryTarget>)>> {
        let queries = self.queries.read().await;
        let targets = self.targets.read().await;
        Ok(queries
            .values()
            .filter(|q| q.environment == environment && q.active && !q.deleted)
            .map(|q| (q.clone(), targets.get(&q.name).cloned().unwrap_or_default()))
            .collect())
    }

    async fn set_query_flags(&self, name: &str, flags: QueryFlags) -> DbResult<bool> {
        let mut queries = self.queries.write().await;
        let Some(query) = queries.get_mut(name) else {
            return Ok(false);
        };
        query.active = flags.active;
        query.completed = flags.completed;
        query.deleted = flags.deleted;
        query.updated_at = Utc::now();
        Ok(true)
    }

    async fn increment_query(&self, name: &str, success: bool) -> DbResult<bool> {
        let mut queries = self.queries.write().await;
        let Some(query) = queries.get_mut(name) else {
            return Ok(false);
        };
        if success {
            query.executions += 1;
        } else {
            query.errors += 1;
        }
        query.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete_if_accounted(&self, name: &str) -> DbResult<bool> {
        let mut queries = self.queries.write().await;
        let Some(query) = queries.get_mut(name) else {
            return Ok(false);
        };
        if query.completed || query.deleted || !query.accounting_complete() {
            return Ok(false);
        }
        query.completed = true;
        query.active = false;
        query.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_execution(&self, execution: &QueryExecution) -> DbResult<()> {
        self.executions.write().await.push(execution.clone());
        Ok(())
    }

    async fn has_execution(&self, name: &str, uuid: &str) -> DbResult<bool> {
        Ok(self
            .executions
            .read()
            .await
            .iter()
            .any(|e| e.name == name && e.uuid == uuid))
    }

    async fn executed_queries(&self, environment: &str, uuid: &str) -> DbResult<HashSet<String>> {
        Ok(self
            .executions
            .read()
            .await
            .iter()
            .filter(|e| e.environment == environment && e.uuid == uuid)
            .map(|e| e.name.clone())
            .collect())
    }

    async fn list_executions(&self, name: &str) -> DbResult<Vec<QueryExecution>> {
        Ok(self
            .executions
            .read()
            .await
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect())
    }

    // ==================== Carves ====================

    async fn create_carve(&self, carve: &CarveSession) -> DbResult<()> {
        let mut carves = self.carves.write().await;
        let mut sessions = self.sessions.write().await;
        if carves.contains_key(&carve.carve_id) {
            return Err(DbError::AlreadyExists(format!("carve {}", carve.carve_id)));
        }
        if !carve.session_id.is_empty() {
            sessions.insert(carve.session_id.clone(), carve.carve_id.clone());
        }
        carves.insert(carve.carve_id.clone(), carve.clone());
        Ok(())
    }

    async fn get_carve(&self, session_id: &str) -> DbResult<Option<CarveSession>> {
        let Some(carve_id) = self.carve_id_for(session_id).await else {
            return Ok(None);
        };
        Ok(self.carves.read().await.get(&carve_id).cloned())
    }

    async fn get_carve_by_carve_id(&self, carve_id: &str) -> DbResult<Option<CarveSession>> {
        Ok(self.carves.read().await.get(carve_id).cloned())
    }

    async fn update_carve(&self, carve: &CarveSession) -> DbResult<()> {
        let mut carves = self.carves.write().await;
        let mut sessions = self.sessions.write().await;
        let Some(existing) = carves.get_mut(&carve.carve_id) else {
            return Err(DbError::NotFound(format!("carve {}", carve.carve_id)));
        };
        if !carve.session_id.is_empty() {
            sessions.insert(carve.session_id.clone(), carve.carve_id.clone());
        }
        *existing = carve.clone();
        Ok(())
    }

    async fn list_carves(&self, environment: &str) -> DbResult<Vec<CarveSession>> {
        let mut carves: Vec<CarveSession> = self
            .carves
            .read()
            .await
            .values()
            .filter(|c| c.environment == environment)
            .cloned()
            .collect();
        carves.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(carves)
    }

    async fn transition_carve(&self, session_id: &str, from: CarveStatus, to: CarveStatus) -> DbResult<bool> {
        let Some(carve_id) = self.carve_id_for(session_id).await else {
            return Ok(false);
        };
        let mut carves = self.carves.write().await;
        match carves.get_mut(&carve_id) {
            Some(carve) if carve.status == from => {
                carve.status = to;
                carve.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_carve_archive(&self, session_id: &str, location: &ArchiveLocation) -> DbResult<bool> {
        let Some(carve_id) = self.carve_id_for(session_id).await else {
            return Ok(false);
        };
        let mut carves = self.carves.write().await;
        match carves.get_mut(&carve_id) {
            Some(carve) if carve.status == CarveStatus::Archiving => {
                carve.status = CarveStatus::Archived;
                carve.archive = Some(location.clone());
                carve.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn upsert_block(&self, block: &CarveBlock) -> DbResult<()> {
        self.blocks
            .write()
            .await
            .insert((block.session_id.clone(), block.block_id), block.clone());
        Ok(())
    }

    async fn count_blocks(&self, session_id: &str) -> DbResult<u64> {
        Ok(self
            .blocks
            .read()
            .await
            .keys()
            .filter(|(s, _)| s == session_id)
            .count() as u64)
    }

    async fn list_blocks(&self, session_id: &str) -> DbResult<Vec<CarveBlock>> {
        // BTreeMap keys order (session, block_id), so the range is sorted by block id
        let start = (session_id.to_string(), 0u64);
        let end = (session_id.to_string(), u64::MAX);
        Ok(self
            .blocks
            .read()
            .await
            .range(start..=end)
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn record_carve_progress(&self, session_id: &str, completed: u64) -> DbResult<Option<CarveSession>> {
        let Some(carve_id) = self.carve_id_for(session_id).await else {
            return Ok(None);
        };
        let mut carves = self.carves.write().await;
        let Some(carve) = carves.get_mut(&carve_id) else {
            return Ok(None);
        };
        carve.completed_blocks = carve.completed_blocks.max(completed);
        if carve.status == CarveStatus::InProgress && carve.is_complete() {
            carve.status = CarveStatus::Completed;
        }
        carve.updated_at = Utc::now();
        Ok(Some(carve.clone()))
    }

    // ==================== Logs ====================

    async fn append_logs(&self, records: &[LogRecord]) -> DbResult<()> {
        self.logs.write().await.extend_from_slice(records);
        Ok(())
    }

    async fn list_logs(
        &self,
        environment: &str,
        uuid: &str,
        log_type: LogType,
        limit: usize,
    ) -> DbResult<Vec<LogRecord>> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| r.environment == environment && r.uuid == uuid && r.log_type == log_type)
            .take(limit)
            .cloned()
            .collect())
    }

    // ==================== Health ====================

    async fn ping(&self) -> DbResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{BlockData, LivenessKind, QueryType};

    fn query(name: &str, env: &str, expected: u64) -> DistributedQuery {
        let now = Utc::now();
        DistributedQuery {
            name: name.into(),
            environment: env.into(),
            query: "SELECT 1".into(),
            creator: "test".into(),
            query_type: QueryType::Standard,
            path: None,
            expected,
            executions: 0,
            errors: 0,
            active: true,
            completed: false,
            deleted: false,
            hidden: false,
            protected: false,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn session(carve_id: &str, session_id: &str, block_count: u64) -> CarveSession {
        let now = Utc::now();
        CarveSession {
            session_id: session_id.into(),
            carve_id: carve_id.into(),
            request_id: "carve_q".into(),
            environment: "env".into(),
            node_uuid: "N1".into(),
            path: "/etc/hosts".into(),
            block_count,
            block_size: 4,
            carve_size: 4 * block_count,
            completed_blocks: 0,
            status: CarveStatus::InProgress,
            archive: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_node_key_index_follows_update() {
        let store = MemoryStore::new();
        let node = Node::new("k1", "N1", "env");
        store.create_node(&node).await.unwrap();

        let mut reenrolled = node.clone();
        reenrolled.node_key = "k2".into();
        store.update_node(&reenrolled).await.unwrap();

        assert!(store.get_node_by_key("k1").await.unwrap().is_none());
        assert_eq!(store.get_node_by_key("k2").await.unwrap().unwrap().uuid, "N1");
    }

    #[tokio::test]
    async fn test_touch_node() {
        let store = MemoryStore::new();
        store.create_node(&Node::new("k1", "N1", "env")).await.unwrap();
        let at = Utc::now();
        let touched = store
            .touch_node(
                "k1",
                Touch {
                    kind: LivenessKind::Config,
                    at,
                    ip_address: Some("10.0.0.1"),
                    bytes: 10,
                },
            )
            .await
            .unwrap();
        assert!(touched);
        let node = store.get_node_by_key("k1").await.unwrap().unwrap();
        assert_eq!(node.last_config, Some(at));
        assert_eq!(node.ip_address, "10.0.0.1");
        assert_eq!(node.bytes_received, 10);

        let missing = Touch {
            kind: LivenessKind::Config,
            at,
            ip_address: None,
            bytes: 0,
        };
        assert!(!store.touch_node("nope", missing).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enroll_and_touch() {
        let store = Arc::new(MemoryStore::new());
        store.create_node(&Node::new("k0", "N0", "env")).await.unwrap();

        let mut tasks = Vec::new();
        for writer in 0..2 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..500 {
                    let node = Node::new(&format!("k{writer}-{i}"), &format!("N{writer}-{i}"), "env");
                    store.create_node(&node).await.unwrap();
                }
            }));
        }
        for _ in 0..2 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..500 {
                    let touch = Touch {
                        kind: LivenessKind::Status,
                        at: Utc::now(),
                        ip_address: None,
                        bytes: 1,
                    };
                    assert!(store.touch_node("k0", touch).await.unwrap());
                }
            }));
        }

        let all = async {
            for task in tasks {
                task.await.unwrap();
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(10), all)
            .await
            .expect("node operations stalled");

        assert_eq!(store.list_nodes("env").await.unwrap().len(), 1001);
        let node = store.get_node_by_key("k0").await.unwrap().unwrap();
        assert_eq!(node.bytes_received, 1000);
    }

    #[tokio::test]
    async fn test_complete_if_accounted() {
        let store = MemoryStore::new();
        store.create_query(&query("q1", "env", 2), &[]).await.unwrap();

        store.increment_query("q1", true).await.unwrap();
        assert!(!store.complete_if_accounted("q1").await.unwrap());

        store.increment_query("q1", false).await.unwrap();
        assert!(store.complete_if_accounted("q1").await.unwrap());
        assert!(!store.complete_if_accounted("q1").await.unwrap());

        let q = store.get_query("q1").await.unwrap().unwrap();
        assert!(q.completed);
        assert!(!q.active);
        assert_eq!((q.executions, q.errors), (1, 1));
    }

    #[tokio::test]
    async fn test_duplicate_query_name_rejected() {
        let store = MemoryStore::new();
        store.create_query(&query("q1", "env", 0), &[]).await.unwrap();
        assert!(matches!(
            store.create_query(&query("q1", "env", 0), &[]).await,
            Err(DbError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_blocks_sorted_and_overwritten() {
        let store = MemoryStore::new();
        store.create_carve(&session("c1", "s1", 3)).await.unwrap();
        for id in [2u64, 0, 1, 0] {
            store
                .upsert_block(&CarveBlock {
                    session_id: "s1".into(),
                    block_id: id,
                    size: 1,
                    data: BlockData::Inline(vec![id as u8]),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.count_blocks("s1").await.unwrap(), 3);
        let ids: Vec<u64> = store
            .list_blocks("s1")
            .await
            .unwrap()
            .iter()
            .map(|b| b.block_id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_carve_status_cas() {
        let store = MemoryStore::new();
        store.create_carve(&session("c1", "s1", 1)).await.unwrap();

        let carve = store.record_carve_progress("s1", 1).await.unwrap().unwrap();
        assert_eq!(carve.status, CarveStatus::Completed);

        assert!(store
            .transition_carve("s1", CarveStatus::Completed, CarveStatus::Archiving)
            .await
            .unwrap());
        assert!(!store
            .transition_carve("s1", CarveStatus::Completed, CarveStatus::Archiving)
            .await
            .unwrap());

        let location = ArchiveLocation::Local {
            path: "/tmp/a.tar".into(),
        };
        assert!(store.set_carve_archive("s1", &location).await.unwrap());
        let carve = store.get_carve("s1").await.unwrap().unwrap();
        assert_eq!(carve.status, CarveStatus::Archived);
        assert_eq!(carve.archive, Some(location));

        // A late retried block does not regress the status
        let carve = store.record_carve_progress("s1", 1).await.unwrap().unwrap();
        assert_eq!(carve.status, CarveStatus::Archived);
    }
}
