//! Log Dispatcher
//!
//! Turns a decoded status/result batch into node metadata and liveness
//! updates, then hands the raw batch to the sink pool. Query write results
//! are forwarded the same way under log type `query`.

use chrono::Utc;
use fleet_core::{Environment, LivenessKind, LogBatch, LogType, Node};
use fleet_db::NodeService;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::metadata::extract_metadata;
use crate::pool::SinkPool;

/// Log Dispatcher
pub struct LogDispatcher {
    nodes: Arc<NodeService>,
    pool: Arc<SinkPool>,
}

/// One query result as written back by a node
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub name: String,
    pub status: i64,
    pub message: String,
    pub data: Value,
}

impl LogDispatcher {
    pub fn new(nodes: Arc<NodeService>, pool: Arc<SinkPool>) -> Self {
        Self { nodes, pool }
    }

    pub fn pool(&self) -> &Arc<SinkPool> {
        &self.pool
    }

    /// Ingest a status or result batch from an authenticated node.
    ///
    /// Metadata and liveness updates are best effort; sink delivery is
    /// queued and never awaited.
    pub async fn ingest(
        &self,
        env: &Environment,
        node: &Node,
        log_type: LogType,
        data: Value,
        bytes: u64,
        ip_address: Option<&str>,
    ) {
        let extracted = extract_metadata(&data);
        if !extracted.conflicts.is_empty() {
            warn!(
                environment = %env.name,
                uuid = %node.uuid,
                fields = ?extracted.conflicts,
                "Log batch mixes identities, keeping first values"
            );
        }
        if !extracted.metadata.uuid.is_empty() && extracted.metadata.uuid != node.uuid {
            warn!(
                uuid = %node.uuid,
                batch_uuid = %extracted.metadata.uuid,
                "Log batch identifier differs from node key owner"
            );
        }
        if let Err(e) = self.nodes.update_metadata(&node.node_key, &extracted.metadata).await {
            warn!(error = %e, uuid = %node.uuid, "Failed to update node metadata");
        }
        let kind = match log_type {
            LogType::Result => LivenessKind::Result,
            _ => LivenessKind::Status,
        };
        self.nodes.touch(&node.node_key, kind, ip_address, bytes).await;

        debug!(
            environment = %env.name,
            uuid = %node.uuid,
            log_type = log_type.as_str(),
            entries = extracted.entries,
            "Dispatching log batch"
        );
        self.pool
            .dispatch(LogBatch {
                log_type,
                environment: env.uuid.clone(),
                environment_name: env.name.clone(),
                uuid: node.uuid.clone(),
                query_name: None,
                status: None,
                data,
                received_at: Utc::now(),
            })
            .await;
    }

    /// Forward one query result to the sinks as log type `query`
    pub async fn dispatch_query_result(&self, env: &Environment, node: &Node, result: QueryResult) {
        self.pool
            .dispatch(LogBatch {
                log_type: LogType::Query,
                environment: env.uuid.clone(),
                environment_name: env.name.clone(),
                uuid: node.uuid.clone(),
                query_name: Some(result.name.clone()),
                status: Some(result.status),
                data: json!({
                    "name": result.name,
                    "status": result.status,
                    "message": result.message,
                    "result": result.data,
                }),
                received_at: Utc::now(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DispatchConfig;
    use crate::sinks::DbSink;
    use fleet_core::MemorySettings;
    use fleet_db::{FleetStore, MemoryStore};
    use std::time::Duration;

    async fn setup() -> (Arc<MemoryStore>, LogDispatcher, Environment, Node) {
        let store = Arc::new(MemoryStore::new());
        let env = Environment::new("acme", "fleet.test");
        store.create_environment(&env).await.unwrap();
        let node = Node::new("k1", "N1", env.uuid.clone());
        store.create_node(&node).await.unwrap();

        let pool = SinkPool::start(
            &DispatchConfig::default(),
            vec![Arc::new(DbSink::new(store.clone()))],
            Arc::new(MemorySettings::new()),
        )
        .await
        .unwrap();
        let dispatcher = LogDispatcher::new(Arc::new(NodeService::new(store.clone())), Arc::new(pool));
        (store, dispatcher, env, node)
    }

    async fn wait_for_logs(store: &MemoryStore, env: &str, log_type: LogType) -> usize {
        for _ in 0..50 {
            let n = store.list_logs(env, "N1", log_type, 10).await.unwrap().len();
            if n > 0 {
                return n;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        0
    }

    #[tokio::test]
    async fn test_ingest_updates_node_and_reaches_sink() {
        let (store, dispatcher, env, node) = setup().await;
        let data = json!([{
            "hostIdentifier": "N1",
            "version": "5.11.0",
            "decorations": { "hostname": "web-1", "local_hostname": "web-1.local", "username": "root" }
        }]);
        dispatcher
            .ingest(&env, &node, LogType::Status, data, 120, Some("192.0.2.1"))
            .await;

        let updated = store.get_node_by_key("k1").await.unwrap().unwrap();
        assert_eq!(updated.hostname, "web-1");
        assert_eq!(updated.osquery_version, "5.11.0");
        assert_eq!(updated.ip_address, "192.0.2.1");
        assert_eq!(updated.bytes_received, 120);
        assert!(updated.last_status.is_some());
        assert!(updated.last_result.is_none());

        assert_eq!(wait_for_logs(&store, &env.uuid, LogType::Status).await, 1);
    }

    #[tokio::test]
    async fn test_query_result_forwarded() {
        let (store, dispatcher, env, node) = setup().await;
        let result = QueryResult {
            name: "q1".into(),
            status: 0,
            message: String::new(),
            data: json!([{ "version": "1" }]),
        };
        dispatcher.dispatch_query_result(&env, &node, result).await;

        assert_eq!(wait_for_logs(&store, &env.uuid, LogType::Query).await, 1);
        let logs = store.list_logs(&env.uuid, "N1", LogType::Query, 1).await.unwrap();
        assert_eq!(logs[0].query_name.as_deref(), Some("q1"));
        assert_eq!(logs[0].data["result"][0]["version"], "1");
    }
}
