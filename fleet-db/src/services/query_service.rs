//! Distributed Query Service
//!
//! Query creation with frozen `expected` counts, per-node delivery filtered
//! by execution facts, result accounting and lifecycle transitions.

use chrono::{DateTime, Utc};
use fleet_core::ids::{generate_carve_name, generate_query_name};
use fleet_core::{
    targets_match, DistributedQuery, Environment, NewQuery, Node, QueryExecution, QueryFilter, QueryTarget,
    QueryType, TargetType,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::store::{FleetStore, QueryFlags};

/// Outcome of accounting one query result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultAccounting {
    /// The query was known and the result counted
    pub recorded: bool,
    /// This result moved the query to completed
    pub completed: bool,
}

/// Distributed Query Service
pub struct QueryService {
    store: Arc<dyn FleetStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self { store }
    }

    /// Create a query in `env`.
    ///
    /// Targets are persisted with the query in one store call. Environment
    /// targets are canonicalised to the environment UUID. `expected` is the
    /// number of nodes of `env` matching any target at this moment.
    pub async fn create(&self, env: &Environment, new: NewQuery) -> DbResult<DistributedQuery> {
        let text = new.query.trim();
        if text.is_empty() {
            return Err(DbError::Validation("query text is empty".to_string()));
        }
        if new.query_type == QueryType::Carve && new.path.as_deref().map_or(true, |p| p.trim().is_empty()) {
            return Err(DbError::Validation("carve query requires a path".to_string()));
        }

        let targets = self.canonical_targets(&new.targets).await?;
        let nodes = self.store.list_nodes(&env.uuid).await?;
        let expected = nodes.iter().filter(|n| targets_match(&targets, n)).count() as u64;

        let name = match new.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ if new.query_type == QueryType::Carve => generate_carve_name(),
            _ => generate_query_name(),
        };
        let now = Utc::now();
        let query = DistributedQuery {
            name,
            environment: env.uuid.clone(),
            query: text.to_string(),
            creator: new.creator,
            query_type: new.query_type,
            path: new.path,
            expected,
            executions: 0,
            errors: 0,
            active: true,
            completed: false,
            deleted: false,
            hidden: new.hidden,
            protected: new.protected,
            expires_at: new.expires_at,
            created_at: now,
            updated_at: now,
        };
        self.store.create_query(&query, &targets).await?;

        info!(
            environment = %env.name,
            query = %query.name,
            query_type = query.query_type.as_str(),
            targets = targets.len(),
            expected,
            "Distributed query created"
        );
        Ok(query)
    }

    /// Create a carve query for `path`
    pub async fn create_carve(
        &self,
        env: &Environment,
        path: &str,
        targets: Vec<QueryTarget>,
        creator: &str,
    ) -> DbResult<DistributedQuery> {
        self.create(env, NewQuery::carve(path.trim(), targets).with_creator(creator))
            .await
    }

    async fn canonical_targets(&self, targets: &[QueryTarget]) -> DbResult<Vec<QueryTarget>> {
        let mut seen = HashSet::new();
        let mut canonical = Vec::with_capacity(targets.len());
        for target in targets {
            let target = match target.target_type {
                TargetType::Environment => {
                    let env = self
                        .store
                        .get_environment(target.value.trim())
                        .await?
                        .ok_or_else(|| DbError::Validation(format!("unknown environment target '{}'", target.value)))?;
                    QueryTarget::new(TargetType::Environment, env.uuid)
                }
                _ => QueryTarget::new(target.target_type, target.value.as_str()),
            };
            if target.value.is_empty() {
                return Err(DbError::Validation(format!("empty {} target", target.target_type.as_str())));
            }
            if seen.insert(target.clone()) {
                canonical.push(target);
            }
        }
        Ok(canonical)
    }

    /// Queries to hand to `node` on its next read: active, unexpired,
    /// matching any target, and without an execution fact for this node.
    pub async fn node_queries(&self, node: &Node) -> DbResult<HashMap<String, String>> {
        let now = Utc::now();
        let executed = self.store.executed_queries(&node.environment, &node.uuid).await?;
        let pending = self
            .store
            .active_queries(&node.environment)
            .await?
            .into_iter()
            .filter(|(q, targets)| !q.is_expired(now) && !executed.contains(&q.name) && targets_match(targets, node))
            .map(|(q, _)| (q.name, q.query))
            .collect::<HashMap<_, _>>();
        if !pending.is_empty() {
            debug!(uuid = %node.uuid, count = pending.len(), "Delivering distributed queries");
        }
        Ok(pending)
    }

    /// Account one result: bump the counter, append the execution fact,
    /// then check completion.
    pub async fn record_result(&self, name: &str, node: &Node, status: i64) -> DbResult<ResultAccounting> {
        let Some(query) = self.store.get_query(name).await? else {
            warn!(query = %name, uuid = %node.uuid, "Result for unknown query");
            return Ok(ResultAccounting {
                recorded: false,
                completed: false,
            });
        };
        if query.environment != node.environment {
            warn!(query = %name, uuid = %node.uuid, "Result for query of another environment");
            return Ok(ResultAccounting {
                recorded: false,
                completed: false,
            });
        }

        self.store.increment_query(name, status == 0).await?;
        self.store
            .record_execution(&QueryExecution {
                name: name.to_string(),
                uuid: node.uuid.clone(),
                environment: node.environment.clone(),
                result: status,
                created_at: Utc::now(),
            })
            .await?;
        let completed = self.verify_complete(name).await?;
        Ok(ResultAccounting {
            recorded: true,
            completed,
        })
    }

    /// Mark completed once `executions + errors >= expected`
    pub async fn verify_complete(&self, name: &str) -> DbResult<bool> {
        let completed = self.store.complete_if_accounted(name).await?;
        if completed {
            info!(query = %name, "Distributed query completed");
        }
        Ok(completed)
    }

    pub async fn get(&self, environment: &str, name: &str) -> DbResult<DistributedQuery> {
        match self.store.get_query(name).await? {
            Some(q) if q.environment == environment => Ok(q),
            _ => Err(DbError::NotFound(format!("query {name}"))),
        }
    }

    pub async fn targets(&self, environment: &str, name: &str) -> DbResult<Vec<QueryTarget>> {
        self.get(environment, name).await?;
        self.store.get_targets(name).await
    }

    pub async fn executions(&self, environment: &str, name: &str) -> DbResult<Vec<QueryExecution>> {
        self.get(environment, name).await?;
        self.store.list_executions(name).await
    }

    /// Queries of an environment, hidden ones only on request
    pub async fn list(
        &self,
        environment: &str,
        filter: QueryFilter,
        include_hidden: bool,
    ) -> DbResult<Vec<DistributedQuery>> {
        Ok(self
            .store
            .list_queries(environment)
            .await?
            .into_iter()
            .filter(|q| filter.accepts(q) && (include_hidden || !q.hidden))
            .collect())
    }

    pub async fn complete(&self, environment: &str, name: &str) -> DbResult<DistributedQuery> {
        let query = self.get(environment, name).await?;
        if query.deleted {
            return Err(DbError::InvalidState(format!("query {name} is deleted")));
        }
        self.transition(name, QueryFlags::COMPLETED).await
    }

    /// Reactivate a completed query
    pub async fn activate(&self, environment: &str, name: &str) -> DbResult<DistributedQuery> {
        let query = self.get(environment, name).await?;
        if query.deleted {
            return Err(DbError::InvalidState(format!("query {name} is deleted")));
        }
        self.transition(name, QueryFlags::ACTIVE).await
    }

    /// Soft delete
    pub async fn delete(&self, environment: &str, name: &str) -> DbResult<DistributedQuery> {
        let query = self.get(environment, name).await?;
        if query.protected {
            return Err(DbError::InvalidState(format!("query {name} is protected")));
        }
        self.transition(name, QueryFlags::DELETED).await
    }

    async fn transition(&self, name: &str, flags: QueryFlags) -> DbResult<DistributedQuery> {
        if !self.store.set_query_flags(name, flags).await? {
            return Err(DbError::NotFound(format!("query {name}")));
        }
        info!(query = %name, active = flags.active, completed = flags.completed, deleted = flags.deleted, "Query state changed");
        self.store
            .get_query(name)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("query {name}")))
    }

    /// Complete every active query whose expiration passed; returns the count
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> DbResult<usize> {
        let mut expired = 0;
        for env in self.store.list_environments().await? {
            for query in self.store.list_queries(&env.uuid).await? {
                if query.active && !query.deleted && query.is_expired(now) {
                    self.store.set_query_flags(&query.name, QueryFlags::COMPLETED).await?;
                    expired += 1;
                }
            }
        }
        if expired > 0 {
            info!(expired, "Expired distributed queries completed");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration;

    async fn setup() -> (Arc<MemoryStore>, QueryService, Environment) {
        let store = Arc::new(MemoryStore::new());
        let env = Environment::new("acme", "fleet.test");
        store.create_environment(&env).await.unwrap();
        (store.clone(), QueryService::new(store), env)
    }

    async fn add_node(store: &MemoryStore, env: &Environment, key: &str, uuid: &str, platform: &str) -> Node {
        let mut node = Node::new(key, uuid, env.uuid.clone());
        node.platform = platform.into();
        node.localname = format!("{}.local", uuid.to_lowercase());
        store.create_node(&node).await.unwrap();
        node
    }

    #[tokio::test]
    async fn test_delivery_until_first_execution() {
        let (store, service, env) = setup().await;
        let n1 = add_node(&store, &env, "k1", "N1", "ubuntu").await;

        let new = NewQuery::standard("SELECT 1", vec![QueryTarget::new(TargetType::Uuid, "n1")]).with_name("q1");
        let query = service.create(&env, new).await.unwrap();
        assert_eq!(query.expected, 1);

        let pending = service.node_queries(&n1).await.unwrap();
        assert_eq!(pending.get("q1").map(String::as_str), Some("SELECT 1"));
        // Polling again before the result lands still delivers
        assert_eq!(service.node_queries(&n1).await.unwrap().len(), 1);

        let accounting = service.record_result("q1", &n1, 0).await.unwrap();
        assert!(accounting.recorded);
        assert!(accounting.completed);
        assert!(service.node_queries(&n1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_uuid_target_ignores_other_nodes() {
        let (store, service, env) = setup().await;
        add_node(&store, &env, "k1", "N1", "ubuntu").await;
        let n2 = add_node(&store, &env, "k2", "N2", "ubuntu").await;

        let new = NewQuery::standard("SELECT 1", vec![QueryTarget::new(TargetType::Uuid, "N1")]);
        service.create(&env, new).await.unwrap();
        assert!(service.node_queries(&n2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_environment_target_is_evaluated_at_delivery() {
        let (store, service, env) = setup().await;
        add_node(&store, &env, "k1", "N1", "ubuntu").await;

        let new = NewQuery::standard("SELECT 1", vec![QueryTarget::new(TargetType::Environment, "acme")]);
        let query = service.create(&env, new).await.unwrap();
        assert_eq!(query.expected, 1);
        assert_eq!(service.targets(&env.uuid, &query.name).await.unwrap()[0].value, env.uuid);

        // A node enrolled after creation still receives the query
        let late = add_node(&store, &env, "k2", "N2", "darwin").await;
        assert!(service.node_queries(&late).await.unwrap().contains_key(&query.name));
        assert_eq!(service.get(&env.uuid, &query.name).await.unwrap().expected, 1);
    }

    #[tokio::test]
    async fn test_expected_is_deduplicated_union() {
        let (store, service, env) = setup().await;
        add_node(&store, &env, "k1", "N1", "ubuntu").await;
        add_node(&store, &env, "k2", "N2", "darwin").await;
        add_node(&store, &env, "k3", "N3", "windows").await;

        let targets = vec![
            QueryTarget::new(TargetType::Platform, "ubuntu"),
            QueryTarget::new(TargetType::Uuid, "N1"),
            QueryTarget::new(TargetType::Localname, "n2.local"),
        ];
        let query = service.create(&env, NewQuery::standard("SELECT 1", targets)).await.unwrap();
        assert_eq!(query.expected, 2);
    }

    #[tokio::test]
    async fn test_no_targets_matches_nothing() {
        let (store, service, env) = setup().await;
        let n1 = add_node(&store, &env, "k1", "N1", "ubuntu").await;
        let query = service.create(&env, NewQuery::standard("SELECT 1", vec![])).await.unwrap();
        assert_eq!(query.expected, 0);
        assert!(service.node_queries(&n1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_environment_target_rejected() {
        let (_, service, env) = setup().await;
        let new = NewQuery::standard("SELECT 1", vec![QueryTarget::new(TargetType::Environment, "nope")]);
        assert!(matches!(service.create(&env, new).await, Err(DbError::Validation(_))));
    }

    #[tokio::test]
    async fn test_completion_stays_until_reactivated() {
        let (store, service, env) = setup().await;
        let n1 = add_node(&store, &env, "k1", "N1", "ubuntu").await;
        let n2 = add_node(&store, &env, "k2", "N2", "ubuntu").await;
        let new = NewQuery::standard("SELECT 1", vec![QueryTarget::new(TargetType::Platform, "ubuntu")]).with_name("q");
        service.create(&env, new).await.unwrap();

        assert!(!service.record_result("q", &n1, 0).await.unwrap().completed);
        assert!(service.record_result("q", &n2, 1).await.unwrap().completed);
        let q = service.get(&env.uuid, "q").await.unwrap();
        assert!(q.completed && !q.active);
        assert_eq!((q.executions, q.errors), (1, 1));

        let q = service.activate(&env.uuid, "q").await.unwrap();
        assert!(q.active && !q.completed);
        // Executed nodes are still filtered after reactivation
        assert!(service.node_queries(&n1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_protected() {
        let (_, service, env) = setup().await;
        let mut new = NewQuery::standard("SELECT 1", vec![]).with_name("keep");
        new.protected = true;
        service.create(&env, new).await.unwrap();
        assert!(matches!(service.delete(&env.uuid, "keep").await, Err(DbError::InvalidState(_))));

        service
            .create(&env, NewQuery::standard("SELECT 2", vec![]).with_name("gone"))
            .await
            .unwrap();
        let q = service.delete(&env.uuid, "gone").await.unwrap();
        assert!(q.deleted && !q.active);
        assert!(service.activate(&env.uuid, "gone").await.is_err());

        let listed = service.list(&env.uuid, QueryFilter::All, false).await.unwrap();
        assert_eq!(listed.len(), 1);
        let deleted = service.list(&env.uuid, QueryFilter::Deleted, false).await.unwrap();
        assert_eq!(deleted[0].name, "gone");
    }

    #[tokio::test]
    async fn test_hidden_queries_listed_on_request() {
        let (_, service, env) = setup().await;
        let mut new = NewQuery::standard("SELECT 1", vec![]);
        new.hidden = true;
        service.create(&env, new).await.unwrap();
        assert!(service.list(&env.uuid, QueryFilter::All, false).await.unwrap().is_empty());
        assert_eq!(service.list(&env.uuid, QueryFilter::All, true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let (store, service, env) = setup().await;
        let n1 = add_node(&store, &env, "k1", "N1", "ubuntu").await;
        let mut new = NewQuery::standard("SELECT 1", vec![QueryTarget::new(TargetType::Uuid, "N1")]).with_name("old");
        new.expires_at = Some(Utc::now() - Duration::minutes(1));
        service.create(&env, new).await.unwrap();

        // Expired queries are not delivered even before cleanup runs
        assert!(service.node_queries(&n1).await.unwrap().is_empty());

        assert_eq!(service.cleanup_expired(Utc::now()).await.unwrap(), 1);
        assert!(service.get(&env.uuid, "old").await.unwrap().completed);
        assert_eq!(service.cleanup_expired(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_carve_query_text_and_name() {
        let (_, service, env) = setup().await;
        let query = service.create_carve(&env, "/etc/hosts", vec![], "admin").await.unwrap();
        assert!(query.name.starts_with("carve_"));
        assert_eq!(query.query_type, QueryType::Carve);
        assert!(query.query.contains("/etc/hosts"));
        assert_eq!(query.path.as_deref(), Some("/etc/hosts"));
    }
}
