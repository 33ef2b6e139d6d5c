//! Environment Registry Service
//!
//! Creates tenants and applies secret/path rotations. Implements the
//! read-only `Environments` collaborator consumed by the protocol layer.

use async_trait::async_trait;
use chrono::Utc;
use fleet_core::{AgentConfig, CoreError, CoreResult, EndpointPaths, Environment, EnvironmentAction, Environments};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use crate::error::{DbError, DbResult};
use crate::store::FleetStore;

/// Names that would shadow fixed routes
const RESERVED_NAMES: &[&str] = &["api", "health", "metrics"];

/// Environment Registry Service
pub struct EnvironmentService {
    store: Arc<dyn FleetStore>,
}

impl EnvironmentService {
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self { store }
    }

    /// Create an environment with generated secrets and default paths
    pub async fn create(&self, name: &str, hostname: &str) -> DbResult<Environment> {
        let name = name.trim();
        if name.is_empty() || name.contains('/') || name.contains(char::is_whitespace) {
            return Err(DbError::Validation(format!("invalid environment name '{name}'")));
        }
        if RESERVED_NAMES.contains(&name) {
            return Err(DbError::Validation(format!("environment name '{name}' is reserved")));
        }
        let env = Environment::new(name, hostname.trim());
        self.store.create_environment(&env).await?;
        info!(environment = %env.name, uuid = %env.uuid, "Environment created");
        Ok(env)
    }

    /// Get by name or UUID
    pub async fn get(&self, identifier: &str) -> DbResult<Environment> {
        self.store
            .get_environment(identifier)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("environment {identifier}")))
    }

    pub async fn find(&self, identifier: &str) -> DbResult<Option<Environment>> {
        self.store.get_environment(identifier).await
    }

    pub async fn list(&self) -> DbResult<Vec<Environment>> {
        self.store.list_environments().await
    }

    /// Apply a rotation/expiry/enrollment toggle
    pub async fn apply_action(&self, identifier: &str, action: EnvironmentAction) -> DbResult<Environment> {
        let mut env = self.get(identifier).await?;
        action.apply(&mut env);
        self.store.update_environment(&env).await?;
        info!(environment = %env.name, action = ?action, "Environment updated");
        Ok(env)
    }

    pub async fn update_configuration(&self, identifier: &str, configuration: AgentConfig) -> DbResult<Environment> {
        let mut env = self.get(identifier).await?;
        env.configuration = configuration;
        env.updated_at = Utc::now();
        self.store.update_environment(&env).await?;
        Ok(env)
    }

    pub async fn update_intervals(
        &self,
        identifier: &str,
        config_interval: u32,
        log_interval: u32,
        query_interval: u32,
    ) -> DbResult<Environment> {
        if config_interval == 0 || log_interval == 0 || query_interval == 0 {
            return Err(DbError::Validation("intervals must be positive".to_string()));
        }
        let mut env = self.get(identifier).await?;
        env.config_interval = config_interval;
        env.log_interval = log_interval;
        env.query_interval = query_interval;
        env.updated_at = Utc::now();
        self.store.update_environment(&env).await?;
        Ok(env)
    }

    /// Override the protocol endpoint paths; every path must be a distinct single segment
    pub async fn update_paths(&self, identifier: &str, paths: EndpointPaths) -> DbResult<Environment> {
        let all = [
            &paths.enroll,
            &paths.config,
            &paths.log,
            &paths.query_read,
            &paths.query_write,
            &paths.carver_init,
            &paths.carver_block,
        ];
        let distinct: HashSet<&String> = all.iter().copied().collect();
        if distinct.len() != all.len() || all.iter().any(|p| p.is_empty() || p.contains('/')) {
            return Err(DbError::Validation("endpoint paths must be distinct single segments".to_string()));
        }
        let mut env = self.get(identifier).await?;
        env.paths = paths;
        env.updated_at = Utc::now();
        self.store.update_environment(&env).await?;
        Ok(env)
    }
}

#[async_trait]
impl Environments for EnvironmentService {
    async fn get(&self, identifier: &str) -> CoreResult<Environment> {
        self.store
            .get_environment(identifier)
            .await?
            .ok_or_else(|| CoreError::EnvironmentNotFound(identifier.to_string()))
    }

    async fn exists(&self, identifier: &str) -> CoreResult<bool> {
        Ok(self.store.get_environment(identifier).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service() -> EnvironmentService {
        EnvironmentService::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let service = service();
        let env = service.create("acme", "fleet.acme.test").await.unwrap();

        assert!(Environments::exists(&service, "acme").await.unwrap());
        assert!(Environments::exists(&service, &env.uuid).await.unwrap());
        assert!(!Environments::exists(&service, "other").await.unwrap());
        assert!(matches!(
            Environments::get(&service, "other").await,
            Err(CoreError::EnvironmentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_bad_names() {
        let service = service();
        assert!(service.create("", "h").await.is_err());
        assert!(service.create("a/b", "h").await.is_err());
        assert!(service.create("api", "h").await.is_err());
        service.create("acme", "h").await.unwrap();
        assert!(matches!(service.create("acme", "h").await, Err(DbError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_rotation_only_touches_rotated_artifact() {
        let service = service();
        let env = service.create("acme", "h").await.unwrap();

        let rotated = service.apply_action("acme", EnvironmentAction::RotateEnroll).await.unwrap();
        assert_ne!(rotated.enroll_secret_path, env.enroll_secret_path);
        assert_eq!(rotated.secret, env.secret);
        assert_eq!(rotated.remove_secret_path, env.remove_secret_path);

        let rotated = service.apply_action("acme", EnvironmentAction::RotateSecret).await.unwrap();
        assert_ne!(rotated.secret, env.secret);
    }

    #[tokio::test]
    async fn test_update_paths_validation() {
        let service = service();
        service.create("acme", "h").await.unwrap();

        let mut paths = EndpointPaths::default();
        paths.log = paths.config.clone();
        assert!(service.update_paths("acme", paths).await.is_err());

        let mut paths = EndpointPaths::default();
        paths.enroll = "join".into();
        let env = service.update_paths("acme", paths).await.unwrap();
        assert_eq!(env.paths.enroll, "join");
    }
}
