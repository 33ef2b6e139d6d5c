//! Application state

use fleet_core::{Environment, PermissionChecker, SettingsProvider, StaticPermissions, MemorySettings, SERVICE_TLS, SETTING_DEBUG_HTTP};
use fleet_db::{open_store, CarveService, EnvironmentService, FleetStore, NodeService, QueryService};
use fleet_ingest::{build_sinks, LogDispatcher, SinkPool};
use fleet_storage::{open_block_store, BlockStore};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{FleetConfig, OperatorToken, ServerConfig};
use crate::error::ApiResult;
use crate::telemetry::init_metrics;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn FleetStore>,
    pub environments: Arc<EnvironmentService>,
    pub nodes: Arc<NodeService>,
    pub queries: Arc<QueryService>,
    pub carves: Arc<CarveService>,
    pub logs: Arc<LogDispatcher>,
    pub settings: Arc<dyn SettingsProvider>,
    pub permissions: Arc<dyn PermissionChecker>,
    /// API token to operator user
    pub operators: Arc<HashMap<String, String>>,
    pub metrics: Option<PrometheusHandle>,
    pub server: Arc<ServerConfig>,
    pub started_at: Instant,
}

/// Collaborators injected into the state
pub struct StateParts {
    pub store: Arc<dyn FleetStore>,
    pub blocks: Arc<dyn BlockStore>,
    pub pool: SinkPool,
    pub settings: Arc<dyn SettingsProvider>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub operators: HashMap<String, String>,
    pub metrics: Option<PrometheusHandle>,
    pub server: ServerConfig,
}

impl AppState {
    pub fn new(parts: StateParts) -> Self {
        let store = parts.store;
        let nodes = Arc::new(NodeService::new(store.clone()));
        Self {
            environments: Arc::new(EnvironmentService::new(store.clone())),
            queries: Arc::new(QueryService::new(store.clone())),
            carves: Arc::new(CarveService::new(store.clone(), parts.blocks)),
            logs: Arc::new(LogDispatcher::new(nodes.clone(), Arc::new(parts.pool))),
            nodes,
            store,
            settings: parts.settings,
            permissions: parts.permissions,
            operators: Arc::new(parts.operators),
            metrics: parts.metrics,
            server: Arc::new(parts.server),
            started_at: Instant::now(),
        }
    }

    /// Open the store, carve backend and sinks described by `config`
    pub async fn from_config(config: &FleetConfig) -> ApiResult<Self> {
        let store = open_store(&config.database.url)?;
        store.ping().await?;
        let blocks = open_block_store(&config.carver).await?;

        let settings = MemorySettings::new();
        for (service, key, value) in config.settings_entries() {
            settings.set(&service, &key, value);
        }
        let settings: Arc<dyn SettingsProvider> = Arc::new(settings);

        let sinks = build_sinks(&config.sinks, &store).await?;
        let pool = SinkPool::start(&config.dispatch, sinks, settings.clone()).await?;

        let (permissions, operators) = operator_access(&config.operators);

        tracing::info!(
            database = %config.database.url,
            carver = ?config.carver.backend,
            sinks = ?pool.sink_names(),
            operators = operators.len(),
            "Application state ready"
        );

        Ok(Self::new(StateParts {
            store,
            blocks,
            pool,
            settings,
            permissions: Arc::new(permissions),
            operators,
            metrics: init_metrics(&config.metrics),
            server: config.server.clone(),
        }))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Operator user owning `token`
    pub fn operator(&self, token: &str) -> Option<&str> {
        self.operators.get(token).map(String::as_str)
    }

    /// Whether request bodies for `env` are logged
    pub fn debug_http(&self, env: &Environment) -> bool {
        env.debug_http || self.settings.get_bool(SERVICE_TLS, SETTING_DEBUG_HTTP, false)
    }
}

/// Token map and grants from configured operator tokens
pub fn operator_access(tokens: &[OperatorToken]) -> (StaticPermissions, HashMap<String, String>) {
    let mut permissions = StaticPermissions::new();
    let mut operators = HashMap::new();
    for op in tokens.iter().filter(|op| !op.token.is_empty()) {
        for (environment, level) in &op.grants {
            permissions = permissions.grant(&op.user, environment, *level);
        }
        operators.insert(op.token.clone(), op.user.clone());
    }
    (permissions, operators)
}
