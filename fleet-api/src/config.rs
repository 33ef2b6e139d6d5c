//! Service configuration
//!
//! Loaded from a TOML file, then overlaid by `FLEET_*` environment
//! variables. Every section is optional; defaults describe a single-process
//! deployment with the in-memory store and inline carve blocks.

use fleet_core::AccessLevel;
use fleet_ingest::{DispatchConfig, SinkConfig};
use fleet_storage::{BackendType, CarverConfig, S3Config};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ApiError, ApiResult};
use crate::telemetry::{LogConfig, LogFormat, LogLevel, MetricsConfig};

/// Default port
pub const DEFAULT_PORT: u16 = 8080;

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    /// Largest accepted request body, after decompression
    pub max_body_size: usize,
    pub request_timeout_secs: u64,
    /// Interval of the expired query sweep
    pub cleanup_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            enable_cors: false,
            max_body_size: 32 * 1024 * 1024,
            request_timeout_secs: 30,
            cleanup_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Store selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `memory`, `sqlite::memory:` or `sqlite:<path>`
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "memory".to_string(),
        }
    }
}

/// Operator API token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorToken {
    pub token: String,
    pub user: String,
    /// Environment name or UUID (`*` for all) to granted level
    #[serde(default)]
    pub grants: BTreeMap<String, AccessLevel>,
}

/// Full service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub carver: CarverConfig,
    pub sinks: Vec<SinkConfig>,
    pub dispatch: DispatchConfig,
    pub metrics: MetricsConfig,
    pub logging: LogConfig,
    /// Initial `service -> key -> value` settings
    pub settings: BTreeMap<String, BTreeMap<String, toml::Value>>,
    pub operators: Vec<OperatorToken>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            carver: CarverConfig::default(),
            sinks: vec![SinkConfig::Db],
            dispatch: DispatchConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LogConfig::default(),
            settings: BTreeMap::new(),
            operators: Vec::new(),
        }
    }
}

impl FleetConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> ApiResult<Self> {
        toml::from_str(text).map_err(|e| ApiError::Configuration(e.to_string()))
    }

    /// Load from `path` when given, then apply the process environment
    pub fn load(path: Option<&Path>) -> ApiResult<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ApiError::Configuration(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay `FLEET_*` variables read through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ApiResult<()> {
        if let Some(host) = lookup("FLEET_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("FLEET_PORT") {
            self.server.port = parse_var("FLEET_PORT", &port)?;
        }
        if let Some(cors) = lookup("FLEET_ENABLE_CORS") {
            self.server.enable_cors = parse_flag(&cors);
        }
        if let Some(url) = lookup("FLEET_DATABASE_URL") {
            self.database.url = url;
        }

        if let Some(backend) = lookup("FLEET_CARVER_BACKEND") {
            self.carver.backend = match backend.to_ascii_lowercase().as_str() {
                "db" => BackendType::Db,
                "local" => BackendType::Local,
                "s3" => BackendType::S3,
                other => {
                    return Err(ApiError::Configuration(format!(
                        "FLEET_CARVER_BACKEND: unknown backend '{other}'"
                    )))
                }
            };
        }
        if let Some(path) = lookup("FLEET_CARVER_PATH") {
            self.carver.path = PathBuf::from(path);
        }
        if let Some(bucket) = lookup("FLEET_S3_BUCKET") {
            let s3 = self.carver.s3.get_or_insert_with(S3Config::default);
            s3.bucket = bucket;
            if let Some(region) = lookup("FLEET_S3_REGION") {
                s3.region = region;
            }
            if let Some(endpoint) = lookup("FLEET_S3_ENDPOINT") {
                s3.endpoint = Some(endpoint);
            }
            if let Some(key_id) = lookup("FLEET_S3_ACCESS_KEY_ID") {
                s3.access_key_id = Some(key_id);
            }
            if let Some(secret) = lookup("FLEET_S3_SECRET_ACCESS_KEY") {
                s3.secret_access_key = Some(secret);
            }
            if let Some(path_style) = lookup("FLEET_S3_PATH_STYLE") {
                s3.path_style = parse_flag(&path_style);
            }
        }

        if let Some(workers) = lookup("FLEET_DISPATCH_WORKERS") {
            self.dispatch.workers = parse_var("FLEET_DISPATCH_WORKERS", &workers)?;
        }
        if let Some(path) = lookup("FLEET_DEAD_LETTER_PATH") {
            self.dispatch.dead_letter_path = Some(PathBuf::from(path));
        }
        if let Some(enabled) = lookup("FLEET_METRICS_ENABLED") {
            self.metrics.enabled = parse_flag(&enabled);
        }

        if let Some(level) = lookup("FLEET_LOG_LEVEL") {
            self.logging.level = match level.to_ascii_lowercase().as_str() {
                "trace" => LogLevel::Trace,
                "debug" => LogLevel::Debug,
                "info" => LogLevel::Info,
                "warn" => LogLevel::Warn,
                "error" => LogLevel::Error,
                other => return Err(ApiError::Configuration(format!("FLEET_LOG_LEVEL: unknown level '{other}'"))),
            };
        }
        if let Some(format) = lookup("FLEET_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "pretty" => LogFormat::Pretty,
                "json" => LogFormat::Json,
                "compact" => LogFormat::Compact,
                other => return Err(ApiError::Configuration(format!("FLEET_LOG_FORMAT: unknown format '{other}'"))),
            };
        }

        // Bootstrap administrator, mostly for container deployments
        if let Some(token) = lookup("FLEET_ADMIN_TOKEN").filter(|t| !t.is_empty()) {
            self.operators.push(OperatorToken {
                token,
                user: lookup("FLEET_ADMIN_USER").unwrap_or_else(|| "admin".to_string()),
                grants: BTreeMap::from([("*".to_string(), AccessLevel::Admin)]),
            });
        }
        Ok(())
    }

    /// Flattened `(service, key, value)` settings
    pub fn settings_entries(&self) -> Vec<(String, String, String)> {
        let mut entries = Vec::new();
        for (service, keys) in &self.settings {
            for (key, value) in keys {
                let value = match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                entries.push((service.clone(), key.clone(), value));
            }
        }
        entries
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> ApiResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::Configuration(format!("{name}: invalid value '{value}'")))
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = FleetConfig::default();
        assert_eq!(config.server.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.database.url, "memory");
        assert_eq!(config.carver.backend, BackendType::Db);
        assert_eq!(config.sinks.len(), 1);
        assert!(config.operators.is_empty());
    }

    #[test]
    fn test_from_toml() {
        let config = FleetConfig::from_toml(
            r#"
            [server]
            port = 9000

            [database]
            url = "sqlite:/var/lib/fleet/fleet.db"

            [carver]
            backend = "local"
            path = "/var/lib/fleet/carves"

            [[sinks]]
            type = "stdout"

            [[sinks]]
            type = "file"
            path = "/var/log/fleet/batches.jsonl"

            [dispatch]
            workers = 8

            [settings.logging]
            stdout_enabled = false
            file_enabled = "true"

            [[operators]]
            token = "t0ken"
            user = "alice"
            grants = { acme = "query", "*" = "user" }
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.carver.backend, BackendType::Local);
        assert_eq!(config.sinks.len(), 2);
        assert_eq!(config.dispatch.workers, 8);
        assert_eq!(config.dispatch.queue_capacity, DispatchConfig::default().queue_capacity);
        assert_eq!(config.operators[0].grants.get("acme"), Some(&AccessLevel::Query));

        let entries = config.settings_entries();
        assert!(entries.contains(&("logging".into(), "stdout_enabled".into(), "false".into())));
        assert!(entries.contains(&("logging".into(), "file_enabled".into(), "true".into())));
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("FLEET_PORT", "7000"),
            ("FLEET_DATABASE_URL", "sqlite::memory:"),
            ("FLEET_CARVER_BACKEND", "s3"),
            ("FLEET_S3_BUCKET", "carves"),
            ("FLEET_S3_ENDPOINT", "http://minio:9000"),
            ("FLEET_LOG_FORMAT", "json"),
            ("FLEET_ADMIN_TOKEN", "secret"),
        ]);
        let mut config = FleetConfig::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.carver.backend, BackendType::S3);
        let s3 = config.carver.s3.as_ref().unwrap();
        assert_eq!(s3.bucket, "carves");
        assert_eq!(s3.endpoint.as_deref(), Some("http://minio:9000"));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.operators[0].user, "admin");
        assert_eq!(config.operators[0].grants.get("*"), Some(&AccessLevel::Admin));
    }

    #[test]
    fn test_env_overlay_rejects_bad_values() {
        let mut config = FleetConfig::default();
        assert!(config
            .apply_env(|key| (key == "FLEET_PORT").then(|| "eighty".to_string()))
            .is_err());
        assert!(config
            .apply_env(|key| (key == "FLEET_CARVER_BACKEND").then(|| "ftp".to_string()))
            .is_err());
    }
}
