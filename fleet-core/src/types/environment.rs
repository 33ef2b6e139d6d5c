//! Environment (tenant) types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::*;
use crate::ids::random_string;

/// Per-tenant endpoint paths for the node protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPaths {
    pub enroll: String,
    pub config: String,
    pub log: String,
    pub query_read: String,
    pub query_write: String,
    pub carver_init: String,
    pub carver_block: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            enroll: DEFAULT_ENROLL_PATH.to_string(),
            config: DEFAULT_CONFIG_PATH.to_string(),
            log: DEFAULT_LOG_PATH.to_string(),
            query_read: DEFAULT_QUERY_READ_PATH.to_string(),
            query_write: DEFAULT_QUERY_WRITE_PATH.to_string(),
            carver_init: DEFAULT_CARVER_INIT_PATH.to_string(),
            carver_block: DEFAULT_CARVER_BLOCK_PATH.to_string(),
        }
    }
}

/// Node protocol endpoint kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Enroll,
    Config,
    Log,
    QueryRead,
    QueryWrite,
    CarverInit,
    CarverBlock,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enroll => "enroll",
            Self::Config => "config",
            Self::Log => "log",
            Self::QueryRead => "query_read",
            Self::QueryWrite => "query_write",
            Self::CarverInit => "carver_init",
            Self::CarverBlock => "carver_block",
        }
    }
}

impl EndpointPaths {
    /// Resolve a request path segment to the endpoint it is configured for
    pub fn resolve(&self, segment: &str) -> Option<Endpoint> {
        [
            (&self.enroll, Endpoint::Enroll),
            (&self.config, Endpoint::Config),
            (&self.log, Endpoint::Log),
            (&self.query_read, Endpoint::QueryRead),
            (&self.query_write, Endpoint::QueryWrite),
            (&self.carver_init, Endpoint::CarverInit),
            (&self.carver_block, Endpoint::CarverBlock),
        ]
        .into_iter()
        .find(|(path, _)| path.as_str() == segment)
        .map(|(_, endpoint)| endpoint)
    }
}

/// Agent configuration, composed from its parts when served
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decorators: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_table_construction: Option<Value>,
}

impl AgentConfig {
    /// Split a full configuration document into its parts.
    ///
    /// Unknown top-level keys are rejected so a typo does not silently vanish
    /// from what nodes receive.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(map) = value else {
            return Err("configuration must be a JSON object".to_string());
        };
        let mut config = AgentConfig::default();
        for (key, part) in map {
            match key.as_str() {
                "options" => config.options = Some(part),
                "schedule" => config.schedule = Some(part),
                "packs" => config.packs = Some(part),
                "decorators" => config.decorators = Some(part),
                "auto_table_construction" => config.auto_table_construction = Some(part),
                other => return Err(format!("unknown configuration section: {}", other)),
            }
        }
        Ok(config)
    }

    /// Compose the serialized configuration served to nodes
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        let parts = [
            ("options", &self.options),
            ("schedule", &self.schedule),
            ("packs", &self.packs),
            ("decorators", &self.decorators),
            ("auto_table_construction", &self.auto_table_construction),
        ];
        for (key, part) in parts {
            if let Some(part) = part {
                map.insert(key.to_string(), part.clone());
            }
        }
        Value::Object(map)
    }
}

/// Environment record - the tenant boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub uuid: String,
    pub name: String,
    /// Hostname nodes use to reach the service
    pub hostname: String,
    pub env_type: String,
    /// Shared enrollment secret
    pub secret: String,
    pub enroll_secret_path: String,
    pub enroll_expire: DateTime<Utc>,
    pub remove_secret_path: String,
    pub remove_expire: DateTime<Utc>,
    pub paths: EndpointPaths,
    pub configuration: AgentConfig,
    /// PEM certificate distributed to nodes, if any
    pub certificate: String,
    pub config_interval: u32,
    pub log_interval: u32,
    pub query_interval: u32,
    pub accept_enrolls: bool,
    pub debug_http: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Environment {
    /// Create a new environment with generated secrets and default paths
    pub fn new(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        let now = Utc::now();
        let expire = now + Duration::hours(DEFAULT_LINK_EXPIRE_HOURS);
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            hostname: hostname.into(),
            env_type: DEFAULT_ENVIRONMENT_TYPE.to_string(),
            secret: random_string(DEFAULT_SECRET_LENGTH),
            enroll_secret_path: random_string(DEFAULT_SECRET_PATH_LENGTH),
            enroll_expire: expire,
            remove_secret_path: random_string(DEFAULT_SECRET_PATH_LENGTH),
            remove_expire: expire,
            paths: EndpointPaths::default(),
            configuration: AgentConfig::default(),
            certificate: String::new(),
            config_interval: DEFAULT_CONFIG_INTERVAL,
            log_interval: DEFAULT_LOG_INTERVAL,
            query_interval: DEFAULT_QUERY_INTERVAL,
            accept_enrolls: true,
            debug_http: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `identifier` names this environment (by name or UUID)
    pub fn matches(&self, identifier: &str) -> bool {
        self.name == identifier || self.uuid == identifier
    }

    /// Constant-shape comparison of a presented enroll secret
    pub fn check_secret(&self, presented: &str) -> bool {
        let presented = presented.trim().as_bytes();
        let expected = self.secret.trim().as_bytes();
        if presented.len() != expected.len() {
            return false;
        }
        presented
            .iter()
            .zip(expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Serialized configuration served to nodes
    pub fn serialized_config(&self) -> Value {
        self.configuration.to_value()
    }

    pub fn rotate_secret(&mut self) {
        self.secret = random_string(DEFAULT_SECRET_LENGTH);
        self.updated_at = Utc::now();
    }

    pub fn rotate_enroll_path(&mut self) {
        let now = Utc::now();
        self.enroll_secret_path = random_string(DEFAULT_SECRET_PATH_LENGTH);
        self.enroll_expire = now + Duration::hours(DEFAULT_LINK_EXPIRE_HOURS);
        self.updated_at = now;
    }

    pub fn expire_enroll_path(&mut self) {
        let now = Utc::now();
        self.enroll_expire = now;
        self.updated_at = now;
    }

    pub fn rotate_remove_path(&mut self) {
        let now = Utc::now();
        self.remove_secret_path = random_string(DEFAULT_SECRET_PATH_LENGTH);
        self.remove_expire = now + Duration::hours(DEFAULT_LINK_EXPIRE_HOURS);
        self.updated_at = now;
    }

    pub fn expire_remove_path(&mut self) {
        let now = Utc::now();
        self.remove_expire = now;
        self.updated_at = now;
    }

    /// Check a quick-script secret path for the given purpose
    pub fn check_script_path(&self, purpose: ScriptPurpose, path: &str, now: DateTime<Utc>) -> PathCheck {
        let (expected, expire) = match purpose {
            ScriptPurpose::Enroll => (&self.enroll_secret_path, self.enroll_expire),
            ScriptPurpose::Remove => (&self.remove_secret_path, self.remove_expire),
        };
        if expected.is_empty() || expected != path {
            PathCheck::Invalid
        } else if now >= expire {
            PathCheck::Expired
        } else {
            PathCheck::Valid
        }
    }
}

/// Purpose of a quick-script secret path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPurpose {
    Enroll,
    Remove,
}

/// Outcome of a secret path check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathCheck {
    Valid,
    Invalid,
    Expired,
}

/// Environment mutations available to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentAction {
    RotateSecret,
    RotateEnroll,
    ExpireEnroll,
    RotateRemove,
    ExpireRemove,
    AcceptEnrolls,
    RejectEnrolls,
}

impl EnvironmentAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rotate-secret" => Some(Self::RotateSecret),
            "rotate-enroll" => Some(Self::RotateEnroll),
            "expire-enroll" => Some(Self::ExpireEnroll),
            "rotate-remove" => Some(Self::RotateRemove),
            "expire-remove" => Some(Self::ExpireRemove),
            "accept-enrolls" => Some(Self::AcceptEnrolls),
            "reject-enrolls" => Some(Self::RejectEnrolls),
            _ => None,
        }
    }

    /// Apply the mutation to an environment record
    pub fn apply(&self, env: &mut Environment) {
        match self {
            Self::RotateSecret => env.rotate_secret(),
            Self::RotateEnroll => env.rotate_enroll_path(),
            Self::ExpireEnroll => env.expire_enroll_path(),
            Self::RotateRemove => env.rotate_remove_path(),
            Self::ExpireRemove => env.expire_remove_path(),
            Self::AcceptEnrolls => {
                env.accept_enrolls = true;
                env.updated_at = Utc::now();
            }
            Self::RejectEnrolls => {
                env.accept_enrolls = false;
                env.updated_at = Utc::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_environment_defaults() {
        let env = Environment::new("acme", "fleet.example.com");
        assert_eq!(env.secret.len(), DEFAULT_SECRET_LENGTH);
        assert_eq!(env.paths.enroll, "enroll");
        assert_eq!(env.config_interval, 300);
        assert!(env.accept_enrolls);
        assert!(env.matches("acme"));
        assert!(env.matches(&env.uuid.clone()));
    }

    #[test]
    fn test_check_secret_trims() {
        let mut env = Environment::new("acme", "localhost");
        env.secret = "s".to_string();
        assert!(env.check_secret("s\n"));
        assert!(!env.check_secret("x"));
        assert!(!env.check_secret(""));
    }

    #[test]
    fn test_rotation_only_touches_rotated_artifact() {
        let mut env = Environment::new("acme", "localhost");
        let secret = env.secret.clone();
        let remove_path = env.remove_secret_path.clone();
        let enroll_path = env.enroll_secret_path.clone();

        env.rotate_enroll_path();
        assert_ne!(env.enroll_secret_path, enroll_path);
        assert_eq!(env.secret, secret);
        assert_eq!(env.remove_secret_path, remove_path);

        env.rotate_secret();
        assert_ne!(env.secret, secret);
        assert_eq!(env.remove_secret_path, remove_path);
    }

    #[test]
    fn test_script_path_check() {
        let mut env = Environment::new("acme", "localhost");
        let now = Utc::now();
        let path = env.enroll_secret_path.clone();
        assert_eq!(env.check_script_path(ScriptPurpose::Enroll, &path, now), PathCheck::Valid);
        assert_eq!(env.check_script_path(ScriptPurpose::Enroll, "nope", now), PathCheck::Invalid);
        assert_eq!(env.check_script_path(ScriptPurpose::Remove, &path, now), PathCheck::Invalid);

        env.expire_enroll_path();
        let later = Utc::now() + Duration::seconds(1);
        assert_eq!(env.check_script_path(ScriptPurpose::Enroll, &path, later), PathCheck::Expired);
    }

    #[test]
    fn test_endpoint_resolution_with_override() {
        let mut paths = EndpointPaths::default();
        paths.carver_init = "start".to_string();
        assert_eq!(paths.resolve("start"), Some(Endpoint::CarverInit));
        assert_eq!(paths.resolve("init"), None);
        assert_eq!(paths.resolve("read"), Some(Endpoint::QueryRead));
    }

    #[test]
    fn test_agent_config_roundtrip_parts() {
        let config = AgentConfig::from_value(json!({
            "options": {"logger_tls_period": 10},
            "schedule": {"uptime": {"query": "SELECT * FROM uptime;", "interval": 60}}
        }))
        .unwrap();
        let value = config.to_value();
        assert!(value.get("packs").is_none());
        assert_eq!(value["options"]["logger_tls_period"], 10);

        assert!(AgentConfig::from_value(json!({"optoins": {}})).is_err());
    }
}
