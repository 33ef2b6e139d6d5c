//! Node (enrolled agent) types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Enrolled node record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Server-issued capability token
    pub node_key: String,
    /// Caller-asserted identity (normalized, upper-case)
    pub uuid: String,
    /// Owning environment UUID
    pub environment: String,
    pub platform: String,
    pub platform_version: String,
    pub osquery_version: String,
    pub hostname: String,
    pub localname: String,
    pub hardware_serial: String,
    pub cpu: String,
    pub memory: String,
    pub username: String,
    pub osquery_user: String,
    pub config_hash: String,
    pub daemon_hash: String,
    pub ip_address: String,
    pub bytes_received: u64,
    /// Raw enrollment payload as presented by the agent
    pub raw_enroll: Value,
    pub last_status: Option<DateTime<Utc>>,
    pub last_result: Option<DateTime<Utc>>,
    pub last_config: Option<DateTime<Utc>>,
    pub last_query_read: Option<DateTime<Utc>>,
    pub last_query_write: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Create a node record with empty metadata
    pub fn new(node_key: impl Into<String>, uuid: impl Into<String>, environment: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            node_key: node_key.into(),
            uuid: uuid.into(),
            environment: environment.into(),
            platform: String::new(),
            platform_version: String::new(),
            osquery_version: String::new(),
            hostname: String::new(),
            localname: String::new(),
            hardware_serial: String::new(),
            cpu: String::new(),
            memory: String::new(),
            username: String::new(),
            osquery_user: String::new(),
            config_hash: String::new(),
            daemon_hash: String::new(),
            ip_address: String::new(),
            bytes_received: 0,
            raw_enroll: Value::Null,
            last_status: None,
            last_result: None,
            last_config: None,
            last_query_read: None,
            last_query_write: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Most recent protocol contact of any kind
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        [
            self.last_status,
            self.last_result,
            self.last_config,
            self.last_query_read,
            self.last_query_write,
        ]
        .into_iter()
        .flatten()
        .max()
    }
}

/// Reason a node record was archived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveTrigger {
    /// UUID re-enrolled while a record existed
    Exists,
    /// Removed by the agent or an operator
    Removed,
}

impl ArchiveTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exists => "exists",
            Self::Removed => "removed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exists" => Some(Self::Exists),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

/// Archived (soft-deleted) node record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedNode {
    pub node: Node,
    pub trigger: ArchiveTrigger,
    pub archived_at: DateTime<Utc>,
}

/// Kind of protocol contact stamped on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessKind {
    Status,
    Result,
    Config,
    QueryRead,
    QueryWrite,
}

impl LivenessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Result => "result",
            Self::Config => "config",
            Self::QueryRead => "query_read",
            Self::QueryWrite => "query_write",
        }
    }

    /// Stamp `at` on the matching field of `node`
    pub fn stamp(&self, node: &mut Node, at: DateTime<Utc>) {
        match self {
            Self::Status => node.last_status = Some(at),
            Self::Result => node.last_result = Some(at),
            Self::Config => node.last_config = Some(at),
            Self::QueryRead => node.last_query_read = Some(at),
            Self::QueryWrite => node.last_query_write = Some(at),
        }
    }
}

/// Host details presented at enrollment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostDetails {
    #[serde(default)]
    pub os_version: Value,
    #[serde(default)]
    pub osquery_info: Value,
    #[serde(default)]
    pub system_info: Value,
    #[serde(default)]
    pub platform_info: Value,
}

impl HostDetails {
    fn field(section: &Value, key: &str) -> String {
        match section.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    }

    pub fn platform(&self) -> String {
        Self::field(&self.os_version, "platform")
    }

    pub fn platform_version(&self) -> String {
        Self::field(&self.os_version, "version")
    }

    pub fn osquery_version(&self) -> String {
        Self::field(&self.osquery_info, "version")
    }

    pub fn hostname(&self) -> String {
        Self::field(&self.system_info, "hostname")
    }

    pub fn localname(&self) -> String {
        Self::field(&self.system_info, "local_hostname")
    }

    pub fn hardware_serial(&self) -> String {
        Self::field(&self.system_info, "hardware_serial")
    }

    pub fn cpu(&self) -> String {
        Self::field(&self.system_info, "cpu_brand")
    }

    pub fn memory(&self) -> String {
        Self::field(&self.system_info, "physical_memory")
    }
}

/// Enrollment request as seen by the node registry
#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub secret: String,
    pub host_identifier: String,
    pub platform_type: String,
    pub host_details: HostDetails,
    pub ip_address: String,
    pub raw: Value,
}

/// Metadata extracted from a log batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub uuid: String,
    pub hostname: String,
    pub localname: String,
    pub username: String,
    pub osquery_user: String,
    pub config_hash: String,
    pub daemon_hash: String,
    pub osquery_version: String,
}

impl NodeMetadata {
    /// Merge non-empty fields into a node record
    pub fn apply(&self, node: &mut Node) {
        let pairs: [(&String, &mut String); 7] = [
            (&self.hostname, &mut node.hostname),
            (&self.localname, &mut node.localname),
            (&self.username, &mut node.username),
            (&self.osquery_user, &mut node.osquery_user),
            (&self.config_hash, &mut node.config_hash),
            (&self.daemon_hash, &mut node.daemon_hash),
            (&self.osquery_version, &mut node.osquery_version),
        ];
        for (value, field) in pairs {
            if !value.is_empty() {
                *field = value.clone();
            }
        }
    }
}
