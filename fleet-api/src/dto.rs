//! Request and response bodies

use chrono::{DateTime, Utc};
use fleet_core::{
    AgentConfig, CarveSession, DistributedQuery, Environment, HostDetails, Node, QueryExecution,
    QueryTarget, QueryType,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ==================== Node protocol ====================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnrollBody {
    pub enroll_secret: String,
    pub host_identifier: String,
    pub platform_type: String,
    pub host_details: HostDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollReply {
    pub node_key: String,
    pub node_invalid: bool,
}

/// Body carrying only the node key (config, read)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeKeyBody {
    pub node_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogBody {
    pub node_key: String,
    pub log_type: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReply {
    pub node_invalid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReply {
    pub queries: HashMap<String, String>,
    pub node_invalid: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WriteBody {
    pub node_key: String,
    pub queries: HashMap<String, Value>,
    pub statuses: HashMap<String, i64>,
    pub messages: HashMap<String, String>,
}

/// Result row announcing a carve started by a carve query
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CarveRow {
    pub carve: String,
    pub carve_guid: String,
    pub request_id: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CarveInitBody {
    pub node_key: String,
    pub block_count: u64,
    pub block_size: u64,
    pub carve_size: u64,
    pub carve_id: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarveInitReply {
    pub success: bool,
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CarveBlockBody {
    pub block_id: u64,
    pub session_id: String,
    pub request_id: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarveBlockReply {
    pub success: bool,
}

/// Quick-script rejection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRejection {
    pub message: String,
}

// ==================== Operator API ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateEnvironmentRequest {
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub configuration: Option<AgentConfig>,
}

/// Environment without its secrets, for non-admin readers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSummary {
    pub uuid: String,
    pub name: String,
    pub hostname: String,
    pub env_type: String,
    pub accept_enrolls: bool,
    pub config_interval: u32,
    pub log_interval: u32,
    pub query_interval: u32,
    pub created_at: DateTime<Utc>,
}

impl From<&Environment> for EnvironmentSummary {
    fn from(env: &Environment) -> Self {
        Self {
            uuid: env.uuid.clone(),
            name: env.name.clone(),
            hostname: env.hostname.clone(),
            env_type: env.env_type.clone(),
            accept_enrolls: env.accept_enrolls,
            config_interval: env.config_interval,
            log_interval: env.log_interval,
            query_interval: env.query_interval,
            created_at: env.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub uuid: String,
    pub hostname: String,
    pub localname: String,
    pub platform: String,
    pub platform_version: String,
    pub osquery_version: String,
    pub ip_address: String,
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<&Node> for NodeSummary {
    fn from(node: &Node) -> Self {
        Self {
            uuid: node.uuid.clone(),
            hostname: node.hostname.clone(),
            localname: node.localname.clone(),
            platform: node.platform.clone(),
            platform_version: node.platform_version.clone(),
            osquery_version: node.osquery_version.clone(),
            ip_address: node.ip_address.clone(),
            last_seen: node.last_seen(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateQueryRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub query: String,
    #[serde(default)]
    pub targets: Vec<QueryTarget>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListQueriesParams {
    /// `all`, `active`, `completed` or `deleted`
    pub status: Option<String>,
    pub include_hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDetails {
    #[serde(flatten)]
    pub query: DistributedQuery,
    pub targets: Vec<QueryTarget>,
    pub executions: Vec<QueryExecution>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCarveRequest {
    pub path: String,
    #[serde(default)]
    pub targets: Vec<QueryTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarveCreated {
    pub name: String,
    pub query_type: QueryType,
    pub expected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarveListResponse {
    pub carves: Vec<CarveSession>,
    pub total: usize,
}
