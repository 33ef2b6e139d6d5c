//! Distributed query types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node::Node;
use crate::ids::normalize_uuid;

/// Kind of distributed query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    #[serde(rename = "query")]
    Standard,
    Carve,
    Metadata,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "query",
            Self::Carve => "carve",
            Self::Metadata => "metadata",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "query" | "standard" => Some(Self::Standard),
            "carve" => Some(Self::Carve),
            "metadata" => Some(Self::Metadata),
            _ => None,
        }
    }
}

/// Target predicate kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Environment,
    Platform,
    Uuid,
    Localname,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Environment => "environment",
            Self::Platform => "platform",
            Self::Uuid => "uuid",
            Self::Localname => "localname",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "environment" => Some(Self::Environment),
            "platform" => Some(Self::Platform),
            "uuid" => Some(Self::Uuid),
            "localname" | "hostname" => Some(Self::Localname),
            _ => None,
        }
    }
}

/// A single target row of a query
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryTarget {
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub value: String,
}

impl QueryTarget {
    pub fn new(target_type: TargetType, value: impl Into<String>) -> Self {
        let value = value.into();
        let value = match target_type {
            TargetType::Uuid => normalize_uuid(&value),
            _ => value.trim().to_string(),
        };
        Self { target_type, value }
    }

    /// Whether this target selects `node`.
    ///
    /// Environment targets hold the environment UUID.
    pub fn matches(&self, node: &Node) -> bool {
        match self.target_type {
            TargetType::Environment => node.environment == self.value,
            TargetType::Platform => node.platform.eq_ignore_ascii_case(&self.value),
            TargetType::Uuid => node.uuid == self.value,
            TargetType::Localname => node.localname == self.value,
        }
    }
}

/// Whether any of `targets` selects `node`. An empty target list matches nothing.
pub fn targets_match(targets: &[QueryTarget], node: &Node) -> bool {
    targets.iter().any(|t| t.matches(node))
}

/// Distributed query record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedQuery {
    pub name: String,
    /// Owning environment UUID
    pub environment: String,
    pub query: String,
    pub creator: String,
    pub query_type: QueryType,
    /// Carve target path, for carve queries
    pub path: Option<String>,
    /// Matching node count frozen at creation
    pub expected: u64,
    pub executions: u64,
    pub errors: u64,
    pub active: bool,
    pub completed: bool,
    pub deleted: bool,
    pub hidden: bool,
    pub protected: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DistributedQuery {
    /// Whether execution accounting reached the expected count
    pub fn accounting_complete(&self) -> bool {
        self.executions + self.errors >= self.expected
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Request to create a distributed query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQuery {
    /// Explicit name; generated when absent
    #[serde(default)]
    pub name: Option<String>,
    pub query: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default = "default_query_type")]
    pub query_type: QueryType,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub targets: Vec<QueryTarget>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_query_type() -> QueryType {
    QueryType::Standard
}

impl NewQuery {
    pub fn standard(query: impl Into<String>, targets: Vec<QueryTarget>) -> Self {
        Self {
            name: None,
            query: query.into(),
            creator: String::new(),
            query_type: QueryType::Standard,
            path: None,
            targets,
            hidden: false,
            protected: false,
            expires_at: None,
        }
    }

    /// Carve request for `path`
    pub fn carve(path: impl Into<String>, targets: Vec<QueryTarget>) -> Self {
        let path = path.into();
        Self {
            name: None,
            query: carve_query_text(&path),
            creator: String::new(),
            query_type: QueryType::Carve,
            path: Some(path),
            targets,
            hidden: false,
            protected: false,
            expires_at: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }
}

/// Query text that asks the agent to carve `path`
pub fn carve_query_text(path: &str) -> String {
    format!(
        "SELECT * FROM carves WHERE carve=1 AND path LIKE '{}';",
        path.replace('\'', "''")
    )
}

/// Execution fact: node `uuid` received and answered query `name`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryExecution {
    pub name: String,
    pub uuid: String,
    pub environment: String,
    pub result: i64,
    pub created_at: DateTime<Utc>,
}

/// Listing filter for queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryFilter {
    #[default]
    All,
    Active,
    Completed,
    Deleted,
}

impl QueryFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(Self::All),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    pub fn accepts(&self, q: &DistributedQuery) -> bool {
        match self {
            Self::All => !q.deleted,
            Self::Active => q.active && !q.deleted,
            Self::Completed => q.completed && !q.deleted,
            Self::Deleted => q.deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(uuid: &str, env: &str, platform: &str, localname: &str) -> Node {
        let mut node = Node::new("k", uuid, env);
        node.platform = platform.into();
        node.localname = localname.into();
        node
    }

    #[test]
    fn test_uuid_target_matches_only_that_node() {
        let target = QueryTarget::new(TargetType::Uuid, "n1");
        assert_eq!(target.value, "N1");
        assert!(target.matches(&node("N1", "e1", "darwin", "a")));
        assert!(!target.matches(&node("N2", "e1", "darwin", "a")));
    }

    #[test]
    fn test_any_target_semantics() {
        let targets = vec![
            QueryTarget::new(TargetType::Platform, "Ubuntu"),
            QueryTarget::new(TargetType::Localname, "web-1"),
        ];
        assert!(targets_match(&targets, &node("A", "e", "ubuntu", "x")));
        assert!(targets_match(&targets, &node("B", "e", "darwin", "web-1")));
        assert!(!targets_match(&targets, &node("C", "e", "darwin", "x")));
        assert!(!targets_match(&[], &node("C", "e", "darwin", "x")));
    }

    #[test]
    fn test_carve_query_text_escapes_quotes() {
        let q = NewQuery::carve("/tmp/it's", vec![]);
        assert_eq!(q.query_type, QueryType::Carve);
        assert!(q.query.contains("'/tmp/it''s'"));
    }

    #[test]
    fn test_query_type_wire_names() {
        assert_eq!(serde_json::to_string(&QueryType::Standard).unwrap(), "\"query\"");
        assert_eq!(QueryType::parse("carve"), Some(QueryType::Carve));
        assert_eq!(TargetType::parse("hostname"), Some(TargetType::Localname));
    }
}
