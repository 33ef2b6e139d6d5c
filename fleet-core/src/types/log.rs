//! Telemetry batch types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of telemetry batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Status,
    Result,
    /// Distributed query results forwarded from the write endpoint
    Query,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Result => "result",
            Self::Query => "query",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "status" => Some(Self::Status),
            "result" => Some(Self::Result),
            "query" => Some(Self::Query),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw batch handed to every sink, unmodified
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogBatch {
    pub log_type: LogType,
    /// Environment UUID
    pub environment: String,
    pub environment_name: String,
    pub uuid: String,
    /// Query name, for `LogType::Query`
    pub query_name: Option<String>,
    /// Query status code, for `LogType::Query`
    pub status: Option<i64>,
    pub data: Value,
    pub received_at: DateTime<Utc>,
}

/// Persisted log record for the database sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub log_type: LogType,
    /// Environment UUID
    pub environment: String,
    pub uuid: String,
    pub query_name: Option<String>,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl From<&LogBatch> for LogRecord {
    fn from(batch: &LogBatch) -> Self {
        Self {
            log_type: batch.log_type,
            environment: batch.environment.clone(),
            uuid: batch.uuid.clone(),
            query_name: batch.query_name.clone(),
            data: batch.data.clone(),
            created_at: batch.received_at,
        }
    }
}
