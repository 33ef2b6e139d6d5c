//! Carve session and block types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Carve session lifecycle
///
/// `scheduled → in_progress → completed → archiving → archived`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarveStatus {
    /// Announced by a query result, no init received yet
    Scheduled,
    /// Init received, blocks arriving
    InProgress,
    /// Every block index received
    Completed,
    /// Reassembly running
    Archiving,
    /// Reassembled artifact available
    Archived,
}

impl CarveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Archiving => "archiving",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "archiving" => Some(Self::Archiving),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

impl std::fmt::Display for CarveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a block's bytes live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ref", rename_all = "snake_case")]
pub enum BlockData {
    /// Stored in the database row itself
    Inline(Vec<u8>),
    /// File on local disk
    Local(PathBuf),
    /// Object-storage URL (`s3://bucket/key`)
    Remote(String),
}

impl BlockData {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Inline(_) => "inline",
            Self::Local(_) => "local",
            Self::Remote(_) => "remote",
        }
    }
}

/// One received block of a carve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarveBlock {
    pub session_id: String,
    pub block_id: u64,
    pub size: u64,
    pub data: BlockData,
    pub created_at: DateTime<Utc>,
}

/// Location of a reassembled carve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArchiveLocation {
    Local { path: PathBuf },
    Remote { bucket: String, key: String },
}

impl ArchiveLocation {
    /// File name presented to downloaders
    pub fn file_name(&self) -> String {
        match self {
            Self::Local { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Self::Remote { key, .. } => key.rsplit('/').next().unwrap_or_default().to_string(),
        }
    }
}

/// Carve session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarveSession {
    /// Server-issued session identifier; empty while scheduled
    pub session_id: String,
    /// Agent-generated carve GUID
    pub carve_id: String,
    /// Name of the carve query that requested this session
    pub request_id: String,
    /// Owning environment UUID
    pub environment: String,
    pub node_uuid: String,
    pub path: String,
    pub block_count: u64,
    pub block_size: u64,
    pub carve_size: u64,
    pub completed_blocks: u64,
    pub status: CarveStatus,
    pub archive: Option<ArchiveLocation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CarveSession {
    /// All block indices received
    pub fn is_complete(&self) -> bool {
        self.block_count > 0 && self.completed_blocks >= self.block_count
    }
}

/// Carve init parameters sent by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarveInit {
    pub block_count: u64,
    pub block_size: u64,
    pub carve_size: u64,
    pub carve_id: String,
    pub request_id: String,
}

/// Carve announced in a query write result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledCarve {
    pub carve_id: String,
    pub request_id: String,
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_data_serde_tagging() {
        let data = BlockData::Local(PathBuf::from("/tmp/b0"));
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["kind"], "local");
        let back: BlockData = serde_json::from_value(json).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_archive_file_name() {
        let local = ArchiveLocation::Local {
            path: PathBuf::from("/var/carves/N1_s_-etc-hosts.tar"),
        };
        assert_eq!(local.file_name(), "N1_s_-etc-hosts.tar");
        let remote = ArchiveLocation::Remote {
            bucket: "b".into(),
            key: "env/N1/s/-etc-hosts.tar.zst".into(),
        };
        assert_eq!(remote.file_name(), "-etc-hosts.tar.zst");
    }

    #[test]
    fn test_status_parse() {
        for status in [
            CarveStatus::Scheduled,
            CarveStatus::InProgress,
            CarveStatus::Completed,
            CarveStatus::Archiving,
            CarveStatus::Archived,
        ] {
            assert_eq!(CarveStatus::parse(status.as_str()), Some(status));
        }
    }
}
