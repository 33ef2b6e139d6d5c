//! Node Registry Service
//!
//! Enrollment, node-key authentication, liveness stamps and removal.

use chrono::Utc;
use fleet_core::ids::{generate_node_key, normalize_node_key, normalize_uuid, valid_uuid};
use fleet_core::{ArchiveTrigger, ArchivedNode, EnrollRequest, Environment, LivenessKind, Node, NodeMetadata};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::store::{FleetStore, Touch};

/// Why an enrollment was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollRejection {
    InvalidSecret,
    EnrollsDisabled,
    MissingIdentifier,
    /// Identifier unusable as a storage key (separators, `..`, control characters)
    InvalidIdentifier,
}

impl EnrollRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidSecret => "invalid_secret",
            Self::EnrollsDisabled => "enrolls_disabled",
            Self::MissingIdentifier => "missing_identifier",
            Self::InvalidIdentifier => "invalid_identifier",
        }
    }
}

/// Result of an enrollment attempt
#[derive(Debug, Clone)]
pub enum EnrollOutcome {
    Enrolled {
        node: Node,
        /// A prior record for the same UUID was archived
        reenrolled: bool,
    },
    Rejected(EnrollRejection),
}

/// Node Registry Service
pub struct NodeService {
    store: Arc<dyn FleetStore>,
}

impl NodeService {
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self { store }
    }

    /// Enroll a node into `env`.
    ///
    /// Rejections never touch the store. A UUID that already has a live
    /// record is archived with trigger `exists` and then overwritten.
    pub async fn enroll(&self, env: &Environment, request: EnrollRequest) -> DbResult<EnrollOutcome> {
        if !env.accept_enrolls {
            return Ok(EnrollOutcome::Rejected(EnrollRejection::EnrollsDisabled));
        }
        if !env.check_secret(&request.secret) {
            return Ok(EnrollOutcome::Rejected(EnrollRejection::InvalidSecret));
        }
        let uuid = normalize_uuid(&request.host_identifier);
        if uuid.is_empty() {
            return Ok(EnrollOutcome::Rejected(EnrollRejection::MissingIdentifier));
        }
        if !valid_uuid(&uuid) {
            warn!(environment = %env.name, host_identifier = ?request.host_identifier, "Enrollment with unusable identifier");
            return Ok(EnrollOutcome::Rejected(EnrollRejection::InvalidIdentifier));
        }

        let mut node = Node::new(generate_node_key(&uuid), uuid.clone(), env.uuid.clone());
        let details = &request.host_details;
        node.platform = match details.platform() {
            p if p.is_empty() => request.platform_type.clone(),
            p => p,
        };
        node.platform_version = details.platform_version();
        node.osquery_version = details.osquery_version();
        node.hostname = details.hostname();
        node.localname = details.localname();
        node.hardware_serial = details.hardware_serial();
        node.cpu = details.cpu();
        node.memory = details.memory();
        node.ip_address = request.ip_address.clone();
        node.raw_enroll = request.raw.clone();

        let reenrolled = match self.store.get_node_by_uuid(&env.uuid, &uuid).await? {
            Some(previous) => {
                self.store.archive_node(&previous, ArchiveTrigger::Exists).await?;
                node.created_at = previous.created_at;
                self.store.update_node(&node).await?;
                true
            }
            None => {
                self.store.create_node(&node).await?;
                false
            }
        };

        info!(
            environment = %env.name,
            uuid = %node.uuid,
            platform = %node.platform,
            reenrolled,
            "Node enrolled"
        );
        Ok(EnrollOutcome::Enrolled { node, reenrolled })
    }

    /// Resolve a node key to a live node of `env`
    pub async fn authenticate(&self, env: &Environment, node_key: &str) -> DbResult<Option<Node>> {
        let key = normalize_node_key(node_key);
        if key.is_empty() {
            return Ok(None);
        }
        let node = self.store.get_node_by_key(&key).await?;
        Ok(node.filter(|n| n.environment == env.uuid))
    }

    /// Stamp a liveness timestamp. Failures are logged and swallowed.
    pub async fn touch(&self, node_key: &str, kind: LivenessKind, ip_address: Option<&str>, bytes: u64) {
        let touch = Touch {
            kind,
            at: Utc::now(),
            ip_address,
            bytes,
        };
        match self.store.touch_node(node_key, touch).await {
            Ok(true) => {}
            Ok(false) => debug!(kind = kind.as_str(), "Liveness stamp for unknown node key"),
            Err(e) => warn!(error = %e, kind = kind.as_str(), "Failed to stamp node liveness"),
        }
    }

    /// Merge batch metadata into the node record
    pub async fn update_metadata(&self, node_key: &str, metadata: &NodeMetadata) -> DbResult<bool> {
        self.store.update_node_metadata(node_key, metadata).await
    }

    pub async fn get(&self, environment: &str, uuid: &str) -> DbResult<Node> {
        self.store
            .get_node_by_uuid(environment, &normalize_uuid(uuid))
            .await?
            .ok_or_else(|| DbError::NotFound(format!("node {uuid}")))
    }

    pub async fn list(&self, environment: &str) -> DbResult<Vec<Node>> {
        self.store.list_nodes(environment).await
    }

    pub async fn archived(&self, environment: &str, uuid: &str) -> DbResult<Vec<ArchivedNode>> {
        self.store.list_archived_nodes(environment, &normalize_uuid(uuid)).await
    }

    /// Archive with trigger `removed`, then drop the live record
    pub async fn remove(&self, environment: &str, uuid: &str) -> DbResult<Node> {
        let node = self.get(environment, uuid).await?;
        self.store.archive_node(&node, ArchiveTrigger::Removed).await?;
        self.store.delete_node(environment, &node.uuid).await?;
        info!(environment = %environment, uuid = %node.uuid, "Node removed");
        Ok(node)
    }
}
