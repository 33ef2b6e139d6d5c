//! Carve Service
//!
//! Session initialisation, idempotent block uploads and lazy archival.
//!
//! Archival is guarded by a status compare-and-swap
//! (`completed → archiving → archived`). A caller that loses the swap polls
//! until the winner finishes and reuses its archive. An `archiving` status
//! older than `ARCHIVE_STALE_AFTER` is taken to be abandoned and is swapped
//! back to `completed` so archival can be retried.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use fleet_core::ids::generate_session_id;
use fleet_core::{
    targets_match, ArchiveLocation, CarveBlock, CarveInit, CarveSession, CarveStatus, Node, QueryType,
    ScheduledCarve,
};
use fleet_storage::backend::verify_blocks;
use fleet_storage::{Artifact, ArchiveTarget, BlockKey, BlockStore, StorageError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::store::FleetStore;

/// How often and how long a losing archiver polls for the winner
const ARCHIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ARCHIVE_POLL_ATTEMPTS: u32 = 300;

/// Age at which an in-flight archival is considered abandoned
const ARCHIVE_STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// One block as posted by the agent
#[derive(Debug, Clone)]
pub struct BlockUpload {
    pub session_id: String,
    pub request_id: String,
    pub block_id: u64,
    /// Base64-encoded block bytes
    pub data: String,
}

/// Carve Service
pub struct CarveService {
    store: Arc<dyn FleetStore>,
    blocks: Arc<dyn BlockStore>,
}

impl CarveService {
    pub fn new(store: Arc<dyn FleetStore>, blocks: Arc<dyn BlockStore>) -> Self {
        Self { store, blocks }
    }

    pub fn block_store(&self) -> &Arc<dyn BlockStore> {
        &self.blocks
    }

    /// Record a carve announced in a query result as `scheduled`
    pub async fn schedule(&self, node: &Node, scheduled: &ScheduledCarve) -> DbResult<CarveSession> {
        if scheduled.carve_id.is_empty() {
            return Err(DbError::Validation("scheduled carve without carve id".to_string()));
        }
        if let Some(existing) = self.store.get_carve_by_carve_id(&scheduled.carve_id).await? {
            return Ok(existing);
        }
        let now = Utc::now();
        let carve = CarveSession {
            session_id: String::new(),
            carve_id: scheduled.carve_id.clone(),
            request_id: scheduled.request_id.clone(),
            environment: node.environment.clone(),
            node_uuid: node.uuid.clone(),
            path: scheduled.path.clone(),
            block_count: 0,
            block_size: 0,
            carve_size: 0,
            completed_blocks: 0,
            status: CarveStatus::Scheduled,
            archive: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_carve(&carve).await?;
        debug!(carve_id = %carve.carve_id, uuid = %node.uuid, "Carve scheduled");
        Ok(carve)
    }

    /// Open a session; `None` when the request is not backed by a carve
    /// scheduled for, or a carve query targeting, this node.
    pub async fn init(&self, node: &Node, init: CarveInit) -> DbResult<Option<CarveSession>> {
        if init.block_count == 0 || init.block_size == 0 || init.carve_id.is_empty() {
            return Ok(None);
        }

        let existing = self.store.get_carve_by_carve_id(&init.carve_id).await?;
        if let Some(carve) = &existing {
            if carve.node_uuid != node.uuid || carve.environment != node.environment {
                return Ok(None);
            }
            if carve.status != CarveStatus::Scheduled {
                // Retried init of a session already opened
                return Ok(Some(carve.clone()));
            }
        }

        let path = match &existing {
            Some(carve) => carve.path.clone(),
            None => match self.authorizing_query_path(node, &init.request_id).await? {
                Some(path) => path,
                None => {
                    warn!(uuid = %node.uuid, request_id = %init.request_id, "Carve init without a matching carve query");
                    return Ok(None);
                }
            },
        };

        let now = Utc::now();
        let carve = CarveSession {
            session_id: generate_session_id(),
            carve_id: init.carve_id.clone(),
            request_id: init.request_id.clone(),
            environment: node.environment.clone(),
            node_uuid: node.uuid.clone(),
            path,
            block_count: init.block_count,
            block_size: init.block_size,
            carve_size: init.carve_size,
            completed_blocks: 0,
            status: CarveStatus::InProgress,
            archive: None,
            created_at: existing.as_ref().map(|c| c.created_at).unwrap_or(now),
            updated_at: now,
        };
        if existing.is_some() {
            self.store.update_carve(&carve).await?;
        } else {
            self.store.create_carve(&carve).await?;
        }
        info!(
            session_id = %carve.session_id,
            uuid = %node.uuid,
            block_count = carve.block_count,
            carve_size = carve.carve_size,
            "Carve session started"
        );
        Ok(Some(carve))
    }

    async fn authorizing_query_path(&self, node: &Node, request_id: &str) -> DbResult<Option<String>> {
        let Some(query) = self.store.get_query(request_id).await? else {
            return Ok(None);
        };
        if query.query_type != QueryType::Carve || query.deleted || query.environment != node.environment {
            return Ok(None);
        }
        let targeted = query.active && targets_match(&self.store.get_targets(&query.name).await?, node);
        if targeted || self.store.has_execution(&query.name, &node.uuid).await? {
            Ok(Some(query.path.unwrap_or_default()))
        } else {
            Ok(None)
        }
    }

    /// Store one block. Retries of the same block id overwrite the slot.
    /// Returns false for unknown sessions and out-of-range blocks.
    pub async fn block(&self, upload: BlockUpload) -> DbResult<bool> {
        let Some(carve) = self.store.get_carve(&upload.session_id).await? else {
            debug!(session_id = %upload.session_id, "Block for unknown carve session");
            return Ok(false);
        };
        if !upload.request_id.is_empty() && upload.request_id != carve.request_id {
            return Ok(false);
        }
        if !matches!(carve.status, CarveStatus::InProgress | CarveStatus::Completed) {
            return Ok(false);
        }
        if upload.block_id >= carve.block_count {
            warn!(session_id = %carve.session_id, block_id = upload.block_id, "Block id out of range");
            return Ok(false);
        }
        let data = match BASE64.decode(upload.data.trim()) {
            Ok(data) => data,
            Err(e) => {
                warn!(session_id = %carve.session_id, block_id = upload.block_id, error = %e, "Undecodable block");
                return Ok(false);
            }
        };

        let key = BlockKey {
            environment: carve.environment.clone(),
            uuid: carve.node_uuid.clone(),
            session_id: carve.session_id.clone(),
            block_id: upload.block_id,
        };
        let reference = self.blocks.put_block(&key, &data).await?;
        self.store
            .upsert_block(&CarveBlock {
                session_id: carve.session_id.clone(),
                block_id: upload.block_id,
                size: data.len() as u64,
                data: reference,
                created_at: Utc::now(),
            })
            .await?;

        let received = self.store.count_blocks(&carve.session_id).await?;
        if let Some(updated) = self.store.record_carve_progress(&carve.session_id, received).await? {
            if updated.status == CarveStatus::Completed && carve.status == CarveStatus::InProgress {
                info!(session_id = %carve.session_id, blocks = received, "Carve completed");
            }
        }
        Ok(true)
    }

    pub async fn get(&self, environment: &str, session_id: &str) -> DbResult<CarveSession> {
        match self.store.get_carve(session_id).await? {
            Some(carve) if carve.environment == environment => Ok(carve),
            _ => Err(DbError::NotFound(format!("carve session {session_id}"))),
        }
    }

    pub async fn list(&self, environment: &str) -> DbResult<Vec<CarveSession>> {
        self.store.list_carves(environment).await
    }

    /// Session details; archives on first request once all blocks arrived
    pub async fn details(&self, environment: &str, session_id: &str) -> DbResult<CarveSession> {
        let carve = self.get(environment, session_id).await?;
        match carve.status {
            CarveStatus::Completed | CarveStatus::Archiving => self.archive(environment, session_id).await,
            _ => Ok(carve),
        }
    }

    /// Archive if needed, then resolve the artifact
    pub async fn download(&self, environment: &str, session_id: &str) -> DbResult<(CarveSession, Artifact)> {
        let carve = self.archive(environment, session_id).await?;
        let location = carve
            .archive
            .clone()
            .ok_or_else(|| DbError::InvalidState(format!("carve {session_id} has no archive")))?;
        let artifact = self.blocks.download(&location).await?;
        Ok((carve, artifact))
    }

    /// Reassemble the session's blocks in block-id order.
    ///
    /// Idempotent: an archived session is returned as is, a concurrent
    /// archival is awaited rather than duplicated.
    pub async fn archive(&self, environment: &str, session_id: &str) -> DbResult<CarveSession> {
        for _ in 0..ARCHIVE_POLL_ATTEMPTS {
            let carve = self.get(environment, session_id).await?;
            match carve.status {
                CarveStatus::Archived => return Ok(carve),
                CarveStatus::Scheduled | CarveStatus::InProgress => {
                    return Err(DbError::Storage(StorageError::IntegrityFailed(format!(
                        "carve {} incomplete: {}/{} blocks",
                        session_id, carve.completed_blocks, carve.block_count
                    ))));
                }
                CarveStatus::Archiving if archival_abandoned(&carve) => {
                    warn!(session_id = %session_id, since = %carve.updated_at, "Reclaiming abandoned carve archival");
                    self.store
                        .transition_carve(session_id, CarveStatus::Archiving, CarveStatus::Completed)
                        .await?;
                    continue;
                }
                CarveStatus::Archiving => {
                    tokio::time::sleep(ARCHIVE_POLL_INTERVAL).await;
                    continue;
                }
                CarveStatus::Completed => {}
            }

            if !self
                .store
                .transition_carve(session_id, CarveStatus::Completed, CarveStatus::Archiving)
                .await?
            {
                // Another caller won the swap
                continue;
            }

            return match self.build_archive(&carve).await {
                Ok(location) => {
                    self.store.set_carve_archive(session_id, &location).await?;
                    info!(session_id = %session_id, archive = %location.file_name(), "Carve archived");
                    self.get(environment, session_id).await
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Carve archival failed");
                    self.store
                        .transition_carve(session_id, CarveStatus::Archiving, CarveStatus::Completed)
                        .await?;
                    Err(e)
                }
            };
        }
        Err(DbError::InvalidState(format!("carve {session_id} archival did not finish")))
    }

    async fn build_archive(&self, carve: &CarveSession) -> DbResult<ArchiveLocation> {
        let blocks = self.store.list_blocks(&carve.session_id).await?;
        verify_blocks(&blocks, carve.block_count, carve.carve_size)?;
        let target = ArchiveTarget {
            environment: carve.environment.clone(),
            uuid: carve.node_uuid.clone(),
            session_id: carve.session_id.clone(),
            path: carve.path.clone(),
        };
        if let Some(location) = self.blocks.find_archive(&target).await? {
            return Ok(location);
        }
        Ok(self.blocks.archive(&target, &blocks).await?)
    }
}

fn archival_abandoned(carve: &CarveSession) -> bool {
    (Utc::now() - carve.updated_at)
        .to_std()
        .is_ok_and(|age| age >= ARCHIVE_STALE_AFTER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use fleet_core::{Environment, QueryTarget, TargetType};
    use fleet_storage::{InlineBlockStore, LocalBlockStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        service: CarveService,
        env: Environment,
        node: Node,
        _dir: tempfile::TempDir,
    }

    async fn fixture(local: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let blocks: Arc<dyn BlockStore> = if local {
            Arc::new(LocalBlockStore::new(dir.path()).await.unwrap())
        } else {
            Arc::new(InlineBlockStore::new(dir.path()).await.unwrap())
        };
        let env = Environment::new("acme", "fleet.test");
        store.create_environment(&env).await.unwrap();
        let node = Node::new("k1", "N1", env.uuid.clone());
        store.create_node(&node).await.unwrap();
        Fixture {
            service: CarveService::new(store.clone(), blocks),
            store,
            env,
            node,
            _dir: dir,
        }
    }

    async fn carve_query(f: &Fixture, name: &str) {
        let now = Utc::now();
        let query = fleet_core::DistributedQuery {
            name: name.into(),
            environment: f.env.uuid.clone(),
            query: fleet_core::carve_query_text("/etc/hosts"),
            creator: "admin".into(),
            query_type: QueryType::Carve,
            path: Some("/etc/hosts".into()),
            expected: 1,
            executions: 0,
            errors: 0,
            active: true,
            completed: false,
            deleted: false,
            hidden: false,
            protected: false,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        f.store
            .create_query(&query, &[QueryTarget::new(TargetType::Uuid, "N1")])
            .await
            .unwrap();
    }

    fn init(carve_id: &str, request_id: &str, block_count: u64, block_size: u64, carve_size: u64) -> CarveInit {
        CarveInit {
            block_count,
            block_size,
            carve_size,
            carve_id: carve_id.into(),
            request_id: request_id.into(),
        }
    }

    fn upload(session: &str, request_id: &str, block_id: u64, data: &[u8]) -> BlockUpload {
        BlockUpload {
            session_id: session.into(),
            request_id: request_id.into(),
            block_id,
            data: BASE64.encode(data),
        }
    }

    async fn artifact_bytes(artifact: Artifact) -> Vec<u8> {
        match artifact {
            Artifact::File { path, .. } => tokio::fs::read(path).await.unwrap(),
            other => panic!("unexpected artifact {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_blocks_reassemble_in_order() {
        for local in [false, true] {
            let f = fixture(local).await;
            carve_query(&f, "carve_q").await;
            let session = f
                .service
                .init(&f.node, init("guid-1", "carve_q", 3, 4096, 3 * 4096))
                .await
                .unwrap()
                .unwrap();
            let sid = session.session_id.clone();

            let payloads: Vec<Vec<u8>> = (0u8..3).map(|i| vec![b'a' + i; 4096]).collect();
            for id in [1usize, 0, 2] {
                assert!(f.service.block(upload(&sid, "carve_q", id as u64, &payloads[id])).await.unwrap());
            }
            // Identical retry of block 0
            assert!(f.service.block(upload(&sid, "carve_q", 0, &payloads[0])).await.unwrap());

            let (carve, artifact) = f.service.download(&f.env.uuid, &sid).await.unwrap();
            assert_eq!(carve.status, CarveStatus::Archived);
            assert_eq!(artifact_bytes(artifact).await, payloads.concat());

            // A second download reuses the archive
            let (again, _) = f.service.download(&f.env.uuid, &sid).await.unwrap();
            assert_eq!(again.archive, carve.archive);
        }
    }

    #[tokio::test]
    async fn test_archive_of_incomplete_carve_fails() {
        let f = fixture(false).await;
        carve_query(&f, "carve_q").await;
        let session = f
            .service
            .init(&f.node, init("guid-1", "carve_q", 2, 4, 8))
            .await
            .unwrap()
            .unwrap();
        f.service
            .block(upload(&session.session_id, "carve_q", 1, b"bbbb"))
            .await
            .unwrap();

        let err = f.service.archive(&f.env.uuid, &session.session_id).await.unwrap_err();
        assert!(matches!(err, DbError::Storage(StorageError::IntegrityFailed(_))));
        // Details of an incomplete carve do not attempt archival
        let details = f.service.details(&f.env.uuid, &session.session_id).await.unwrap();
        assert_eq!(details.status, CarveStatus::InProgress);
    }

    #[tokio::test]
    async fn test_size_mismatch_reverts_to_completed() {
        let f = fixture(false).await;
        carve_query(&f, "carve_q").await;
        let session = f
            .service
            .init(&f.node, init("guid-1", "carve_q", 1, 4, 100))
            .await
            .unwrap()
            .unwrap();
        f.service
            .block(upload(&session.session_id, "carve_q", 0, b"aaaa"))
            .await
            .unwrap();

        assert!(f.service.archive(&f.env.uuid, &session.session_id).await.is_err());
        let carve = f.service.get(&f.env.uuid, &session.session_id).await.unwrap();
        assert_eq!(carve.status, CarveStatus::Completed);
    }

    #[tokio::test]
    async fn test_abandoned_archival_is_retried() {
        let f = fixture(true).await;
        carve_query(&f, "carve_q").await;
        let session = f
            .service
            .init(&f.node, init("guid-1", "carve_q", 1, 4, 4))
            .await
            .unwrap()
            .unwrap();
        f.service
            .block(upload(&session.session_id, "carve_q", 0, b"aaaa"))
            .await
            .unwrap();

        // An archiver that died mid-way leaves the session in `archiving`
        let mut stuck = f.service.get(&f.env.uuid, &session.session_id).await.unwrap();
        stuck.status = CarveStatus::Archiving;
        stuck.updated_at = Utc::now() - chrono::Duration::hours(1);
        f.store.update_carve(&stuck).await.unwrap();

        let carve = tokio::time::timeout(
            Duration::from_secs(5),
            f.service.archive(&f.env.uuid, &session.session_id),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(carve.status, CarveStatus::Archived);
        assert!(carve.archive.is_some());
    }

    #[tokio::test]
    async fn test_init_requires_matching_carve_query() {
        let f = fixture(false).await;
        assert!(f.service.init(&f.node, init("g", "missing", 1, 4, 4)).await.unwrap().is_none());

        carve_query(&f, "carve_q").await;
        let other = Node::new("k2", "N2", f.env.uuid.clone());
        f.store.create_node(&other).await.unwrap();
        assert!(f.service.init(&other, init("g", "carve_q", 1, 4, 4)).await.unwrap().is_none());
        assert!(f.service.init(&f.node, init("g", "carve_q", 0, 4, 4)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scheduled_carve_authorizes_init() {
        let f = fixture(false).await;
        let scheduled = ScheduledCarve {
            carve_id: "guid-9".into(),
            request_id: "carve_gone".into(),
            path: "/var/log/syslog".into(),
        };
        f.service.schedule(&f.node, &scheduled).await.unwrap();

        let session = f
            .service
            .init(&f.node, init("guid-9", "carve_gone", 1, 4, 4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, CarveStatus::InProgress);
        assert_eq!(session.path, "/var/log/syslog");

        // Retried init returns the same session
        let again = f
            .service
            .init(&f.node, init("guid-9", "carve_gone", 1, 4, 4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.session_id, session.session_id);
    }

    #[tokio::test]
    async fn test_block_rejections() {
        let f = fixture(false).await;
        carve_query(&f, "carve_q").await;
        let session = f
            .service
            .init(&f.node, init("guid-1", "carve_q", 1, 4, 4))
            .await
            .unwrap()
            .unwrap();
        let sid = session.session_id;

        assert!(!f.service.block(upload("nope", "carve_q", 0, b"aaaa")).await.unwrap());
        assert!(!f.service.block(upload(&sid, "other", 0, b"aaaa")).await.unwrap());
        assert!(!f.service.block(upload(&sid, "carve_q", 5, b"aaaa")).await.unwrap());
        let mut bad = upload(&sid, "carve_q", 0, b"");
        bad.data = "!!not base64!!".into();
        assert!(!f.service.block(bad).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_archival_builds_once() {
        let f = fixture(true).await;
        carve_query(&f, "carve_q").await;
        let session = f
            .service
            .init(&f.node, init("guid-1", "carve_q", 2, 4, 8))
            .await
            .unwrap()
            .unwrap();
        let sid = session.session_id;
        f.service.block(upload(&sid, "carve_q", 0, b"aaaa")).await.unwrap();
        f.service.block(upload(&sid, "carve_q", 1, b"bbbb")).await.unwrap();

        let (a, b) = tokio::join!(
            f.service.archive(&f.env.uuid, &sid),
            f.service.archive(&f.env.uuid, &sid)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.archive, b.archive);
        assert_eq!(a.status, CarveStatus::Archived);
    }
}
