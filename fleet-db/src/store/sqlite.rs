//! SQLite-backed store

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use fleet_core::{
    ArchiveLocation, ArchiveTrigger, ArchivedNode, BlockData, CarveBlock, CarveSession, CarveStatus,
    DistributedQuery, Environment, LogRecord, LogType, Node, NodeMetadata, QueryExecution,
    QueryTarget, QueryType, TargetType,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use super::{FleetStore, QueryFlags, Touch};
use crate::error::{DbError, DbResult};
use crate::schema::{FLEET_SCHEMA, SCHEMA_VERSION};

/// SQLite store
///
/// A single connection guarded by a mutex. Every trait method runs one
/// closure against the connection on the blocking pool, so multi-statement
/// operations are serialized against each other and never stall the
/// async workers.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        info!(path = %path.display(), "Opened SQLite store");
        Ok(store)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> DbResult<()> {
        let conn = lock(&self.conn)?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            conn.execute_batch(FLEET_SCHEMA)?;
            conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
        }
        Ok(())
    }

    async fn with_conn<F, T>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Connection) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&*lock(&conn)?))
            .await
            .map_err(|e| DbError::Blocking(e.to_string()))?
    }
}

fn lock(conn: &Mutex<Connection>) -> DbResult<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| DbError::LockPoisoned(e.to_string()))
}

// ==================== Row helpers ====================

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> DbResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DbError::InvalidData(format!("timestamp {s}: {e}")))
}

fn parse_opt_ts(s: Option<String>) -> DbResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn load_node(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> DbResult<Option<Node>> {
    let data: Option<String> = conn.query_row(sql, args, |row| row.get(0)).optional()?;
    data.map(|d| serde_json::from_str(&d).map_err(DbError::from)).transpose()
}

fn save_node(conn: &Connection, node: &Node) -> DbResult<usize> {
    let data = serde_json::to_string(node)?;
    Ok(conn.execute(
        "UPDATE nodes SET node_key = ?1, data = ?2 WHERE environment = ?3 AND uuid = ?4",
        params![node.node_key, data, node.environment, node.uuid],
    )?)
}

const QUERY_COLUMNS: &str = "name, environment, query, creator, query_type, path, expected, executions, \
     errors, active, completed, deleted, hidden, protected, expires_at, created_at, updated_at";

struct QueryRow {
    name: String,
    environment: String,
    query: String,
    creator: String,
    query_type: String,
    path: Option<String>,
    expected: i64,
    executions: i64,
    errors: i64,
    active: bool,
    completed: bool,
    deleted: bool,
    hidden: bool,
    protected: bool,
    expires_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl QueryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            environment: row.get(1)?,
            query: row.get(2)?,
            creator: row.get(3)?,
            query_type: row.get(4)?,
            path: row.get(5)?,
            expected: row.get(6)?,
            executions: row.get(7)?,
            errors: row.get(8)?,
            active: row.get(9)?,
            completed: row.get(10)?,
            deleted: row.get(11)?,
            hidden: row.get(12)?,
            protected: row.get(13)?,
            expires_at: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }

    fn into_query(self) -> DbResult<DistributedQuery> {
        let query_type = QueryType::parse(&self.query_type)
            .ok_or_else(|| DbError::InvalidData(format!("query type {}", self.query_type)))?;
        Ok(DistributedQuery {
            name: self.name,
            environment: self.environment,
            query: self.query,
            creator: self.creator,
            query_type,
            path: self.path,
            expected: self.expected as u64,
            executions: self.executions as u64,
            errors: self.errors as u64,
            active: self.active,
            completed: self.completed,
            deleted: self.deleted,
            hidden: self.hidden,
            protected: self.protected,
            expires_at: parse_opt_ts(self.expires_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn load_queries(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> DbResult<Vec<DistributedQuery>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, QueryRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(QueryRow::into_query).collect()
}

fn load_targets(conn: &Connection, name: &str) -> DbResult<Vec<QueryTarget>> {
    let mut stmt =
        conn.prepare("SELECT target_type, value FROM query_targets WHERE query_name = ?1 ORDER BY rowid")?;
    let rows = stmt
        .query_map(params![name], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|(target_type, value)| {
            let target_type = TargetType::parse(&target_type)
                .ok_or_else(|| DbError::InvalidData(format!("target type {target_type}")))?;
            Ok(QueryTarget { target_type, value })
        })
        .collect()
}

const CARVE_COLUMNS: &str = "session_id, carve_id, request_id, environment, node_uuid, path, block_count, \
     block_size, carve_size, completed_blocks, status, archive, created_at, updated_at";

struct CarveRow {
    session_id: String,
    carve_id: String,
    request_id: String,
    environment: String,
    node_uuid: String,
    path: String,
    block_count: i64,
    block_size: i64,
    carve_size: i64,
    completed_blocks: i64,
    status: String,
    archive: Option<String>,
    created_at: String,
    updated_at: String,
}

impl CarveRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            carve_id: row.get(1)?,
            request_id: row.get(2)?,
            environment: row.get(3)?,
            node_uuid: row.get(4)?,
            path: row.get(5)?,
            block_count: row.get(6)?,
            block_size: row.get(7)?,
            carve_size: row.get(8)?,
            completed_blocks: row.get(9)?,
            status: row.get(10)?,
            archive: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_session(self) -> DbResult<CarveSession> {
        let status = CarveStatus::parse(&self.status)
            .ok_or_else(|| DbError::InvalidData(format!("carve status {}", self.status)))?;
        let archive = self
            .archive
            .map(|a| serde_json::from_str::<ArchiveLocation>(&a))
            .transpose()?;
        Ok(CarveSession {
            session_id: self.session_id,
            carve_id: self.carve_id,
            request_id: self.request_id,
            environment: self.environment,
            node_uuid: self.node_uuid,
            path: self.path,
            block_count: self.block_count as u64,
            block_size: self.block_size as u64,
            carve_size: self.carve_size as u64,
            completed_blocks: self.completed_blocks as u64,
            status,
            archive,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn load_carve(conn: &Connection, column: &str, value: &str) -> DbResult<Option<CarveSession>> {
    let sql = format!("SELECT {CARVE_COLUMNS} FROM carves WHERE {column} = ?1");
    conn.query_row(&sql, params![value], CarveRow::from_row)
        .optional()?
        .map(CarveRow::into_session)
        .transpose()
}

fn archive_json(archive: &Option<ArchiveLocation>) -> DbResult<Option<String>> {
    Ok(archive.as_ref().map(serde_json::to_string).transpose()?)
}

struct BlockRow {
    session_id: String,
    block_id: i64,
    size: i64,
    data_kind: String,
    data: Option<Vec<u8>>,
    data_ref: Option<String>,
    created_at: String,
}

impl BlockRow {
    fn into_block(self) -> DbResult<CarveBlock> {
        let data = match (self.data_kind.as_str(), self.data, self.data_ref) {
            ("inline", Some(bytes), _) => BlockData::Inline(bytes),
            ("local", _, Some(path)) => BlockData::Local(PathBuf::from(path)),
            ("remote", _, Some(url)) => BlockData::Remote(url),
            (kind, _, _) => return Err(DbError::InvalidData(format!("block data kind {kind}"))),
        };
        Ok(CarveBlock {
            session_id: self.session_id,
            block_id: self.block_id as u64,
            size: self.size as u64,
            data,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[async_trait]
impl FleetStore for SqliteStore {
    // ==================== Environments ====================

    async fn create_environment(&self, env: &Environment) -> DbResult<()> {
        let data = serde_json::to_string(env)?;
        let (uuid, name) = (env.uuid.clone(), env.name.clone());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO environments (uuid, name, data) VALUES (?1, ?2, ?3)",
                params![uuid, name, data],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DbError::AlreadyExists(format!("environment {}", name))
                } else {
                    e.into()
                }
            })?;
            Ok(())
        })
        .await
    }

    async fn get_environment(&self, identifier: &str) -> DbResult<Option<Environment>> {
        let identifier = identifier.to_string();
        self.with_conn(move |conn| {
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM environments WHERE name = ?1 OR uuid = ?1 LIMIT 1",
                    params![identifier],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(data.map(|d| serde_json::from_str(&d)).transpose()?)
        })
        .await
    }

    async fn list_environments(&self) -> DbResult<Vec<Environment>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT data FROM environments ORDER BY name")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.iter()
                .map(|d| serde_json::from_str(d).map_err(DbError::from))
                .collect()
        })
        .await
    }

    async fn update_environment(&self, env: &Environment) -> DbResult<()> {
        let data = serde_json::to_string(env)?;
        let (uuid, name) = (env.uuid.clone(), env.name.clone());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE environments SET name = ?2, data = ?3 WHERE uuid = ?1",
                params![uuid, name, data],
            )?;
            if changed == 0 {
                return Err(DbError::NotFound(format!("environment {}", uuid)));
            }
            Ok(())
        })
        .await
    }

    // ==================== Nodes ====================

    async fn get_node_by_key(&self, node_key: &str) -> DbResult<Option<Node>> {
        let node_key = node_key.to_string();
        self.with_conn(move |conn| load_node(conn, "SELECT data FROM nodes WHERE node_key = ?1", &[&node_key]))
            .await
    }

    async fn get_node_by_uuid(&self, environment: &str, uuid: &str) -> DbResult<Option<Node>> {
        let (environment, uuid) = (environment.to_string(), uuid.to_string());
        self.with_conn(move |conn| {
            load_node(
                conn,
                "SELECT data FROM nodes WHERE environment = ?1 AND uuid = ?2",
                &[&environment, &uuid],
            )
        })
        .await
    }

    async fn create_node(&self, node: &Node) -> DbResult<()> {
        let data = serde_json::to_string(node)?;
        let (environment, uuid, node_key) = (node.environment.clone(), node.uuid.clone(), node.node_key.clone());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO nodes (environment, uuid, node_key, data) VALUES (?1, ?2, ?3, ?4)",
                params![environment, uuid, node_key, data],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DbError::AlreadyExists(format!("node {}", uuid))
                } else {
                    e.into()
                }
            })?;
            Ok(())
        })
        .await
    }

    async fn update_node(&self, node: &Node) -> DbResult<()> {
        let node = node.clone();
        self.with_conn(move |conn| {
            let changed = save_node(conn, &node).map_err(|e| match e {
                DbError::Sqlite(ref inner) if is_unique_violation(inner) => {
                    DbError::AlreadyExists("node key".to_string())
                }
                other => other,
            })?;
            if changed == 0 {
                return Err(DbError::NotFound(format!("node {}", node.uuid)));
            }
            Ok(())
        })
        .await
    }

    async fn touch_node(&self, node_key: &str, touch: Touch<'_>) -> DbResult<bool> {
        let node_key = node_key.to_string();
        let Touch { kind, at, ip_address, bytes } = touch;
        let ip_address = ip_address.map(str::to_string);
        self.with_conn(move |conn| {
            let Some(mut node) = load_node(conn, "SELECT data FROM nodes WHERE node_key = ?1", &[&node_key])? else {
                return Ok(false);
            };
            kind.stamp(&mut node, at);
            if let Some(ip) = ip_address {
                node.ip_address = ip;
            }
            node.bytes_received += bytes;
            node.updated_at = at;
            Ok(save_node(conn, &node)? > 0)
        })
        .await
    }

    async fn update_node_metadata(&self, node_key: &str, metadata: &NodeMetadata) -> DbResult<bool> {
        let node_key = node_key.to_string();
        let metadata = metadata.clone();
        self.with_conn(move |conn| {
            let Some(mut node) = load_node(conn, "SELECT data FROM nodes WHERE node_key = ?1", &[&node_key])? else {
                return Ok(false);
            };
            metadata.apply(&mut node);
            node.updated_at = Utc::now();
            Ok(save_node(conn, &node)? > 0)
        })
        .await
    }

    async fn archive_node(&self, node: &Node, trigger: ArchiveTrigger) -> DbResult<()> {
        let data = serde_json::to_string(node)?;
        let (environment, uuid) = (node.environment.clone(), node.uuid.clone());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO archived_nodes (environment, uuid, trigger, archived_at, data) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![environment, uuid, trigger.as_str(), ts(&Utc::now()), data],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_node(&self, environment: &str, uuid: &str) -> DbResult<bool> {
        let (environment, uuid) = (environment.to_string(), uuid.to_string());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "DELETE FROM nodes WHERE environment = ?1 AND uuid = ?2",
                params![environment, uuid],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn list_nodes(&self, environment: &str) -> DbResult<Vec<Node>> {
        let environment = environment.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT data FROM nodes WHERE environment = ?1 ORDER BY uuid")?;
            let rows = stmt
                .query_map(params![environment], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.iter()
                .map(|d| serde_json::from_str(d).map_err(DbError::from))
                .collect()
        })
        .await
    }

    async fn list_archived_nodes(&self, environment: &str, uuid: &str) -> DbResult<Vec<ArchivedNode>> {
        let (environment, uuid) = (environment.to_string(), uuid.to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT trigger, archived_at, data FROM archived_nodes \
                 WHERE environment = ?1 AND uuid = ?2 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![environment, uuid], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(trigger, archived_at, data)| {
                    let trigger = ArchiveTrigger::parse(&trigger)
                        .ok_or_else(|| DbError::InvalidData(format!("archive trigger {trigger}")))?;
                    Ok(ArchivedNode {
                        node: serde_json::from_str(&data)?,
                        trigger,
                        archived_at: parse_ts(&archived_at)?,
                    })
                })
                .collect()
        })
        .await
    }

    // ==================== Queries ====================

    async fn create_query(&self, query: &DistributedQuery, targets: &[QueryTarget]) -> DbResult<()> {
        let query = query.clone();
        let targets = targets.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                &format!(
                    "INSERT INTO distributed_queries ({QUERY_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    query.name,
                    query.environment,
                    query.query,
                    query.creator,
                    query.query_type.as_str(),
                    query.path,
                    query.expected as i64,
                    query.executions as i64,
                    query.errors as i64,
                    query.active,
                    query.completed,
                    query.deleted,
                    query.hidden,
                    query.protected,
                    query.expires_at.as_ref().map(ts),
                    ts(&query.created_at),
                    ts(&query.updated_at),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DbError::AlreadyExists(format!("query {}", query.name))
                } else {
                    e.into()
                }
            })?;
            for target in &targets {
                tx.execute(
                    "INSERT OR IGNORE INTO query_targets (query_name, target_type, value) VALUES (?1, ?2, ?3)",
                    params![query.name, target.target_type.as_str(), target.value],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_query(&self, name: &str) -> DbResult<Option<DistributedQuery>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {QUERY_COLUMNS} FROM distributed_queries WHERE name = ?1");
            Ok(load_queries(conn, &sql, &[&name])?.into_iter().next())
        })
        .await
    }

    async fn get_targets(&self, name: &str) -> DbResult<Vec<QueryTarget>> {
        let name = name.to_string();
        self.with_conn(move |conn| load_targets(conn, &name)).await
    }

    async fn list_queries(&self, environment: &str) -> DbResult<Vec<DistributedQuery>> {
        let environment = environment.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {QUERY_COLUMNS} FROM distributed_queries WHERE environment = ?1 ORDER BY created_at DESC"
            );
            load_queries(conn, &sql, &[&environment])
        })
        .await
    }

    async fn active_queries(&self, environment: &str) -> DbResult<Vec<(DistributedQuery, Vec<QueryTarget>)>> {
        let environment = environment.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {QUERY_COLUMNS} FROM distributed_queries \
                 WHERE environment = ?1 AND active = 1 AND deleted = 0 ORDER BY created_at"
            );
            load_queries(conn, &sql, &[&environment])?
                .into_iter()
                .map(|q| {
                    let targets = load_targets(conn, &q.name)?;
                    Ok((q, targets))
                })
                .collect()
        })
        .await
    }

    async fn set_query_flags(&self, name: &str, flags: QueryFlags) -> DbResult<bool> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE distributed_queries SET active = ?2, completed = ?3, deleted = ?4, updated_at = ?5 \
                 WHERE name = ?1",
                params![name, flags.active, flags.completed, flags.deleted, ts(&Utc::now())],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn increment_query(&self, name: &str, success: bool) -> DbResult<bool> {
        let name = name.to_string();
        let sql = if success {
            "UPDATE distributed_queries SET executions = executions + 1, updated_at = ?2 WHERE name = ?1"
        } else {
            "UPDATE distributed_queries SET errors = errors + 1, updated_at = ?2 WHERE name = ?1"
        };
        self.with_conn(move |conn| Ok(conn.execute(sql, params![name, ts(&Utc::now())])? > 0))
            .await
    }

    async fn complete_if_accounted(&self, name: &str) -> DbResult<bool> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE distributed_queries SET completed = 1, active = 0, updated_at = ?2 \
                 WHERE name = ?1 AND completed = 0 AND deleted = 0 AND executions + errors >= expected",
                params![name, ts(&Utc::now())],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn record_execution(&self, execution: &QueryExecution) -> DbResult<()> {
        let execution = execution.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO query_executions (name, uuid, environment, result, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    execution.name,
                    execution.uuid,
                    execution.environment,
                    execution.result,
                    ts(&execution.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn has_execution(&self, name: &str, uuid: &str) -> DbResult<bool> {
        let (name, uuid) = (name.to_string(), uuid.to_string());
        self.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM query_executions WHERE name = ?1 AND uuid = ?2 LIMIT 1",
                    params![name, uuid],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn executed_queries(&self, environment: &str, uuid: &str) -> DbResult<HashSet<String>> {
        let (environment, uuid) = (environment.to_string(), uuid.to_string());
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT name FROM query_executions WHERE environment = ?1 AND uuid = ?2")?;
            let names = stmt
                .query_map(params![environment, uuid], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>()?;
            Ok(names)
        })
        .await
    }

    async fn list_executions(&self, name: &str) -> DbResult<Vec<QueryExecution>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT name, uuid, environment, result, created_at FROM query_executions \
                 WHERE name = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![name], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(name, uuid, environment, result, created_at)| {
                    Ok(QueryExecution {
                        name,
                        uuid,
                        environment,
                        result,
                        created_at: parse_ts(&created_at)?,
                    })
                })
                .collect()
        })
        .await
    }

    // ==================== Carves ====================

    async fn create_carve(&self, carve: &CarveSession) -> DbResult<()> {
        let archive = archive_json(&carve.archive)?;
        let carve = carve.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO carves ({CARVE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    carve.session_id,
                    carve.carve_id,
                    carve.request_id,
                    carve.environment,
                    carve.node_uuid,
                    carve.path,
                    carve.block_count as i64,
                    carve.block_size as i64,
                    carve.carve_size as i64,
                    carve.completed_blocks as i64,
                    carve.status.as_str(),
                    archive,
                    ts(&carve.created_at),
                    ts(&carve.updated_at),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DbError::AlreadyExists(format!("carve {}", carve.carve_id))
                } else {
                    e.into()
                }
            })?;
            Ok(())
        })
        .await
    }

    async fn get_carve(&self, session_id: &str) -> DbResult<Option<CarveSession>> {
        if session_id.is_empty() {
            return Ok(None);
        }
        let session_id = session_id.to_string();
        self.with_conn(move |conn| load_carve(conn, "session_id", &session_id)).await
    }

    async fn get_carve_by_carve_id(&self, carve_id: &str) -> DbResult<Option<CarveSession>> {
        let carve_id = carve_id.to_string();
        self.with_conn(move |conn| load_carve(conn, "carve_id", &carve_id)).await
    }

    async fn update_carve(&self, carve: &CarveSession) -> DbResult<()> {
        let archive = archive_json(&carve.archive)?;
        let carve = carve.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE carves SET session_id = ?2, request_id = ?3, environment = ?4, node_uuid = ?5, \
                 path = ?6, block_count = ?7, block_size = ?8, carve_size = ?9, completed_blocks = ?10, \
                 status = ?11, archive = ?12, updated_at = ?13 WHERE carve_id = ?1",
                params![
                    carve.carve_id,
                    carve.session_id,
                    carve.request_id,
                    carve.environment,
                    carve.node_uuid,
                    carve.path,
                    carve.block_count as i64,
                    carve.block_size as i64,
                    carve.carve_size as i64,
                    carve.completed_blocks as i64,
                    carve.status.as_str(),
                    archive,
                    ts(&carve.updated_at),
                ],
            )?;
            if changed == 0 {
                return Err(DbError::NotFound(format!("carve {}", carve.carve_id)));
            }
            Ok(())
        })
        .await
    }

    async fn list_carves(&self, environment: &str) -> DbResult<Vec<CarveSession>> {
        let environment = environment.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {CARVE_COLUMNS} FROM carves WHERE environment = ?1 ORDER BY created_at DESC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![environment], CarveRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(CarveRow::into_session).collect()
        })
        .await
    }

    async fn transition_carve(&self, session_id: &str, from: CarveStatus, to: CarveStatus) -> DbResult<bool> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE carves SET status = ?3, updated_at = ?4 WHERE session_id = ?1 AND status = ?2",
                params![session_id, from.as_str(), to.as_str(), ts(&Utc::now())],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn set_carve_archive(&self, session_id: &str, location: &ArchiveLocation) -> DbResult<bool> {
        let archive = serde_json::to_string(location)?;
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE carves SET status = ?2, archive = ?3, updated_at = ?4 \
                 WHERE session_id = ?1 AND status = ?5",
                params![
                    session_id,
                    CarveStatus::Archived.as_str(),
                    archive,
                    ts(&Utc::now()),
                    CarveStatus::Archiving.as_str(),
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn upsert_block(&self, block: &CarveBlock) -> DbResult<()> {
        let kind = block.data.kind();
        let (data, data_ref): (Option<Vec<u8>>, Option<String>) = match &block.data {
            BlockData::Inline(bytes) => (Some(bytes.clone()), None),
            BlockData::Local(path) => (None, Some(path.to_string_lossy().into_owned())),
            BlockData::Remote(url) => (None, Some(url.clone())),
        };
        let session_id = block.session_id.clone();
        let (block_id, size, created_at) = (block.block_id as i64, block.size as i64, ts(&block.created_at));
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO carve_blocks (session_id, block_id, size, data_kind, data, data_ref, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![session_id, block_id, size, kind, data, data_ref, created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn count_blocks(&self, session_id: &str) -> DbResult<u64> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM carve_blocks WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn list_blocks(&self, session_id: &str) -> DbResult<Vec<CarveBlock>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, block_id, size, data_kind, data, data_ref, created_at FROM carve_blocks \
                 WHERE session_id = ?1 ORDER BY block_id",
            )?;
            let rows = stmt
                .query_map(params![session_id], |row| {
                    Ok(BlockRow {
                        session_id: row.get(0)?,
                        block_id: row.get(1)?,
                        size: row.get(2)?,
                        data_kind: row.get(3)?,
                        data: row.get(4)?,
                        data_ref: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(BlockRow::into_block).collect()
        })
        .await
    }

    async fn record_carve_progress(&self, session_id: &str, completed: u64) -> DbResult<Option<CarveSession>> {
        if session_id.is_empty() {
            return Ok(None);
        }
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let now = ts(&Utc::now());
            conn.execute(
                "UPDATE carves SET completed_blocks = MAX(completed_blocks, ?2), updated_at = ?3 \
                 WHERE session_id = ?1",
                params![session_id, completed as i64, now],
            )?;
            conn.execute(
                "UPDATE carves SET status = ?2 \
                 WHERE session_id = ?1 AND status = ?3 AND block_count > 0 AND completed_blocks >= block_count",
                params![
                    session_id,
                    CarveStatus::Completed.as_str(),
                    CarveStatus::InProgress.as_str()
                ],
            )?;
            load_carve(conn, "session_id", &session_id)
        })
        .await
    }

    // ==================== Logs ====================

    async fn append_logs(&self, records: &[LogRecord]) -> DbResult<()> {
        let records = records.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO logs (log_type, environment, uuid, query_name, data, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for record in &records {
                    stmt.execute(params![
                        record.log_type.as_str(),
                        record.environment,
                        record.uuid,
                        record.query_name,
                        serde_json::to_string(&record.data)?,
                        ts(&record.created_at),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_logs(
        &self,
        environment: &str,
        uuid: &str,
        log_type: LogType,
        limit: usize,
    ) -> DbResult<Vec<LogRecord>> {
        let (environment, uuid) = (environment.to_string(), uuid.to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT query_name, data, created_at FROM logs \
                 WHERE environment = ?1 AND uuid = ?2 AND log_type = ?3 ORDER BY id DESC LIMIT ?4",
            )?;
            let rows = stmt
                .query_map(params![environment, uuid, log_type.as_str(), limit as i64], |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(query_name, data, created_at)| {
                    Ok(LogRecord {
                        log_type,
                        environment: environment.clone(),
                        uuid: uuid.clone(),
                        query_name,
                        data: serde_json::from_str(&data)?,
                        created_at: parse_ts(&created_at)?,
                    })
                })
                .collect()
        })
        .await
    }

    // ==================== Health ====================

    async fn ping(&self) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::LivenessKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn carve(carve_id: &str, session_id: &str, status: CarveStatus) -> CarveSession {
        let now = Utc::now();
        CarveSession {
            session_id: session_id.into(),
            carve_id: carve_id.into(),
            request_id: "carve_q".into(),
            environment: "env".into(),
            node_uuid: "N1".into(),
            path: "/etc/hosts".into(),
            block_count: 2,
            block_size: 4,
            carve_size: 8,
            completed_blocks: 0,
            status,
            archive: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_environment_lookup_by_name_or_uuid() {
        let store = SqliteStore::open_in_memory().unwrap();
        let env = Environment::new("acme", "fleet.example.com");
        store.create_environment(&env).await.unwrap();

        assert_eq!(store.get_environment("acme").await.unwrap().unwrap().uuid, env.uuid);
        assert_eq!(store.get_environment(&env.uuid).await.unwrap().unwrap().name, "acme");
        assert!(store.get_environment("nope").await.unwrap().is_none());
        assert!(matches!(
            store.create_environment(&env).await,
            Err(DbError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_node_persisted_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.db");
        let at = Utc::now();
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_node(&Node::new("k1", "N1", "env")).await.unwrap();
            let touch = Touch {
                kind: LivenessKind::Status,
                at,
                ip_address: Some("10.1.1.1"),
                bytes: 42,
            };
            assert!(store.touch_node("k1", touch).await.unwrap());
        }
        let store = SqliteStore::open(&path).unwrap();
        let node = store.get_node_by_uuid("env", "N1").await.unwrap().unwrap();
        assert_eq!(node.last_status, Some(at));
        assert_eq!(node.bytes_received, 42);
        assert_eq!(node.ip_address, "10.1.1.1");
    }

    #[tokio::test]
    async fn test_query_with_targets_and_completion() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let query = DistributedQuery {
            name: "q1".into(),
            environment: "env".into(),
            query: "SELECT 1".into(),
            creator: "admin".into(),
            query_type: QueryType::Standard,
            path: None,
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
        let targets = vec![QueryTarget::new(TargetType::Uuid, "n1")];
        store.create_query(&query, &targets).await.unwrap();

        let active = store.active_queries("env").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].1[0].value, "N1");

        assert!(!store.complete_if_accounted("q1").await.unwrap());
        store.increment_query("q1", true).await.unwrap();
        assert!(store.complete_if_accounted("q1").await.unwrap());
        assert!(store.active_queries("env").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_carve_blocks_and_cas() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_carve(&carve("c1", "s1", CarveStatus::InProgress)).await.unwrap();
        // Scheduled placeholders share the empty session id
        store.create_carve(&carve("c2", "", CarveStatus::Scheduled)).await.unwrap();
        store.create_carve(&carve("c3", "", CarveStatus::Scheduled)).await.unwrap();

        for (id, kind) in [(1u64, "b"), (0, "a"), (1, "b")] {
            store
                .upsert_block(&CarveBlock {
                    session_id: "s1".into(),
                    block_id: id,
                    size: 4,
                    data: BlockData::Inline(kind.repeat(4).into_bytes()),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let count = store.count_blocks("s1").await.unwrap();
        assert_eq!(count, 2);
        let session = store.record_carve_progress("s1", count).await.unwrap().unwrap();
        assert_eq!(session.status, CarveStatus::Completed);

        let blocks = store.list_blocks("s1").await.unwrap();
        assert_eq!(blocks[0].data, BlockData::Inline(b"aaaa".to_vec()));

        assert!(store
            .transition_carve("s1", CarveStatus::Completed, CarveStatus::Archiving)
            .await
            .unwrap());
        assert!(!store
            .transition_carve("s1", CarveStatus::Completed, CarveStatus::Archiving)
            .await
            .unwrap());
        let location = ArchiveLocation::Remote {
            bucket: "b".into(),
            key: "env/N1/s1.tar".into(),
        };
        assert!(store.set_carve_archive("s1", &location).await.unwrap());
        assert_eq!(store.get_carve("s1").await.unwrap().unwrap().archive, Some(location));
    }

    #[tokio::test]
    async fn test_statements_yield_to_other_tasks() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                }
            })
        };

        for i in 0..50 {
            store
                .create_node(&Node::new(format!("k{i}"), format!("N{i}"), "env"))
                .await
                .unwrap();
        }
        ticker.abort();

        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_share_connection() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("fleet.db")).unwrap());

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = store.clone();
                tokio::spawn(async move {
                    for i in 0..25 {
                        let node = Node::new(format!("k{w}-{i}"), format!("N{w}-{i}"), "env");
                        store.create_node(&node).await.unwrap();
                        store.get_node_by_key(&node.node_key).await.unwrap().unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        assert_eq!(store.list_nodes("env").await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_logs_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let records: Vec<LogRecord> = (0..3)
            .map(|i| LogRecord {
                log_type: LogType::Status,
                environment: "env".into(),
                uuid: "N1".into(),
                query_name: None,
                data: json!({ "seq": i }),
                created_at: Utc::now(),
            })
            .collect();
        store.append_logs(&records).await.unwrap();

        let logs = store.list_logs("env", "N1", LogType::Status, 2).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].data["seq"], 2);
        assert!(store.list_logs("env", "N1", LogType::Result, 10).await.unwrap().is_empty());
    }
}
