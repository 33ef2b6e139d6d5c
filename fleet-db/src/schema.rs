//! SQLite schema
//!
//! Environments and nodes are stored as JSON documents keyed by their
//! lookup columns. Queries, carves and blocks use typed columns so that
//! counters and status transitions can be updated in place.

/// Current schema version recorded in `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 1;

pub const FLEET_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS environments (
    uuid TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nodes (
    environment TEXT NOT NULL,
    uuid TEXT NOT NULL,
    node_key TEXT NOT NULL UNIQUE,
    data TEXT NOT NULL,
    PRIMARY KEY (environment, uuid)
);

CREATE TABLE IF NOT EXISTS archived_nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    environment TEXT NOT NULL,
    uuid TEXT NOT NULL,
    trigger TEXT NOT NULL,
    archived_at TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_archived_nodes_uuid ON archived_nodes (environment, uuid);

CREATE TABLE IF NOT EXISTS distributed_queries (
    name TEXT PRIMARY KEY,
    environment TEXT NOT NULL,
    query TEXT NOT NULL,
    creator TEXT NOT NULL,
    query_type TEXT NOT NULL,
    path TEXT,
    expected INTEGER NOT NULL DEFAULT 0,
    executions INTEGER NOT NULL DEFAULT 0,
    errors INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL,
    completed INTEGER NOT NULL,
    deleted INTEGER NOT NULL,
    hidden INTEGER NOT NULL,
    protected INTEGER NOT NULL,
    expires_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queries_active ON distributed_queries (environment, active, deleted);

CREATE TABLE IF NOT EXISTS query_targets (
    query_name TEXT NOT NULL,
    target_type TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (query_name, target_type, value)
);

CREATE TABLE IF NOT EXISTS query_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    uuid TEXT NOT NULL,
    environment TEXT NOT NULL,
    result INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_executions_node ON query_executions (environment, uuid);
CREATE INDEX IF NOT EXISTS idx_executions_name ON query_executions (name, uuid);

CREATE TABLE IF NOT EXISTS carves (
    carve_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    request_id TEXT NOT NULL,
    environment TEXT NOT NULL,
    node_uuid TEXT NOT NULL,
    path TEXT NOT NULL,
    block_count INTEGER NOT NULL,
    block_size INTEGER NOT NULL,
    carve_size INTEGER NOT NULL,
    completed_blocks INTEGER NOT NULL,
    status TEXT NOT NULL,
    archive TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_carves_session ON carves (session_id) WHERE session_id != '';
CREATE INDEX IF NOT EXISTS idx_carves_env ON carves (environment);

CREATE TABLE IF NOT EXISTS carve_blocks (
    session_id TEXT NOT NULL,
    block_id INTEGER NOT NULL,
    size INTEGER NOT NULL,
    data_kind TEXT NOT NULL,
    data BLOB,
    data_ref TEXT,
    created_at TEXT NOT NULL,
    PRIMARY KEY (session_id, block_id)
);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    log_type TEXT NOT NULL,
    environment TEXT NOT NULL,
    uuid TEXT NOT NULL,
    query_name TEXT,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_logs_node ON logs (environment, uuid, log_type);
"#;
