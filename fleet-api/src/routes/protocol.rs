//! Node protocol handlers
//!
//! Every agent call lands on `POST /{environment}/{path}`; the path segment
//! is resolved against the environment's configured endpoint paths. Identity
//! failures are answered at 200 with `node_invalid: true` so agents keep
//! their normal polling schedule.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::CONTENT_ENCODING, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use fleet_core::{CarveInit, EnrollRequest, Endpoint, Environment, LivenessKind, LogType, Node, ScheduledCarve};
use fleet_db::{BlockUpload, EnrollOutcome};
use fleet_ingest::{decode_body, QueryResult};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::dto::*;
use crate::error::{ProtocolError, ProtocolResult};
use crate::state::AppState;
use crate::telemetry::record_protocol;

/// How a protocol call ended, for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ok,
    Invalid,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Invalid => "invalid",
        }
    }
}

type Reply = (Outcome, Response);

/// Per-request context shared by the endpoint handlers
struct Call<'a> {
    state: &'a AppState,
    env: &'a Environment,
    ip: Option<String>,
    /// Bytes received on the wire
    bytes: u64,
}

/// `POST /{environment}/{path}`
pub async fn handle(
    State(state): State<AppState>,
    Path((env_id, segment)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ProtocolResult<Response> {
    let env = state
        .environments
        .find(&env_id)
        .await?
        .ok_or(ProtocolError::UnknownEnvironment(env_id))?;
    let endpoint = env
        .paths
        .resolve(&segment)
        .ok_or(ProtocolError::UnknownEndpoint(segment))?;

    let encoding = headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok());
    let raw = decode_body(&body, encoding, state.server.max_body_size as u64)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if state.debug_http(&env) {
        debug!(
            environment = %env.name,
            endpoint = endpoint.as_str(),
            body = %String::from_utf8_lossy(&raw),
            "Protocol request"
        );
    }

    let call = Call {
        state: &state,
        env: &env,
        ip: client_ip(&headers),
        bytes: body.len() as u64,
    };
    let result = match endpoint {
        Endpoint::Enroll => enroll(&call, &raw).await,
        Endpoint::Config => config(&call, &raw).await,
        Endpoint::Log => log(&call, &raw).await,
        Endpoint::QueryRead => query_read(&call, &raw).await,
        Endpoint::QueryWrite => query_write(&call, &raw).await,
        Endpoint::CarverInit => carve_init(&call, &raw).await,
        Endpoint::CarverBlock => carve_block(&call, &raw).await,
    };

    match result {
        Ok((outcome, response)) => {
            record_protocol(endpoint.as_str(), outcome.as_str());
            Ok(response)
        }
        Err(e) => {
            record_protocol(endpoint.as_str(), "error");
            Err(e)
        }
    }
}

fn parse<T: DeserializeOwned>(raw: &[u8]) -> ProtocolResult<T> {
    serde_json::from_slice(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Client address as reported by the fronting proxy
fn client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    forwarded.or_else(real).map(str::to_string)
}

fn node_invalid() -> Reply {
    (Outcome::Invalid, Json(NodeReply { node_invalid: true }).into_response())
}

/// Resolve the node key of a request, scoped to the call's environment
async fn authenticate(call: &Call<'_>, node_key: &str) -> ProtocolResult<Option<Node>> {
    let node = call.state.nodes.authenticate(call.env, node_key).await?;
    if node.is_none() {
        debug!(environment = %call.env.name, "Unknown node key");
    }
    Ok(node)
}

// ==================== Enrollment ====================

async fn enroll(call: &Call<'_>, raw: &[u8]) -> ProtocolResult<Reply> {
    let mut document: Value = parse(raw)?;
    let body: EnrollBody =
        serde_json::from_value(document.clone()).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if let Some(map) = document.as_object_mut() {
        map.remove("enroll_secret");
    }

    let request = EnrollRequest {
        secret: body.enroll_secret,
        host_identifier: body.host_identifier,
        platform_type: body.platform_type,
        host_details: body.host_details,
        ip_address: call.ip.clone().unwrap_or_default(),
        raw: document,
    };
    let (outcome, reply) = match call.state.nodes.enroll(call.env, request).await? {
        EnrollOutcome::Enrolled { node, .. } => {
            let reply = EnrollReply {
                node_key: node.node_key,
                node_invalid: false,
            };
            (Outcome::Ok, reply)
        }
        EnrollOutcome::Rejected(reason) => {
            warn!(environment = %call.env.name, reason = reason.as_str(), "Enrollment rejected");
            let reply = EnrollReply {
                node_key: String::new(),
                node_invalid: true,
            };
            (Outcome::Invalid, reply)
        }
    };
    Ok((outcome, Json(reply).into_response()))
}

// ==================== Configuration ====================

async fn config(call: &Call<'_>, raw: &[u8]) -> ProtocolResult<Reply> {
    let body: NodeKeyBody = parse(raw)?;
    let Some(node) = authenticate(call, &body.node_key).await? else {
        return Ok(node_invalid());
    };
    call.state
        .nodes
        .touch(&node.node_key, LivenessKind::Config, call.ip.as_deref(), call.bytes)
        .await;
    Ok((Outcome::Ok, Json(call.env.serialized_config()).into_response()))
}

// ==================== Logs ====================

async fn log(call: &Call<'_>, raw: &[u8]) -> ProtocolResult<Reply> {
    let body: LogBody = parse(raw)?;
    let log_type = match LogType::parse(&body.log_type) {
        Some(t @ (LogType::Status | LogType::Result)) => t,
        _ => return Err(ProtocolError::Malformed(format!("unsupported log type '{}'", body.log_type))),
    };
    let Some(node) = authenticate(call, &body.node_key).await? else {
        return Ok(node_invalid());
    };
    call.state
        .logs
        .ingest(call.env, &node, log_type, body.data, call.bytes, call.ip.as_deref())
        .await;
    Ok((Outcome::Ok, Json(NodeReply { node_invalid: false }).into_response()))
}

// ==================== Distributed queries ====================

async fn query_read(call: &Call<'_>, raw: &[u8]) -> ProtocolResult<Reply> {
    let body: NodeKeyBody = parse(raw)?;
    let Some(node) = authenticate(call, &body.node_key).await? else {
        return Ok(node_invalid());
    };
    call.state
        .nodes
        .touch(&node.node_key, LivenessKind::QueryRead, call.ip.as_deref(), call.bytes)
        .await;
    let queries = call.state.queries.node_queries(&node).await?;
    if !queries.is_empty() {
        debug!(uuid = %node.uuid, count = queries.len(), "Delivering queries");
    }
    let reply = ReadReply {
        queries,
        node_invalid: false,
    };
    Ok((Outcome::Ok, Json(reply).into_response()))
}

async fn query_write(call: &Call<'_>, raw: &[u8]) -> ProtocolResult<Reply> {
    let body: WriteBody = parse(raw)?;
    let Some(node) = authenticate(call, &body.node_key).await? else {
        return Ok(node_invalid());
    };
    call.state
        .nodes
        .touch(&node.node_key, LivenessKind::QueryWrite, call.ip.as_deref(), call.bytes)
        .await;

    // Errored queries may come back with a status and no result rows
    let names: BTreeSet<&String> = body.queries.keys().chain(body.statuses.keys()).collect();
    for name in names {
        let status = body.statuses.get(name).copied().unwrap_or(0);
        let data = body.queries.get(name).cloned().unwrap_or(Value::Null);

        let accounting = call.state.queries.record_result(name, &node, status).await?;
        if !accounting.recorded {
            debug!(uuid = %node.uuid, query = %name, "Result for unknown query");
            continue;
        }
        if accounting.completed {
            info!(query = %name, "Query completed");
        }

        schedule_carves(call, &node, name, &data).await;

        let result = QueryResult {
            name: name.clone(),
            status,
            message: body.messages.get(name).cloned().unwrap_or_default(),
            data,
        };
        call.state.logs.dispatch_query_result(call.env, &node, result).await;
    }
    Ok((Outcome::Ok, Json(NodeReply { node_invalid: false }).into_response()))
}

/// Register placeholders for carves announced in a result set
async fn schedule_carves(call: &Call<'_>, node: &Node, name: &str, data: &Value) {
    let Some(rows) = data.as_array() else {
        return;
    };
    for row in rows {
        let Ok(row) = serde_json::from_value::<CarveRow>(row.clone()) else {
            continue;
        };
        if row.carve != "1" || row.carve_guid.is_empty() {
            continue;
        }
        let scheduled = ScheduledCarve {
            request_id: if row.request_id.is_empty() {
                name.to_string()
            } else {
                row.request_id
            },
            carve_id: row.carve_guid,
            path: row.path,
        };
        if let Err(e) = call.state.carves.schedule(node, &scheduled).await {
            warn!(error = %e, carve_id = %scheduled.carve_id, "Failed to schedule carve");
        }
    }
}

// ==================== Carves ====================

async fn carve_init(call: &Call<'_>, raw: &[u8]) -> ProtocolResult<Reply> {
    let body: CarveInitBody = parse(raw)?;
    let Some(node) = authenticate(call, &body.node_key).await? else {
        return Ok(node_invalid());
    };
    let init = CarveInit {
        block_count: body.block_count,
        block_size: body.block_size,
        carve_size: body.carve_size,
        carve_id: body.carve_id,
        request_id: body.request_id,
    };
    let (outcome, reply) = match call.state.carves.init(&node, init).await? {
        Some(session) => {
            info!(
                uuid = %node.uuid,
                session_id = %session.session_id,
                blocks = session.block_count,
                "Carve session started"
            );
            let reply = CarveInitReply {
                success: true,
                session_id: session.session_id,
            };
            (Outcome::Ok, reply)
        }
        None => {
            warn!(uuid = %node.uuid, "Carve init rejected");
            let reply = CarveInitReply {
                success: false,
                session_id: String::new(),
            };
            (Outcome::Invalid, reply)
        }
    };
    Ok((outcome, Json(reply).into_response()))
}

async fn carve_block(call: &Call<'_>, raw: &[u8]) -> ProtocolResult<Reply> {
    let body: CarveBlockBody = parse(raw)?;
    let upload = BlockUpload {
        session_id: body.session_id,
        request_id: body.request_id,
        block_id: body.block_id,
        data: body.data,
    };
    let success = call.state.carves.block(upload).await?;
    let outcome = if success { Outcome::Ok } else { Outcome::Invalid };
    Ok((outcome, Json(CarveBlockReply { success }).into_response()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_client_ip() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), None);

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.7"));
        assert_eq!(client_ip(&headers).as_deref(), Some("198.51.100.7"));

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        assert_eq!(client_ip(&headers).as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse::<NodeKeyBody>(b"not json"),
            Err(ProtocolError::Malformed(_))
        ));
        let body: NodeKeyBody = parse(br#"{"node_key":"abc","extra":1}"#).unwrap();
        assert_eq!(body.node_key, "abc");
    }
}
