//! Node endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use fleet_core::{AccessLevel, ArchivedNode, Node};
use serde::Serialize;

use crate::dto::NodeSummary;
use crate::error::ApiResult;
use crate::routes::auth::Operator;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct NodeDetails {
    pub node: Node,
    pub archived: Vec<ArchivedNode>,
}

/// Node keys are capabilities and never leave the service
fn redact(mut node: Node) -> Node {
    node.node_key.clear();
    node
}

pub async fn list_nodes(
    State(state): State<AppState>,
    operator: Operator,
    Path(env_id): Path<String>,
) -> ApiResult<Json<Vec<NodeSummary>>> {
    let env = state.environments.get(&env_id).await?;
    operator.require(&state, AccessLevel::User, &env)?;

    let nodes = state.nodes.list(&env.uuid).await?;
    Ok(Json(nodes.iter().map(NodeSummary::from).collect()))
}

pub async fn get_node(
    State(state): State<AppState>,
    operator: Operator,
    Path((env_id, uuid)): Path<(String, String)>,
) -> ApiResult<Json<NodeDetails>> {
    let env = state.environments.get(&env_id).await?;
    operator.require(&state, AccessLevel::User, &env)?;

    let node = state.nodes.get(&env.uuid, &uuid).await?;
    let archived = state
        .nodes
        .archived(&env.uuid, &uuid)
        .await?
        .into_iter()
        .map(|mut entry| {
            entry.node = redact(entry.node);
            entry
        })
        .collect();
    Ok(Json(NodeDetails {
        node: redact(node),
        archived,
    }))
}

/// Archive and delete a node; its key stops authenticating
pub async fn remove_node(
    State(state): State<AppState>,
    operator: Operator,
    Path((env_id, uuid)): Path<(String, String)>,
) -> ApiResult<Json<NodeSummary>> {
    let env = state.environments.get(&env_id).await?;
    operator.require(&state, AccessLevel::Admin, &env)?;

    let node = state.nodes.remove(&env.uuid, &uuid).await?;
    tracing::info!(user = %operator.user, environment = %env.name, uuid = %node.uuid, "Node removed");
    Ok(Json(NodeSummary::from(&node)))
}
