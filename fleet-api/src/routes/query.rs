//! Distributed query endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use fleet_core::{AccessLevel, DistributedQuery, NewQuery, QueryFilter};

use crate::dto::{CreateQueryRequest, ListQueriesParams, QueryDetails};
use crate::error::{ApiError, ApiResult};
use crate::routes::auth::Operator;
use crate::state::AppState;

pub async fn list_queries(
    State(state): State<AppState>,
    operator: Operator,
    Path(env_id): Path<String>,
    Query(params): Query<ListQueriesParams>,
) -> ApiResult<Json<Vec<DistributedQuery>>> {
    let env = state.environments.get(&env_id).await?;
    operator.require(&state, AccessLevel::Query, &env)?;

    let filter = match params.status.as_deref() {
        None => QueryFilter::All,
        Some(s) => QueryFilter::parse(s).ok_or_else(|| ApiError::BadRequest(format!("unknown status filter '{s}'")))?,
    };
    let queries = state.queries.list(&env.uuid, filter, params.include_hidden).await?;
    Ok(Json(queries))
}

pub async fn create_query(
    State(state): State<AppState>,
    operator: Operator,
    Path(env_id): Path<String>,
    Json(req): Json<CreateQueryRequest>,
) -> ApiResult<(StatusCode, Json<DistributedQuery>)> {
    let env = state.environments.get(&env_id).await?;
    operator.require(&state, AccessLevel::Query, &env)?;

    let mut new = NewQuery::standard(req.query, req.targets).with_creator(&operator.user);
    new.name = req.name;
    new.hidden = req.hidden;
    new.protected = req.protected;
    new.expires_at = req.expires_at;

    let query = state.queries.create(&env, new).await?;
    tracing::info!(
        user = %operator.user,
        environment = %env.name,
        query = %query.name,
        expected = query.expected,
        "Query created"
    );
    Ok((StatusCode::CREATED, Json(query)))
}

pub async fn get_query(
    State(state): State<AppState>,
    operator: Operator,
    Path((env_id, name)): Path<(String, String)>,
) -> ApiResult<Json<QueryDetails>> {
    let env = state.environments.get(&env_id).await?;
    operator.require(&state, AccessLevel::Query, &env)?;

    let query = state.queries.get(&env.uuid, &name).await?;
    let targets = state.queries.targets(&env.uuid, &name).await?;
    let executions = state.queries.executions(&env.uuid, &name).await?;
    Ok(Json(QueryDetails {
        query,
        targets,
        executions,
    }))
}

/// `complete`, `activate` or `delete`
pub async fn query_action(
    State(state): State<AppState>,
    operator: Operator,
    Path((env_id, name, action)): Path<(String, String, String)>,
) -> ApiResult<Json<DistributedQuery>> {
    let env = state.environments.get(&env_id).await?;
    operator.require(&state, AccessLevel::Query, &env)?;

    let query = match action.as_str() {
        "complete" => state.queries.complete(&env.uuid, &name).await?,
        "activate" => state.queries.activate(&env.uuid, &name).await?,
        "delete" => state.queries.delete(&env.uuid, &name).await?,
        other => return Err(ApiError::BadRequest(format!("unknown query action '{other}'"))),
    };
    tracing::info!(user = %operator.user, query = %name, action = %action, "Query updated");
    Ok(Json(query))
}
