//! Environment endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use fleet_core::{AccessLevel, Environment, EnvironmentAction};
use serde_json::Value;

use crate::dto::{CreateEnvironmentRequest, EnvironmentSummary};
use crate::error::{ApiError, ApiResult};
use crate::routes::auth::Operator;
use crate::state::AppState;

/// Environments visible to the operator
pub async fn list_environments(
    State(state): State<AppState>,
    operator: Operator,
) -> ApiResult<Json<Vec<EnvironmentSummary>>> {
    let environments = state.environments.list().await?;
    Ok(Json(
        environments
            .iter()
            .filter(|env| operator.can(&state, AccessLevel::User, env))
            .map(EnvironmentSummary::from)
            .collect(),
    ))
}

/// Create an environment
pub async fn create_environment(
    State(state): State<AppState>,
    operator: Operator,
    Json(req): Json<CreateEnvironmentRequest>,
) -> ApiResult<(StatusCode, Json<Environment>)> {
    operator.require_global(&state, AccessLevel::Admin)?;

    let mut env = state.environments.create(&req.name, &req.hostname).await?;
    if let Some(configuration) = req.configuration {
        env = state.environments.update_configuration(&env.uuid, configuration).await?;
    }
    tracing::info!(user = %operator.user, environment = %env.name, "Environment created");
    Ok((StatusCode::CREATED, Json(env)))
}

/// Environment by name or UUID; secrets only for administrators
pub async fn get_environment(
    State(state): State<AppState>,
    operator: Operator,
    Path(env_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let env = state.environments.get(&env_id).await?;
    operator.require(&state, AccessLevel::User, &env)?;

    let body = if operator.can(&state, AccessLevel::Admin, &env) {
        serde_json::to_value(&env)
    } else {
        serde_json::to_value(EnvironmentSummary::from(&env))
    };
    Ok(Json(body.map_err(|e| ApiError::InternalError(e.to_string()))?))
}

/// Rotate or expire secrets, toggle enrollment
pub async fn apply_action(
    State(state): State<AppState>,
    operator: Operator,
    Path((env_id, action)): Path<(String, String)>,
) -> ApiResult<Json<Environment>> {
    let env = state.environments.get(&env_id).await?;
    operator.require(&state, AccessLevel::Admin, &env)?;

    let action = EnvironmentAction::parse(&action)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown environment action '{action}'")))?;
    let env = state.environments.apply_action(&env.uuid, action).await?;
    tracing::info!(user = %operator.user, environment = %env.name, ?action, "Environment action applied");
    Ok(Json(env))
}
