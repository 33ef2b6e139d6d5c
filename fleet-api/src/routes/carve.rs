//! Carve endpoints

use axum::{
    body::Body,
    extract::{Path, State},
    http::{
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
        StatusCode,
    },
    response::{IntoResponse, Redirect, Response},
    Json,
};
use fleet_core::{AccessLevel, CarveSession};
use fleet_storage::Artifact;
use tokio_util::io::ReaderStream;

use crate::dto::{CarveCreated, CarveListResponse, CreateCarveRequest};
use crate::error::{ApiError, ApiResult};
use crate::routes::auth::Operator;
use crate::state::AppState;

pub async fn list_carves(
    State(state): State<AppState>,
    operator: Operator,
    Path(env_id): Path<String>,
) -> ApiResult<Json<CarveListResponse>> {
    let env = state.environments.get(&env_id).await?;
    operator.require(&state, AccessLevel::Carve, &env)?;

    let carves = state.carves.list(&env.uuid).await?;
    Ok(Json(CarveListResponse {
        total: carves.len(),
        carves,
    }))
}

/// Create a carve query for `path`
pub async fn create_carve(
    State(state): State<AppState>,
    operator: Operator,
    Path(env_id): Path<String>,
    Json(req): Json<CreateCarveRequest>,
) -> ApiResult<(StatusCode, Json<CarveCreated>)> {
    let env = state.environments.get(&env_id).await?;
    operator.require(&state, AccessLevel::Carve, &env)?;

    let query = state
        .queries
        .create_carve(&env, &req.path, req.targets, &operator.user)
        .await?;
    tracing::info!(user = %operator.user, environment = %env.name, path = %req.path, "Carve requested");
    Ok((
        StatusCode::CREATED,
        Json(CarveCreated {
            name: query.name,
            query_type: query.query_type,
            expected: query.expected,
        }),
    ))
}

/// Session details; archives a complete carve on first access
pub async fn get_carve(
    State(state): State<AppState>,
    operator: Operator,
    Path((env_id, session_id)): Path<(String, String)>,
) -> ApiResult<Json<CarveSession>> {
    let env = state.environments.get(&env_id).await?;
    operator.require(&state, AccessLevel::Carve, &env)?;

    Ok(Json(state.carves.details(&env.uuid, &session_id).await?))
}

/// Stream a local archive or redirect to a pre-signed link
pub async fn download_carve(
    State(state): State<AppState>,
    operator: Operator,
    Path((env_id, session_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let env = state.environments.get(&env_id).await?;
    operator.require(&state, AccessLevel::Carve, &env)?;

    let (carve, artifact) = state.carves.download(&env.uuid, &session_id).await?;
    tracing::info!(user = %operator.user, session_id = %carve.session_id, "Carve download");

    match artifact {
        Artifact::File { path, size, file_name } => {
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| ApiError::InternalError(format!("cannot open {}: {}", path.display(), e)))?;
            let headers = [
                (CONTENT_TYPE, "application/octet-stream".to_string()),
                (CONTENT_LENGTH, size.to_string()),
                (CONTENT_DISPOSITION, format!("attachment; filename=\"{file_name}\"")),
            ];
            Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
        }
        Artifact::Presigned { url, .. } => Ok(Redirect::temporary(&url).into_response()),
    }
}
