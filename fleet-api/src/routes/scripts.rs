//! Quick scripts
//!
//! `GET /{environment}/{secret_path}/{script}` hands out enroll and removal
//! scripts, the agent flag file and the environment certificate. Access is
//! gated by the per-purpose secret path and its expiry.

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use fleet_core::{scripts::QuickScript, PathCheck};
use tracing::{info, warn};

use crate::dto::ScriptRejection;
use crate::error::{ProtocolError, ProtocolResult};
use crate::state::AppState;

pub async fn quick_script(
    State(state): State<AppState>,
    Path((env_id, secret_path, script)): Path<(String, String, String)>,
) -> ProtocolResult<Response> {
    let env = state
        .environments
        .find(&env_id)
        .await?
        .ok_or(ProtocolError::UnknownEnvironment(env_id))?;
    let script_kind = QuickScript::parse(&script).ok_or(ProtocolError::UnknownEndpoint(script))?;

    let rejection = match env.check_script_path(script_kind.purpose(), &secret_path, Utc::now()) {
        PathCheck::Valid => None,
        PathCheck::Invalid => Some("Invalid"),
        PathCheck::Expired => Some("Expired"),
    };
    if let Some(message) = rejection {
        warn!(environment = %env.name, ?script_kind, message, "Quick script refused");
        let body = ScriptRejection {
            message: message.to_string(),
        };
        return Ok((StatusCode::FORBIDDEN, Json(body)).into_response());
    }

    info!(environment = %env.name, ?script_kind, "Serving quick script");
    let body = script_kind.render(&env);
    Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}
