//! Operator authentication
//!
//! Operator endpoints take either header:
//!
//! ```text
//! Authorization: Bearer <token>
//! X-API-Key: <token>
//! ```
//!
//! The token resolves to a user; each handler then asks the permission
//! checker for the level it needs on the addressed environment.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use fleet_core::{AccessLevel, Environment};

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated operator
#[derive(Debug, Clone)]
pub struct Operator {
    pub user: String,
}

impl Operator {
    /// Require `level` on `env`; grants may name it by name or UUID
    pub fn require(&self, state: &AppState, level: AccessLevel, env: &Environment) -> Result<(), ApiError> {
        if self.can(state, level, env) {
            Ok(())
        } else {
            tracing::warn!(user = %self.user, environment = %env.name, ?level, "Operator access denied");
            Err(ApiError::Forbidden(format!("{:?} access to {} required", level, env.name)))
        }
    }

    /// Whether the operator holds `level` on `env`
    pub fn can(&self, state: &AppState, level: AccessLevel, env: &Environment) -> bool {
        state.permissions.check(&self.user, level, &env.name)
            || state.permissions.check(&self.user, level, &env.uuid)
    }

    /// Require `level` across every environment
    pub fn require_global(&self, state: &AppState, level: AccessLevel) -> Result<(), ApiError> {
        if state.permissions.check(&self.user, level, "*") {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!("global {:?} access required", level)))
        }
    }
}

fn presented_token(parts: &Parts) -> Option<&str> {
    if let Some(key) = parts.headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.trim());
    }
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

#[async_trait]
impl FromRequestParts<AppState> for Operator {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = presented_token(parts)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("Authorization: Bearer <token> required".to_string()))?;
        let user = state
            .operator(token)
            .ok_or_else(|| ApiError::Unauthorized("invalid token".to_string()))?;
        Ok(Operator { user: user.to_string() })
    }
}
