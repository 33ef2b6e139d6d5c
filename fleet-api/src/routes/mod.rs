//! API route handlers

pub mod auth;
pub mod carve;
pub mod environment;
pub mod health;
pub mod node;
pub mod protocol;
pub mod query;
pub mod scripts;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Operator API, mounted under `/api/v1`
fn operator_router() -> Router<AppState> {
    Router::new()
        .route(
            "/environments",
            get(environment::list_environments).post(environment::create_environment),
        )
        .route("/environments/:env", get(environment::get_environment))
        .route("/environments/:env/actions/:action", post(environment::apply_action))
        .route("/nodes/:env", get(node::list_nodes))
        .route("/nodes/:env/:uuid", get(node::get_node).delete(node::remove_node))
        .route("/queries/:env", get(query::list_queries).post(query::create_query))
        .route("/queries/:env/:name", get(query::get_query))
        .route("/queries/:env/:name/:action", post(query::query_action))
        .route("/carves/:env", get(carve::list_carves).post(carve::create_carve))
        .route("/carves/:env/:session", get(carve::get_carve))
        .route("/carves/:env/:session/download", get(carve::download_carve))
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::metrics))
        // Operator API
        .nest("/api/v1", operator_router())
        // Node protocol, paths resolved per environment
        .route("/:env/:endpoint", post(protocol::handle))
        .route("/:env/:secret_path/:script", get(scripts::quick_script))
        .with_state(state)
}
