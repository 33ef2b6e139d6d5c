//! API Server setup

use axum::{extract::DefaultBodyLimit, middleware, Router};
use chrono::Utc;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::FleetConfig;
use crate::routes::create_router;
use crate::state::AppState;
use crate::telemetry::metrics_middleware;

/// Wrap the router in the HTTP middleware stack
pub fn build_app(state: AppState) -> Router {
    let server = state.server.clone();
    let mut router = create_router(state)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(server.max_body_size))
        .layer(TimeoutLayer::new(Duration::from_secs(server.request_timeout_secs)))
        .layer(TraceLayer::new_for_http());

    if server.enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }
    router
}

/// Create the API server
pub async fn create_server(
    config: &FleetConfig,
) -> Result<(Router, SocketAddr, AppState), Box<dyn std::error::Error + Send + Sync>> {
    let state = AppState::from_config(config).await?;
    let router = build_app(state.clone());
    let addr: SocketAddr = config.server.bind_address().parse()?;
    Ok((router, addr, state))
}

/// Periodically complete queries whose expiration passed
pub fn spawn_cleanup(state: AppState, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match state.queries.cleanup_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(completed = n, "Expired queries completed"),
                Err(e) => tracing::warn!(error = %e, "Expired query sweep failed"),
            }
        }
    })
}

/// Run the API server until ctrl-c
pub async fn run_server(config: FleetConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (router, addr, state) = create_server(&config).await?;
    let cleanup = spawn_cleanup(
        state.clone(),
        Duration::from_secs(config.server.cleanup_interval_secs.max(1)),
    );

    tracing::info!("Fleet server listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    cleanup.abort();
    tracing::info!("Fleet server stopped");
    Ok(())
}
