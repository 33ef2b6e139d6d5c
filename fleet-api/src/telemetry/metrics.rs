//! Prometheus Metrics
//!
//! # Metrics
//!
//! - `fleet_http_requests_total` - HTTP requests by method, path, status
//! - `fleet_http_request_duration_seconds` - HTTP request duration
//! - `fleet_protocol_requests_total` - node protocol calls by endpoint, outcome
//! - `fleet_sink_dispatch_total`, `fleet_dead_letter_total` - recorded by the sink pool
//!
//! The recorder is process-wide; `init_metrics` installs it once and hands
//! out clones of the same handle afterwards.

use axum::{extract::Request, middleware::Next, response::Response};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Instant;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Install the Prometheus recorder.
///
/// Returns `None` when metrics are disabled or another recorder already
/// owns the process.
pub fn init_metrics(config: &MetricsConfig) -> Option<PrometheusHandle> {
    if !config.enabled {
        tracing::info!("Metrics disabled");
        return None;
    }
    if let Some(handle) = HANDLE.get() {
        return Some(handle.clone());
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            tracing::info!("Metrics initialized");
            Some(HANDLE.get_or_init(|| handle).clone())
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install metrics recorder");
            HANDLE.get().cloned()
        }
    }
}

/// Record a request metric
pub fn record_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", normalize_path(path)),
        ("status", status.to_string()),
    ];

    counter!("fleet_http_requests_total", &labels).increment(1);
    histogram!("fleet_http_request_duration_seconds", &labels).record(duration_secs);
}

/// Record one node protocol call
pub fn record_protocol(endpoint: &'static str, outcome: &'static str) {
    counter!("fleet_protocol_requests_total", "endpoint" => endpoint, "outcome" => outcome).increment(1);
}

/// Collapse tenant and identifier segments so label cardinality stays bounded
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let normalized: Vec<&str> = match segments.as_slice() {
        ["health"] | ["metrics"] => segments.clone(),
        ["api", "v1", resource, rest @ ..] => {
            let mut out = vec!["api", "v1", *resource];
            out.extend(rest.iter().enumerate().map(|(i, s)| match (i, *s) {
                (2, action) => action,
                _ => ":id",
            }));
            out
        }
        [_, _] => vec![":env", ":endpoint"],
        [_, _, _] => vec![":env", ":secret", ":script"],
        _ => vec!["other"],
    };
    format!("/{}", normalized.join("/"))
}

/// Metrics middleware for tracking HTTP requests
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    record_request(&method, &path, response.status().as_u16(), start.elapsed().as_secs_f64());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_default() {
        assert!(MetricsConfig::default().enabled);
        assert!(init_metrics(&MetricsConfig { enabled: false }).is_none());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/acme/enroll"), "/:env/:endpoint");
        assert_eq!(normalize_path("/acme/Xk2p9/enroll.sh"), "/:env/:secret/:script");
        assert_eq!(normalize_path("/api/v1/nodes/acme"), "/api/v1/nodes/:id");
        assert_eq!(
            normalize_path("/api/v1/queries/acme/q1/complete"),
            "/api/v1/queries/:id/:id/complete"
        );
        assert_eq!(normalize_path("/a/b/c/d"), "/other");
    }
}
