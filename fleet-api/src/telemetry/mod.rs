//! Telemetry
//!
//! Structured logging through `tracing-subscriber` and Prometheus metrics
//! through the `metrics` facade.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogConfig, LogFormat, LogLevel};
pub use metrics::{init_metrics, metrics_middleware, record_protocol, record_request, MetricsConfig};
