//! Fleet API Server
//!
//! HTTP surface of the fleet control plane.
//!
//! ## Node protocol
//!
//! Paths are per environment; the defaults are shown.
//!
//! - POST /:env/enroll - Enroll a node
//! - POST /:env/config - Fetch the environment configuration
//! - POST /:env/log - Submit status/result logs (optionally gzip)
//! - POST /:env/read - Poll distributed queries
//! - POST /:env/write - Submit distributed query results
//! - POST /:env/init - Start a carve session
//! - POST /:env/block - Upload a carve block
//! - GET /:env/:secret_path/:script - Quick enroll/remove scripts, flags, certificate
//!
//! ## Operator API
//!
//! - GET|POST /api/v1/environments, GET /api/v1/environments/:env
//! - POST /api/v1/environments/:env/actions/:action
//! - GET /api/v1/nodes/:env, GET|DELETE /api/v1/nodes/:env/:uuid
//! - GET|POST /api/v1/queries/:env, GET /api/v1/queries/:env/:name
//! - POST /api/v1/queries/:env/:name/:action
//! - GET|POST /api/v1/carves/:env, GET /api/v1/carves/:env/:session
//! - GET /api/v1/carves/:env/:session/download
//!
//! ## Service
//!
//! - GET /health
//! - GET /metrics

pub mod config;
pub mod dto;
pub mod error;
pub mod routes;
pub mod server;
pub mod state;
pub mod telemetry;

pub use config::*;
pub use error::*;
pub use routes::create_router;
pub use server::*;
pub use state::*;
