//! Engine services on top of `FleetStore`

pub mod carve_service;
pub mod environment_service;
pub mod node_service;
pub mod query_service;

pub use carve_service::{BlockUpload, CarveService};
pub use environment_service::EnvironmentService;
pub use node_service::{EnrollOutcome, EnrollRejection, NodeService};
pub use query_service::{QueryService, ResultAccounting};
