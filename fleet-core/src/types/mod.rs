//! Core types for the fleet control plane

pub mod carve;
pub mod environment;
pub mod log;
pub mod node;
pub mod query;

pub use carve::*;
pub use environment::*;
pub use log::*;
pub use node::*;
pub use query::*;
