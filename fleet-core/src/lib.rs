//! Fleet Core - node control plane data model
//!
//! This crate provides the types and narrow collaborator interfaces shared by
//! every layer of the control plane:
//! - Environments (tenants) with their secrets, endpoint paths and agent configuration
//! - Nodes (enrolled agents) and their archive history
//! - Distributed queries, targets and execution facts
//! - Carve sessions and block references
//!
//! Collaborators consumed by the engines are expressed as traits
//! (`Environments`, `PermissionChecker`, `SettingsProvider`) so that the
//! persistence and administrative layers can be swapped without touching
//! the protocol logic.

pub mod access;
pub mod constants;
pub mod error;
pub mod ids;
pub mod registry;
pub mod scripts;
pub mod settings;
pub mod types;

pub use access::{AccessLevel, PermissionChecker, StaticPermissions};
pub use constants::*;
pub use error::{CoreError, CoreResult};
pub use registry::Environments;
pub use settings::{MemorySettings, SettingsProvider};
pub use types::*;
