//! Operator permission checks
//!
//! The node protocol never consults permissions; only operator-facing
//! read and management endpoints do.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Access level, ordered from least to most privileged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    User,
    Query,
    Carve,
    Admin,
}

impl AccessLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "query" => Some(Self::Query),
            "carve" => Some(Self::Carve),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// Permission check consumed by operator endpoints
pub trait PermissionChecker: Send + Sync {
    /// Whether `user` holds at least `level` in `environment`
    fn check(&self, user: &str, level: AccessLevel, environment: &str) -> bool;
}

/// Grants configured up front: user → (environment or `*`) → level
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    grants: HashMap<String, HashMap<String, AccessLevel>>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, user: &str, environment: &str, level: AccessLevel) -> Self {
        self.grants
            .entry(user.to_string())
            .or_default()
            .insert(environment.to_string(), level);
        self
    }
}

impl PermissionChecker for StaticPermissions {
    fn check(&self, user: &str, level: AccessLevel, environment: &str) -> bool {
        let Some(envs) = self.grants.get(user) else {
            return false;
        };
        [environment, "*"]
            .iter()
            .filter_map(|e| envs.get(*e))
            .any(|granted| *granted >= level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(AccessLevel::Admin > AccessLevel::Carve);
        assert!(AccessLevel::Carve > AccessLevel::Query);
        assert!(AccessLevel::Query > AccessLevel::User);
    }

    #[test]
    fn test_static_permissions() {
        let perms = StaticPermissions::new()
            .grant("alice", "acme", AccessLevel::Query)
            .grant("root", "*", AccessLevel::Admin);

        assert!(perms.check("alice", AccessLevel::User, "acme"));
        assert!(perms.check("alice", AccessLevel::Query, "acme"));
        assert!(!perms.check("alice", AccessLevel::Carve, "acme"));
        assert!(!perms.check("alice", AccessLevel::User, "other"));
        assert!(perms.check("root", AccessLevel::Admin, "anything"));
        assert!(!perms.check("nobody", AccessLevel::User, "acme"));
    }
}
