//! Per-service settings accessor

use std::collections::HashMap;
use std::sync::RwLock;

/// Feature-flag and settings lookup, keyed by (service, key)
pub trait SettingsProvider: Send + Sync {
    fn get(&self, service: &str, key: &str) -> Option<String>;

    fn get_bool(&self, service: &str, key: &str, default: bool) -> bool {
        match self.get(service, key) {
            Some(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"),
            None => default,
        }
    }

    fn get_int(&self, service: &str, key: &str, default: i64) -> i64 {
        self.get(service, key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }
}

/// In-process settings map
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<(String, String), String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, service: &str, key: &str, value: impl Into<String>) {
        if let Ok(mut values) = self.values.write() {
            values.insert((service.to_string(), key.to_string()), value.into());
        }
    }

    pub fn with(self, service: &str, key: &str, value: impl Into<String>) -> Self {
        self.set(service, key, value);
        self
    }
}

impl SettingsProvider for MemorySettings {
    fn get(&self, service: &str, key: &str) -> Option<String> {
        self.values
            .read()
            .ok()
            .and_then(|values| values.get(&(service.to_string(), key.to_string())).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_lookups() {
        let settings = MemorySettings::new()
            .with("logging", "db_enabled", "false")
            .with("tls", "debug_http", "yes")
            .with("tls", "limit", "12");

        assert!(!settings.get_bool("logging", "db_enabled", true));
        assert!(settings.get_bool("tls", "debug_http", false));
        assert!(settings.get_bool("logging", "file_enabled", true));
        assert_eq!(settings.get_int("tls", "limit", 0), 12);
        assert_eq!(settings.get_int("tls", "missing", 7), 7);
    }
}
