//! Identifier and secret generation

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Generate a random alphanumeric string of `len` characters
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Derive a node key from the asserted UUID and the current time.
///
/// Two enrollments of the same UUID produce different keys because the
/// nanosecond timestamp and a random salt are part of the digest input.
pub fn generate_node_key(uuid: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let salt: u64 = rand::thread_rng().gen();
    let mut hasher = Sha256::new();
    hasher.update(uuid.as_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(salt.to_le_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Generate a carve session identifier
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Generate a distributed query name
pub fn generate_query_name() -> String {
    format!("query_{}", random_string(20).to_lowercase())
}

/// Generate a carve query name
pub fn generate_carve_name() -> String {
    format!("carve_{}", random_string(20).to_lowercase())
}

/// Normalize a caller-asserted node UUID
pub fn normalize_uuid(uuid: &str) -> String {
    uuid.trim().to_uppercase()
}

/// Whether a normalized node UUID can safely name storage objects.
///
/// Carve blocks and archives are keyed by the UUID, so separators, parent
/// references and control characters are refused.
pub fn valid_uuid(uuid: &str) -> bool {
    !uuid.is_empty()
        && !uuid.contains("..")
        && !uuid.chars().any(|c| c == '/' || c == '\\' || c.is_control())
}

/// Map an arbitrary string onto a single file-name component.
///
/// Separators and control characters become `-`; a result made only of
/// dots (or nothing) becomes underscores.
pub fn path_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_control() { '-' } else { c })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        "_".repeat(cleaned.len().max(1))
    } else {
        cleaned
    }
}

/// Normalize a node key for lookup
pub fn normalize_node_key(key: &str) -> String {
    key.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_keys_differ_for_same_uuid() {
        let a = generate_node_key("N1");
        let b = generate_node_key("N1");
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_random_string_length() {
        let s = random_string(64);
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize_uuid("  abc-def "), "ABC-DEF");
        assert_eq!(normalize_node_key("ABCdef"), "abcdef");
    }

    #[test]
    fn test_valid_uuid() {
        assert!(valid_uuid("4C4C4544-0051-3010-8052-B4C04F4D4D32"));
        assert!(valid_uuid("WEB-1.EXAMPLE.COM"));
        assert!(!valid_uuid(""));
        assert!(!valid_uuid("../../../ESCAPED"));
        assert!(!valid_uuid("A/B"));
        assert!(!valid_uuid("A\\B"));
        assert!(!valid_uuid("A\nB"));
    }

    #[test]
    fn test_path_component_stays_inside_one_segment() {
        assert_eq!(path_component("N1"), "N1");
        assert_eq!(path_component("../../../ESCAPED"), "..-..-..-ESCAPED");
        assert_eq!(path_component(".."), "__");
        assert_eq!(path_component(""), "_");
        assert_eq!(path_component("a\\b\0c"), "a-b-c");
    }
}
