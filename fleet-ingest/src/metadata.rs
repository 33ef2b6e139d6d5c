//! Batch metadata extraction
//!
//! Every entry of a status/result batch carries `hostIdentifier`,
//! `version` and a `decorations` object. Each field is deduplicated across
//! the batch and the first non-empty value, in arrival order, is taken for
//! the whole batch.

use fleet_core::ids::normalize_uuid;
use fleet_core::NodeMetadata;
use serde_json::Value;

/// Metadata of one batch plus the fields whose values disagreed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchMetadata {
    pub metadata: NodeMetadata,
    /// Fields that carried more than one distinct non-empty value
    pub conflicts: Vec<&'static str>,
    pub entries: usize,
}

#[derive(Default)]
struct Field {
    values: Vec<String>,
}

impl Field {
    fn push(&mut self, value: Option<&str>) {
        if let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) {
            if !self.values.iter().any(|seen| seen == v) {
                self.values.push(v.to_string());
            }
        }
    }

    fn first(&self) -> String {
        self.values.first().cloned().unwrap_or_default()
    }

    fn conflicting(&self) -> bool {
        self.values.len() > 1
    }
}

fn text<'a>(entry: &'a Value, pointer: &str) -> Option<&'a str> {
    entry.pointer(pointer).and_then(Value::as_str)
}

/// Extract node metadata from a decoded log batch (a JSON array)
pub fn extract_metadata(data: &Value) -> BatchMetadata {
    let entries = data.as_array().map(Vec::as_slice).unwrap_or_default();

    const FIELDS: [&str; 8] = [
        "uuid",
        "hostname",
        "localname",
        "username",
        "osquery_user",
        "config_hash",
        "daemon_hash",
        "osquery_version",
    ];
    const POINTERS: [&str; 8] = [
        "/hostIdentifier",
        "/decorations/hostname",
        "/decorations/local_hostname",
        "/decorations/username",
        "/decorations/osquery_user",
        "/decorations/config_hash",
        "/decorations/osquery_md5",
        "/version",
    ];

    let mut fields: [Field; 8] = Default::default();
    for entry in entries {
        for (field, pointer) in fields.iter_mut().zip(POINTERS) {
            field.push(text(entry, pointer));
        }
        // Result logs carry the agent version as a decoration instead
        if text(entry, "/version").is_none() {
            fields[7].push(text(entry, "/decorations/osquery_version"));
        }
    }

    let conflicts = FIELDS
        .iter()
        .zip(fields.iter())
        .filter(|(_, f)| f.conflicting())
        .map(|(name, _)| *name)
        .collect();

    BatchMetadata {
        metadata: NodeMetadata {
            uuid: normalize_uuid(&fields[0].first()),
            hostname: fields[1].first(),
            localname: fields[2].first(),
            username: fields[3].first(),
            osquery_user: fields[4].first(),
            config_hash: fields[5].first(),
            daemon_hash: fields[6].first(),
            osquery_version: fields[7].first(),
        },
        conflicts,
        entries: entries.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extracts_first_values() {
        let batch = json!([
            {
                "hostIdentifier": "abc-1",
                "version": "5.10.2",
                "decorations": {
                    "hostname": "web-1",
                    "local_hostname": "web-1.local",
                    "username": "root",
                    "osquery_user": "root",
                    "config_hash": "c1",
                    "osquery_md5": "d1"
                }
            },
            { "hostIdentifier": "abc-1", "decorations": { "hostname": "web-1" } }
        ]);
        let extracted = extract_metadata(&batch);
        assert_eq!(extracted.entries, 2);
        assert!(extracted.conflicts.is_empty());
        assert_eq!(extracted.metadata.uuid, "ABC-1");
        assert_eq!(extracted.metadata.localname, "web-1.local");
        assert_eq!(extracted.metadata.daemon_hash, "d1");
        assert_eq!(extracted.metadata.osquery_version, "5.10.2");
    }

    #[test]
    fn test_mixed_identities_keep_first_and_report() {
        let batch = json!([
            { "hostIdentifier": "", "decorations": { "hostname": "" } },
            { "hostIdentifier": "n1", "decorations": { "hostname": "a" } },
            { "hostIdentifier": "n2", "decorations": { "hostname": "b" } }
        ]);
        let extracted = extract_metadata(&batch);
        assert_eq!(extracted.metadata.uuid, "N1");
        assert_eq!(extracted.metadata.hostname, "a");
        assert_eq!(extracted.conflicts, vec!["uuid", "hostname"]);
    }

    #[test]
    fn test_non_array_yields_empty_metadata() {
        let extracted = extract_metadata(&json!({ "not": "a batch" }));
        assert_eq!(extracted.entries, 0);
        assert_eq!(extracted.metadata, NodeMetadata::default());
    }
}
