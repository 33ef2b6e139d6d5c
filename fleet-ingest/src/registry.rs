//! Sink registry
//!
//! The set of sink kinds is fixed at compile time; configuration selects
//! which ones are instantiated.

use fleet_db::FleetStore;
use fleet_storage::S3Config;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::SinkResult;
use crate::sink::Sink;
use crate::sinks::http::HttpSinkConfig;
use crate::sinks::{DbSink, FileSink, HttpSink, S3Sink, StdoutSink};

/// One configured sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    Db,
    Stdout,
    File { path: PathBuf },
    Http(HttpSinkConfig),
    S3(S3Config),
}

impl SinkConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Db => "db",
            Self::Stdout => "stdout",
            Self::File { .. } => "file",
            Self::Http(_) => "http",
            Self::S3(_) => "s3",
        }
    }

    pub async fn build(&self, store: &Arc<dyn FleetStore>) -> SinkResult<Arc<dyn Sink>> {
        Ok(match self {
            Self::Db => Arc::new(DbSink::new(store.clone())),
            Self::Stdout => Arc::new(StdoutSink),
            Self::File { path } => Arc::new(FileSink::open(path).await?),
            Self::Http(config) => Arc::new(HttpSink::new(config.clone())?),
            Self::S3(config) => Arc::new(S3Sink::new(config.clone())?),
        })
    }
}

/// Instantiate every configured sink
pub async fn build_sinks(configs: &[SinkConfig], store: &Arc<dyn FleetStore>) -> SinkResult<Vec<Arc<dyn Sink>>> {
    let mut sinks = Vec::with_capacity(configs.len());
    for config in configs {
        sinks.push(config.build(store).await?);
    }
    Ok(sinks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_db::MemoryStore;

    #[test]
    fn test_sink_config_tagging() {
        #[derive(Deserialize)]
        struct Wrapper {
            sinks: Vec<SinkConfig>,
        }
        let parsed: Wrapper = serde_json::from_value(serde_json::json!({
            "sinks": [
                { "type": "db" },
                { "type": "file", "path": "/tmp/fleet.jsonl" },
                { "type": "http", "url": "https://logs.example.com/ingest", "token": "t" }
            ]
        }))
        .unwrap();
        let names: Vec<&str> = parsed.sinks.iter().map(SinkConfig::name).collect();
        assert_eq!(names, vec!["db", "file", "http"]);
    }

    #[tokio::test]
    async fn test_build_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn FleetStore> = Arc::new(MemoryStore::new());
        let configs = vec![
            SinkConfig::Db,
            SinkConfig::Stdout,
            SinkConfig::File {
                path: dir.path().join("out.jsonl"),
            },
        ];
        let sinks = build_sinks(&configs, &store).await.unwrap();
        let names: Vec<&str> = sinks.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["db", "stdout", "file"]);
    }
}
