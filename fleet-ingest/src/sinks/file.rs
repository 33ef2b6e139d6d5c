//! JSON-lines file sink

use async_trait::async_trait;
use fleet_core::LogBatch;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::SinkResult;
use crate::sink::Sink;

/// Appends each batch as one JSON line
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    pub async fn open(path: impl AsRef<Path>) -> SinkResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn send(&self, batch: &LogBatch) -> SinkResult<()> {
        let mut line = serde_json::to_vec(batch)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_core::LogType;
    use serde_json::json;

    #[tokio::test]
    async fn test_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::open(dir.path().join("logs/fleet.jsonl")).await.unwrap();
        for i in 0..2 {
            let batch = LogBatch {
                log_type: LogType::Status,
                environment: "env".into(),
                environment_name: "acme".into(),
                uuid: "N1".into(),
                query_name: None,
                status: None,
                data: json!([{ "line": i }]),
                received_at: Utc::now(),
            };
            sink.send(&batch).await.unwrap();
        }

        let contents = tokio::fs::read_to_string(sink.path()).await.unwrap();
        let lines: Vec<LogBatch> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].data[0]["line"], 1);
    }
}
