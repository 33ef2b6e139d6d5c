//! Structured log store sink

use async_trait::async_trait;
use fleet_core::{LogBatch, LogRecord};
use fleet_db::FleetStore;
use std::sync::Arc;

use crate::error::SinkResult;
use crate::sink::Sink;

/// Appends one `LogRecord` per batch to the fleet store
pub struct DbSink {
    store: Arc<dyn FleetStore>,
}

impl DbSink {
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Sink for DbSink {
    fn name(&self) -> &str {
        "db"
    }

    async fn send(&self, batch: &LogBatch) -> SinkResult<()> {
        self.store.append_logs(&[LogRecord::from(batch)]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_core::LogType;
    use fleet_db::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_batch_is_stored() {
        let store = Arc::new(MemoryStore::new());
        let sink = DbSink::new(store.clone());
        let batch = LogBatch {
            log_type: LogType::Result,
            environment: "env".into(),
            environment_name: "acme".into(),
            uuid: "N1".into(),
            query_name: None,
            status: None,
            data: json!([{ "name": "pack_uptime" }]),
            received_at: Utc::now(),
        };
        sink.send(&batch).await.unwrap();

        let logs = store.list_logs("env", "N1", LogType::Result, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].data, batch.data);
    }
}
