//! Object storage sink: one object per batch

use async_trait::async_trait;
use fleet_core::LogBatch;
use fleet_storage::{S3Client, S3Config};

use crate::error::SinkResult;
use crate::sink::Sink;

pub struct S3Sink {
    client: S3Client,
}

impl S3Sink {
    pub fn new(config: S3Config) -> SinkResult<Self> {
        Ok(Self {
            client: S3Client::new(config)?,
        })
    }

    /// `{environment}/{log_type}/{YYYY-MM-DD}/{uuid}-{nanos}.json`
    pub fn object_key(batch: &LogBatch) -> String {
        format!(
            "{}/{}/{}/{}-{}.json",
            batch.environment_name,
            batch.log_type.as_str(),
            batch.received_at.format("%Y-%m-%d"),
            batch.uuid,
            batch.received_at.timestamp_nanos_opt().unwrap_or_default()
        )
    }
}

#[async_trait]
impl Sink for S3Sink {
    fn name(&self) -> &str {
        "s3"
    }

    async fn send(&self, batch: &LogBatch) -> SinkResult<()> {
        let body = serde_json::to_vec(batch)?;
        self.client
            .put_object(&Self::object_key(batch), body, "application/json")
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fleet_core::LogType;
    use serde_json::json;

    #[test]
    fn test_object_key_layout() {
        let batch = LogBatch {
            log_type: LogType::Query,
            environment: "0000".into(),
            environment_name: "acme".into(),
            uuid: "N1".into(),
            query_name: Some("q1".into()),
            status: Some(0),
            data: json!([]),
            received_at: Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap(),
        };
        let key = S3Sink::object_key(&batch);
        assert!(key.starts_with("acme/query/2024-03-09/N1-"));
        assert!(key.ends_with(".json"));
    }
}
