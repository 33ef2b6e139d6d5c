//! Tracing sink

use async_trait::async_trait;
use fleet_core::LogBatch;
use tracing::info;

use crate::error::SinkResult;
use crate::sink::Sink;

/// Emits each batch as a tracing event under the `fleet_sink` target
#[derive(Debug, Default)]
pub struct StdoutSink;

#[async_trait]
impl Sink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn send(&self, batch: &LogBatch) -> SinkResult<()> {
        let data = serde_json::to_string(&batch.data)?;
        info!(
            target: "fleet_sink",
            log_type = batch.log_type.as_str(),
            environment = %batch.environment_name,
            uuid = %batch.uuid,
            query = batch.query_name.as_deref().unwrap_or(""),
            data = %data,
            "telemetry"
        );
        Ok(())
    }
}
