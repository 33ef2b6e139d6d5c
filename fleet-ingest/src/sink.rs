//! Sink interface

use async_trait::async_trait;
use fleet_core::LogBatch;

use crate::error::SinkResult;

/// A telemetry destination.
///
/// Sinks receive the raw batch exactly as the node sent it, decoded but
/// otherwise unmodified. Implementations must be safe to call from several
/// dispatch workers at once.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Stable name used in settings keys, metrics and dead-letter records
    fn name(&self) -> &str;

    async fn send(&self, batch: &LogBatch) -> SinkResult<()>;
}
