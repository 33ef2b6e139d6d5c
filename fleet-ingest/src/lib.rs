//! Fleet Ingest - log dispatch and telemetry sinks
//!
//! - `decode` - gzip request bodies
//! - `metadata` - node identity recovered from log decorations
//! - `sinks` - compiled-in destinations (`db`, `stdout`, `file`, `http`, `s3`)
//! - `pool` - bounded worker pool with a dead-letter log
//! - `dispatcher` - the entry point used by the protocol handlers

pub mod decode;
pub mod dispatcher;
pub mod error;
pub mod metadata;
pub mod pool;
pub mod registry;
pub mod sink;
pub mod sinks;

pub use decode::decode_body;
pub use dispatcher::{LogDispatcher, QueryResult};
pub use error::{SinkError, SinkResult};
pub use metadata::{extract_metadata, BatchMetadata};
pub use pool::{DeadLetter, DispatchConfig, SinkPool};
pub use registry::{build_sinks, SinkConfig};
pub use sink::Sink;
