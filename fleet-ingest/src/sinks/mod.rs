//! Compiled-in sink implementations

pub mod db;
pub mod file;
pub mod http;
pub mod s3;
pub mod stdout;

pub use db::DbSink;
pub use file::FileSink;
pub use http::HttpSink;
pub use s3::S3Sink;
pub use stdout::StdoutSink;
