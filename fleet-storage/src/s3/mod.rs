//! S3-Compatible Object Storage Client
//!
//! Minimal client for AWS S3, MinIO and other S3-compatible services.
//! Requests are signed with AWS Signature Version 4 when credentials are
//! configured; without credentials they are sent unsigned, which suits
//! MinIO/LocalStack deployments with anonymous bucket policies.

pub mod client;
pub mod sigv4;

pub use client::{CompletedPart, S3Client};
pub use sigv4::Credentials;

use serde::{Deserialize, Serialize};

const DEFAULT_REGION: &str = "us-east-1";

/// Smallest part S3 accepts for every part but the last
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Highest part number a multipart upload accepts
pub const MAX_PARTS: usize = 10_000;

/// Object storage settings for carve archives and the s3 log sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Custom endpoint; AWS is addressed by region when unset
    pub endpoint: Option<String>,
    /// AWS region
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Prepended to every object key
    pub key_prefix: String,
    /// Access key ID
    pub access_key_id: Option<String>,
    /// Secret access key
    pub secret_access_key: Option<String>,
    /// Session token for temporary credentials
    pub session_token: Option<String>,
    /// `endpoint/bucket/key` instead of `bucket.endpoint/key`
    pub path_style: bool,
    /// Per-request timeout, seconds
    pub timeout_secs: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: DEFAULT_REGION.into(),
            bucket: "fleet-carves".to_string(),
            key_prefix: String::new(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            path_style: false,
            timeout_secs: 30,
        }
    }
}

impl S3Config {
    /// AWS bucket in `region`
    pub fn aws(region: &str, bucket: &str) -> Self {
        Self {
            region: region.into(),
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    /// Self-hosted S3-compatible service with path-style addressing
    pub fn minio(endpoint: &str, bucket: &str) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            bucket: bucket.into(),
            path_style: true,
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, access_key: &str, secret_key: &str) -> Self {
        self.access_key_id = Some(access_key.into());
        self.secret_access_key = Some(secret_key.into());
        self
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(access), Some(secret)) => Some(Credentials {
                access_key_id: access.clone(),
                secret_access_key: secret.clone(),
                session_token: self.session_token.clone(),
            }),
            _ => None,
        }
    }
}
