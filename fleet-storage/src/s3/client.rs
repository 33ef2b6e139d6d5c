//! S3 HTTP client

use chrono::Utc;
use reqwest::{Method, Url};
use tracing::{debug, info, warn};

use super::sigv4::{self, SignableRequest, UNSIGNED_PAYLOAD};
use super::S3Config;
use crate::error::{StorageError, StorageResult};

/// Part recorded for CompleteMultipartUpload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// S3 client over reqwest
pub struct S3Client {
    config: S3Config,
    client: reqwest::Client,
    scheme: String,
    /// Endpoint host (with non-default port)
    endpoint_host: String,
}

struct Target {
    url: String,
    host: String,
    canonical_uri: String,
}

impl S3Client {
    /// Create a new S3 client
    pub fn new(config: S3Config) -> StorageResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StorageError::Configuration(format!("HTTP client error: {}", e)))?;

        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", config.region));
        let parsed = Url::parse(&endpoint)
            .map_err(|e| StorageError::Configuration(format!("invalid endpoint {}: {}", endpoint, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| StorageError::Configuration(format!("endpoint has no host: {}", endpoint)))?;
        let endpoint_host = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = %endpoint,
            "S3 client initialized"
        );

        Ok(Self {
            scheme: parsed.scheme().to_string(),
            endpoint_host,
            config,
            client,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    /// Prefix a relative key with the configured key prefix
    pub fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// `s3://bucket/key` reference for an object
    pub fn object_url(&self, key: &str) -> String {
        format!("s3://{}/{}", self.config.bucket, key)
    }

    /// Extract the object key from an `s3://bucket/key` reference
    pub fn key_from_url(&self, url: &str) -> StorageResult<String> {
        let prefix = format!("s3://{}/", self.config.bucket);
        url.strip_prefix(&prefix)
            .map(str::to_string)
            .ok_or_else(|| StorageError::UnsupportedReference(url.to_string()))
    }

    fn target(&self, key: &str) -> Target {
        let encoded_key = sigv4::uri_encode(key, true);
        if self.config.path_style {
            let canonical_uri = format!("/{}/{}", sigv4::uri_encode(&self.config.bucket, false), encoded_key);
            Target {
                url: format!("{}://{}{}", self.scheme, self.endpoint_host, canonical_uri),
                host: self.endpoint_host.clone(),
                canonical_uri,
            }
        } else {
            let host = format!("{}.{}", self.config.bucket, self.endpoint_host);
            let canonical_uri = format!("/{}", encoded_key);
            Target {
                url: format!("{}://{}{}", self.scheme, host, canonical_uri),
                host,
                canonical_uri,
            }
        }
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> StorageResult<reqwest::Response> {
        let target = self.target(key);
        let mut url = target.url.clone();
        if !query.is_empty() {
            let qs = query
                .iter()
                .map(|(k, v)| {
                    if v.is_empty() && k == "uploads" {
                        k.clone()
                    } else {
                        format!("{}={}", sigv4::uri_encode(k, false), sigv4::uri_encode(v, false))
                    }
                })
                .collect::<Vec<_>>()
                .join("&");
            url = format!("{}?{}", url, qs);
        }

        let mut request = self.client.request(method.clone(), &url);
        let mut all_headers: Vec<(String, String)> = headers.to_vec();

        if let Some(credentials) = self.config.credentials() {
            let payload_hash = match &body {
                Some(bytes) => sigv4::hash_payload(bytes),
                None => sigv4::hash_payload(b""),
            };
            let signable = SignableRequest {
                method: method.as_str(),
                host: &target.host,
                canonical_uri: &target.canonical_uri,
                query,
                headers,
                payload_hash: &payload_hash,
            };
            all_headers = sigv4::sign_request(&signable, &credentials, &self.config.region, Utc::now())?;
        }

        for (name, value) in &all_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(bytes) = body {
            request = request.body(bytes);
        }

        debug!(method = %method, key = %key, "S3 request");
        request
            .send()
            .await
            .map_err(|e| StorageError::OperationFailed(format!("S3 {} failed: {}", method, e)))
    }

    async fn check(response: reqwest::Response, op: &str, key: &str) -> StorageResult<reqwest::Response> {
        if response.status().as_u16() == 404 {
            return Err(StorageError::NotFound(key.to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::OperationFailed(format!(
                "S3 {} failed: {} - {}",
                op, status, body
            )));
        }
        Ok(response)
    }

    /// Put object to S3-compatible storage
    pub async fn put_object(&self, key: &str, data: Vec<u8>, content_type: &str) -> StorageResult<()> {
        let headers = vec![("content-type".to_string(), content_type.to_string())];
        let response = self.send(Method::PUT, key, &[], &headers, Some(data)).await?;
        Self::check(response, "PUT", key)
            .await
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    /// Get object bytes
    pub async fn get_object(&self, key: &str) -> StorageResult<Vec<u8>> {
        let response = self.send(Method::GET, key, &[], &[], None).await?;
        let response = Self::check(response, "GET", key).await?;
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| StorageError::ReadFailed(format!("Failed to read S3 response: {}", e)))
    }

    /// Get the first `len` bytes of an object
    pub async fn get_object_prefix(&self, key: &str, len: u64) -> StorageResult<Vec<u8>> {
        let headers = vec![("range".to_string(), format!("bytes=0-{}", len.saturating_sub(1)))];
        let response = self.send(Method::GET, key, &[], &headers, None).await?;
        let response = Self::check(response, "GET", key).await?;
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| StorageError::ReadFailed(format!("Failed to read S3 response: {}", e)))
    }

    /// Check if object exists
    pub async fn head_object(&self, key: &str) -> StorageResult<bool> {
        let response = self.send(Method::HEAD, key, &[], &[], None).await?;
        Ok(response.status().is_success())
    }

    /// Start a multipart upload, returning its upload id
    pub async fn create_multipart_upload(&self, key: &str) -> StorageResult<String> {
        let query = vec![("uploads".to_string(), String::new())];
        let headers = vec![("content-type".to_string(), "application/x-tar".to_string())];
        let response = self.send(Method::POST, key, &query, &headers, None).await?;
        let response = Self::check(response, "CreateMultipartUpload", key).await?;
        let body = response.text().await.unwrap_or_default();
        xml_value(&body, "UploadId").ok_or_else(|| {
            StorageError::OperationFailed(format!("CreateMultipartUpload returned no UploadId: {}", body))
        })
    }

    /// Copy an existing object into part `part_number` of an upload
    pub async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        source_key: &str,
    ) -> StorageResult<CompletedPart> {
        let query = part_query(upload_id, part_number);
        let source = format!(
            "/{}/{}",
            self.config.bucket,
            sigv4::uri_encode(source_key, true)
        );
        let headers = vec![("x-amz-copy-source".to_string(), source)];
        let response = self.send(Method::PUT, key, &query, &headers, None).await?;
        let response = Self::check(response, "UploadPartCopy", key).await?;
        let body = response.text().await.unwrap_or_default();
        if body.contains("<Error>") {
            return Err(StorageError::OperationFailed(format!("UploadPartCopy failed: {}", body)));
        }
        let etag = xml_value(&body, "ETag").ok_or_else(|| {
            StorageError::OperationFailed(format!("UploadPartCopy returned no ETag: {}", body))
        })?;
        Ok(CompletedPart { part_number, etag })
    }

    /// Upload bytes as part `part_number` of an upload
    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> StorageResult<CompletedPart> {
        let query = part_query(upload_id, part_number);
        let response = self.send(Method::PUT, key, &query, &[], Some(data)).await?;
        let response = Self::check(response, "UploadPart", key).await?;
        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        Ok(CompletedPart { part_number, etag })
    }

    /// Complete a multipart upload with parts in ascending part order
    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        let query = vec![("uploadId".to_string(), upload_id.to_string())];
        let mut body = String::from("<CompleteMultipartUpload>");
        for part in parts {
            body.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                part.part_number, part.etag
            ));
        }
        body.push_str("</CompleteMultipartUpload>");

        let headers = vec![("content-type".to_string(), "application/xml".to_string())];
        let response = self
            .send(Method::POST, key, &query, &headers, Some(body.into_bytes()))
            .await?;
        let response = Self::check(response, "CompleteMultipartUpload", key).await?;
        let text = response.text().await.unwrap_or_default();
        if text.contains("<Error>") {
            return Err(StorageError::OperationFailed(format!(
                "CompleteMultipartUpload failed: {}",
                text
            )));
        }
        Ok(())
    }

    /// Abort a multipart upload, logging rather than failing
    pub async fn abort_multipart_upload(&self, key: &str, upload_id: &str) {
        let query = vec![("uploadId".to_string(), upload_id.to_string())];
        match self.send(Method::DELETE, key, &query, &[], None).await {
            Ok(response) if response.status().is_success() => {
                debug!(key = %key, upload_id = %upload_id, "Multipart upload aborted");
            }
            Ok(response) => {
                warn!(key = %key, status = %response.status(), "Failed to abort multipart upload");
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to abort multipart upload"),
        }
    }

    /// Pre-signed GET link valid for `expires_secs`
    pub fn presign_get(&self, key: &str, expires_secs: u64) -> StorageResult<String> {
        let target = self.target(key);
        let Some(credentials) = self.config.credentials() else {
            return Ok(target.url);
        };
        let signable = SignableRequest {
            method: "GET",
            host: &target.host,
            canonical_uri: &target.canonical_uri,
            query: &[],
            headers: &[],
            payload_hash: UNSIGNED_PAYLOAD,
        };
        let query = sigv4::presign_query(
            &signable,
            &credentials,
            &self.config.region,
            Utc::now(),
            expires_secs,
        )?;
        Ok(format!("{}?{}", target.url, query))
    }
}

fn part_query(upload_id: &str, part_number: u32) -> Vec<(String, String)> {
    vec![
        ("partNumber".to_string(), part_number.to_string()),
        ("uploadId".to_string(), upload_id.to_string()),
    ]
}

/// Text of the first `<tag>` element in an XML document
fn xml_value(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].replace("&quot;", "\"").trim().to_string())
}
