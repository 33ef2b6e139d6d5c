//! HTTP forwarding sink
//!
//! POSTs each batch as JSON to an analytics endpoint.

use async_trait::async_trait;
use fleet_core::LogBatch;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{SinkError, SinkResult};
use crate::sink::Sink;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSinkConfig {
    pub url: String,
    /// Sent as `Authorization: Bearer <token>`
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

pub struct HttpSink {
    config: HttpSinkConfig,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig) -> SinkResult<Self> {
        if !(config.url.starts_with("http://") || config.url.starts_with("https://")) {
            return Err(SinkError::Configuration(format!("invalid sink url '{}'", config.url)));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SinkError::Configuration(e.to_string()))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, batch: &LogBatch) -> SinkResult<()> {
        let mut request = self.client.post(&self.config.url).json(batch);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Http(format!("{} answered {}", self.config.url, status)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_url() {
        let config = HttpSinkConfig {
            url: "ftp://example.com".into(),
            token: None,
            headers: HashMap::new(),
            timeout_secs: 1,
        };
        assert!(matches!(HttpSink::new(config), Err(SinkError::Configuration(_))));
    }
}
