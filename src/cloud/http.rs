//! `reqwest`-backed [`CloudClient`] (spec.md §6, §9.3).
//!
//! Grounded in the teacher's `HttpSink` (`handlers/projectors/cloudevents/http_sink.rs`):
//! one shared `reqwest::Client`. Per spec.md §7, plain HTTP calls get no
//! automatic retry loop — a failed `get`/`post` is reported to the caller
//! once. `backon`'s backoff is reserved for MQTT/topic reconnect, which
//! has no client in this tree yet.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::config::{render_endpoint, CloudConfig, EndpointConfig};
use crate::error::CloudError;

use super::{CloudClient, Result};

pub struct HttpCloudClient {
    client: Client,
    config: CloudConfig,
}

impl HttpCloudClient {
    pub fn new(config: CloudConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CloudError::ConnectionError(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, api: &str) -> Result<&EndpointConfig> {
        match api {
            "product" => Ok(&self.config.product),
            "collection" => Ok(&self.config.collection),
            "brand" => Ok(&self.config.brand),
            "planogram" => Ok(&self.config.planogram),
            "transaction" => Ok(&self.config.transaction),
            "prereservation" => Ok(&self.config.prereservation),
            other => Err(CloudError::NotFound(other.to_string())),
        }
    }

    async fn request(&self, method: reqwest::Method, url: &str, body: Option<&Value>, api_key: Option<&str>) -> Result<Value> {
        let mut request = self.client.request(method, url);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CloudError::TimeoutError
            } else {
                CloudError::ConnectionError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::ServerError { status: status.as_u16(), body });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| CloudError::FormatError(e.to_string()))
    }
}

#[async_trait]
impl CloudClient for HttpCloudClient {
    async fn get(&self, api: &str, device_id: &str, customer_id: Option<&str>) -> Result<Value> {
        let endpoint = self.endpoint(api)?;
        let url = render_endpoint(&endpoint.url_template, device_id, customer_id);
        debug!(api, url, "cloud GET");
        self.request(reqwest::Method::GET, &url, None, endpoint.api_key.as_deref()).await
    }

    async fn post(&self, api: &str, device_id: &str, customer_id: Option<&str>, body: Value) -> Result<Value> {
        let endpoint = self.endpoint(api)?;
        let url = render_endpoint(&endpoint.url_template, device_id, customer_id);
        debug!(api, url, "cloud POST");
        self.request(reqwest::Method::POST, &url, Some(&body), endpoint.api_key.as_deref()).await
    }

    async fn download_image(&self, media_id: &str, dest: &Path) -> Result<u64> {
        let url = format!("{}/{media_id}", self.config.brand.url_template.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CloudError::ImageDownloadError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CloudError::ImageDownloadError(format!("status {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CloudError::ImageDownloadError(e.to_string()))?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| CloudError::ImageDownloadError(e.to_string()))?;
        Ok(bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_api_name_is_not_found() {
        let client = HttpCloudClient::new(CloudConfig::default()).unwrap();
        assert!(matches!(client.endpoint("nonexistent"), Err(CloudError::NotFound(_))));
    }

    #[test]
    fn known_api_names_resolve() {
        let client = HttpCloudClient::new(CloudConfig::default()).unwrap();
        for api in ["product", "collection", "brand", "planogram", "transaction", "prereservation"] {
            assert!(client.endpoint(api).is_ok());
        }
    }
}
