//! HTTP-backed [`MetadataFetcher`] against an instance-metadata service
//! (IMDS or an equivalent on other clouds).
//!
//! Same `reqwest::Client` + `base_url` shape as [`crate::cloud_http`].

use async_trait::async_trait;
use nycast_core::metadata::MetadataFetcher;
use std::time::Duration;

const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_BASE_URL: &str = "http://169.254.169.254/latest/meta-data";

pub struct InstanceMetadataHttpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl InstanceMetadataHttpFetcher {
    pub fn new() -> Self {
        let base_url = std::env::var("NYCAST_METADATA_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        InstanceMetadataHttpFetcher {
            client: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build().unwrap_or_default(),
            base_url,
        }
    }
}

impl Default for InstanceMetadataHttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataFetcher for InstanceMetadataHttpFetcher {
    async fn available(&self) -> bool {
        self.client
            .get(&self.base_url)
            .timeout(AVAILABILITY_TIMEOUT)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn get(&self, key: &str) -> Result<String, String> {
        let url = format!("{}/{key}", self.base_url);
        let response = self.client.get(&url).send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("metadata key '{key}' returned HTTP {}", response.status()));
        }
        response.text().await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn available_is_true_on_success_status() {
        let mock = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&mock)
            .await;
        let fetcher = InstanceMetadataHttpFetcher {
            client: reqwest::Client::new(),
            base_url: mock.uri(),
        };
        assert!(fetcher.available().await);
    }

    #[tokio::test]
    async fn get_returns_body_text_on_success() {
        let mock = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/instance-id"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("i-0abc123"))
            .mount(&mock)
            .await;
        let fetcher = InstanceMetadataHttpFetcher {
            client: reqwest::Client::new(),
            base_url: mock.uri(),
        };
        assert_eq!(fetcher.get("instance-id").await.unwrap(), "i-0abc123");
    }

    #[tokio::test]
    async fn get_fails_on_non_success_status() {
        let mock = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(404))
            .mount(&mock)
            .await;
        let fetcher = InstanceMetadataHttpFetcher {
            client: reqwest::Client::new(),
            base_url: mock.uri(),
        };
        assert!(fetcher.get("instance-id").await.is_err());
    }
}
