//! HTTP-backed [`RouteTableApi`]: a thin REST transport standing in for
//! the real cloud SDK call (request signing, pagination, retries are an
//! external collaborator per the data model's scope).
//!
//! Grounded on `providers/custom.rs`'s shape: one shared `reqwest::Client`,
//! a `base_url`, JSON in and out, `is_success()` gating error handling.

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use nycast_core::cloud::RouteTableApi;
use nycast_core::error::CloudError;
use nycast_core::models::{CloudRouteTable, InstanceStatus, NetworkInterface};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpRouteTableApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRouteTableApi {
    /// `version` becomes the client's user agent, the same way the Go
    /// source tagged its AWS SDK client with `awsnycast/<version>`.
    pub fn new(region: impl Into<String>, version: impl AsRef<str>) -> Self {
        let region = region.into();
        let base_url =
            std::env::var("NYCAST_CLOUD_API_URL").unwrap_or_else(|_| format!("https://routing.{region}.nycast.internal"));
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("nycast/{}", version.as_ref()))
            .build()
            .unwrap_or_default();
        HttpRouteTableApi { client, base_url }
    }

    async fn handle_error(operation: &str, response: reqwest::Response) -> CloudError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_else(|_| "could not read error body".to_string());
        CloudError::Api {
            operation: operation.to_string(),
            message: format!("HTTP {status}: {message}"),
        }
    }

    fn transport_error(operation: &str, e: reqwest::Error) -> CloudError {
        CloudError::Api {
            operation: operation.to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct InstanceStatusResponse {
    statuses: Vec<InstanceStatus>,
}

#[async_trait]
impl RouteTableApi for HttpRouteTableApi {
    async fn describe_route_tables(&self) -> Result<Vec<CloudRouteTable>, CloudError> {
        let url = format!("{}/route-tables", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport_error("describe_route_tables", e))?;
        if !response.status().is_success() {
            return Err(Self::handle_error("describe_route_tables", response).await);
        }
        response
            .json()
            .await
            .map_err(|e| Self::transport_error("describe_route_tables", e))
    }

    /// `noop` never skips the call itself: it rides along as `dry_run` so
    /// the far end can still validate permissions and route shape and
    /// report what it would have done, per spec.md's requirement that a
    /// noop reconciliation still exercises the real API path.
    async fn create_route(&self, route_table_id: &str, cidr: IpNetwork, instance_id: &str, noop: bool) -> Result<(), CloudError> {
        let url = format!("{}/route-tables/{route_table_id}/routes", self.base_url);
        let body = json!({ "destination": cidr.to_string(), "instance_id": instance_id, "dry_run": noop });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::transport_error("create_route", e))?;
        if !response.status().is_success() {
            return Err(Self::handle_error("create_route", response).await);
        }
        Ok(())
    }

    async fn replace_route(&self, route_table_id: &str, cidr: IpNetwork, network_interface_id: &str, noop: bool) -> Result<(), CloudError> {
        let url = format!("{}/route-tables/{route_table_id}/routes/{}", self.base_url, encode_cidr(&cidr));
        let body = json!({ "network_interface_id": network_interface_id, "dry_run": noop });
        let response = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::transport_error("replace_route", e))?;
        if !response.status().is_success() {
            return Err(Self::handle_error("replace_route", response).await);
        }
        Ok(())
    }

    async fn delete_route(&self, route_table_id: &str, cidr: IpNetwork, noop: bool) -> Result<(), CloudError> {
        let url = format!("{}/route-tables/{route_table_id}/routes/{}?dry_run={noop}", self.base_url, encode_cidr(&cidr));
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| Self::transport_error("delete_route", e))?;
        if !response.status().is_success() {
            return Err(Self::handle_error("delete_route", response).await);
        }
        Ok(())
    }

    async fn describe_network_interfaces_for_instance(&self, instance_id: &str) -> Result<Vec<NetworkInterface>, CloudError> {
        let url = format!("{}/instances/{instance_id}/network-interfaces", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport_error("describe_network_interfaces_for_instance", e))?;
        if !response.status().is_success() {
            return Err(Self::handle_error("describe_network_interfaces_for_instance", response).await);
        }
        response
            .json()
            .await
            .map_err(|e| Self::transport_error("describe_network_interfaces_for_instance", e))
    }

    async fn describe_network_interfaces(&self, ids: &[String]) -> Result<Vec<NetworkInterface>, CloudError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/network-interfaces?ids={}", self.base_url, ids.join(","));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport_error("describe_network_interfaces", e))?;
        if !response.status().is_success() {
            return Err(Self::handle_error("describe_network_interfaces", response).await);
        }
        response.json().await.map_err(|e| Self::transport_error("describe_network_interfaces", e))
    }

    async fn describe_instance_status(&self, instance_id: &str) -> Result<Option<InstanceStatus>, CloudError> {
        let url = format!("{}/instances/{instance_id}/status?include_all_instances=false", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport_error("describe_instance_status", e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::handle_error("describe_instance_status", response).await);
        }
        let parsed: InstanceStatusResponse = response.json().await.map_err(|e| Self::transport_error("describe_instance_status", e))?;
        // a status response with no entries means the instance was not found: treat as impaired/terminated.
        Ok(parsed.statuses.into_iter().next())
    }
}

fn encode_cidr(cidr: &IpNetwork) -> String {
    cidr.to_string().replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn api_for(base_url: String) -> HttpRouteTableApi {
        HttpRouteTableApi {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    #[tokio::test]
    async fn describe_route_tables_deserializes_the_response() {
        let mock = wiremock::MockServer::start().await;
        let table = CloudRouteTable {
            route_table_id: "rtb-1".to_string(),
            vpc_id: "vpc-1".to_string(),
            tags: HashMap::new(),
            associations: Vec::new(),
            routes: Vec::new(),
        };
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/route-tables"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(vec![&table]))
            .mount(&mock)
            .await;

        let api = api_for(mock.uri());
        let tables = api.describe_route_tables().await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].route_table_id, "rtb-1");
    }

    #[tokio::test]
    async fn describe_route_tables_surfaces_server_errors() {
        let mock = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock)
            .await;

        let api = api_for(mock.uri());
        let err = api.describe_route_tables().await.unwrap_err();
        assert!(matches!(err, CloudError::Api { .. }));
    }

    #[tokio::test]
    async fn create_route_in_noop_mode_still_sends_the_request_with_dry_run_set() {
        let mock = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/route-tables/rtb-1/routes"))
            .and(wiremock::matchers::body_partial_json(json!({ "dry_run": true })))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock)
            .await;

        let api = api_for(mock.uri());
        let cidr: IpNetwork = "10.0.0.0/24".parse().unwrap();
        api.create_route("rtb-1", cidr, "i-123", true).await.unwrap();
    }

    #[tokio::test]
    async fn describe_instance_status_treats_404_as_none() {
        let mock = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(404))
            .mount(&mock)
            .await;

        let api = api_for(mock.uri());
        assert!(api.describe_instance_status("i-123").await.unwrap().is_none());
    }
}
