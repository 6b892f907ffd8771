//! HTTP healthcheck: healthy if a GET to `destination` returns a
//! successful status code before `every` elapses.
//!
//! Grounded on the teacher's `providers/custom.rs` pattern of holding a
//! single shared `reqwest::Client` rather than building one per request.

use async_trait::async_trait;
use nycast_core::healthcheck::HealthChecker;
use std::net::Ipv4Addr;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpProbe {
    destination: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(destination: String) -> Self {
        HttpProbe {
            destination,
            client: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build().unwrap_or_default(),
        }
    }

    fn replace_host(&self, ip: Ipv4Addr) -> String {
        match reqwest::Url::parse(&self.destination) {
            Ok(mut url) => {
                let _ = url.set_host(Some(&ip.to_string()));
                url.to_string()
            }
            Err(_) => ip.to_string(),
        }
    }
}

#[async_trait]
impl HealthChecker for HttpProbe {
    async fn probe(&self) -> bool {
        match self.client.get(&self.destination).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::trace!(destination = %self.destination, error = %e, "http probe failed");
                false
            }
        }
    }

    fn new_with_destination(&self, ip: Ipv4Addr) -> Box<dyn HealthChecker> {
        Box::new(HttpProbe::new(self.replace_host(ip)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_host_swaps_only_the_host_component() {
        let probe = HttpProbe::new("http://10.0.0.1:8080/healthz".to_string());
        assert_eq!(probe.replace_host(Ipv4Addr::new(10, 0, 0, 9)), "http://10.0.0.9:8080/healthz");
    }

    #[tokio::test]
    async fn probe_reports_non_success_status_as_unhealthy() {
        let mock = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&mock)
            .await;
        let probe = HttpProbe::new(mock.uri());
        assert!(!probe.probe().await);
    }

    #[tokio::test]
    async fn probe_reports_success_status_as_healthy() {
        let mock = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&mock)
            .await;
        let probe = HttpProbe::new(mock.uri());
        assert!(probe.probe().await);
    }
}
