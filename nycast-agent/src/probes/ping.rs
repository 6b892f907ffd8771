//! ICMP healthcheck. Shells out to the system `ping` binary rather than
//! opening a raw socket: nothing in the dependency stack speaks ICMP,
//! and a single `ping -c1` round trip is the same external-process
//! pattern already used for the route hooks.

use async_trait::async_trait;
use nycast_core::healthcheck::HealthChecker;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::process::Command;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PingProbe {
    destination: String,
}

impl PingProbe {
    pub fn new(destination: String) -> Self {
        PingProbe { destination }
    }
}

#[async_trait]
impl HealthChecker for PingProbe {
    async fn probe(&self) -> bool {
        let status = Command::new("ping")
            .arg("-c1")
            .arg("-W1")
            .arg(&self.destination)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();

        match tokio::time::timeout(PING_TIMEOUT, status).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::trace!(destination = %self.destination, error = %e, "ping probe failed to spawn");
                false
            }
            Err(_) => {
                tracing::trace!(destination = %self.destination, "ping probe timed out");
                false
            }
        }
    }

    fn new_with_destination(&self, ip: Ipv4Addr) -> Box<dyn HealthChecker> {
        Box::new(PingProbe::new(ip.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_with_destination_swaps_the_target_address() {
        let probe = PingProbe::new("10.0.0.1".to_string());
        let swapped = probe.new_with_destination(Ipv4Addr::new(10, 0, 0, 2));
        let _: Box<dyn HealthChecker> = swapped;
    }

    #[tokio::test]
    async fn probe_fails_for_an_unroutable_address() {
        let probe = PingProbe::new("198.51.100.1".to_string());
        assert!(!probe.probe().await);
    }
}
