//! TCP-connect healthcheck: healthy if a TCP handshake to
//! `destination` (`host:port`) completes before `every` elapses.

use async_trait::async_trait;
use nycast_core::healthcheck::HealthChecker;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::TcpStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TcpProbe {
    destination: String,
}

impl TcpProbe {
    pub fn new(destination: String) -> Self {
        TcpProbe { destination }
    }

    fn port(&self) -> Option<u16> {
        self.destination.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
    }
}

#[async_trait]
impl HealthChecker for TcpProbe {
    async fn probe(&self) -> bool {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.destination)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                tracing::trace!(destination = %self.destination, error = %e, "tcp probe failed");
                false
            }
            Err(_) => {
                tracing::trace!(destination = %self.destination, "tcp probe timed out");
                false
            }
        }
    }

    fn new_with_destination(&self, ip: Ipv4Addr) -> Box<dyn HealthChecker> {
        let destination = match self.port() {
            Some(port) => format!("{ip}:{port}"),
            None => ip.to_string(),
        };
        Box::new(TcpProbe::new(destination))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_is_parsed_from_destination() {
        let probe = TcpProbe::new("10.0.0.1:22".to_string());
        assert_eq!(probe.port(), Some(22));
    }

    #[tokio::test]
    async fn probe_succeeds_against_a_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        let probe = TcpProbe::new(format!("127.0.0.1:{port}"));
        assert!(probe.probe().await);
    }

    #[tokio::test]
    async fn probe_fails_against_a_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let probe = TcpProbe::new(format!("127.0.0.1:{port}"));
        assert!(!probe.probe().await);
    }

    #[tokio::test]
    async fn new_with_destination_preserves_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        let template = TcpProbe::new(format!("0.0.0.0:{port}"));
        let probe = template.new_with_destination(Ipv4Addr::new(127, 0, 0, 1));
        assert!(probe.probe().await);
    }
}
