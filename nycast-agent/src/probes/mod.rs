//! Concrete `HealthChecker` implementations: the probe protocols spec §1
//! calls out as external modules satisfying the `HealthChecker`
//! contract.

pub mod http;
pub mod ping;
pub mod tcp;

use nycast_core::healthcheck::{HealthcheckConfig, HealthcheckRegistry};

/// Register every built-in probe type. Called once at daemon startup;
/// the registry is then read-only for the life of the process (spec §5).
pub fn register_builtin_probes(registry: &mut HealthcheckRegistry) {
    registry.register("tcp", |config: &HealthcheckConfig| Box::new(tcp::TcpProbe::new(config.destination.clone())));
    registry.register("http", |config: &HealthcheckConfig| Box::new(http::HttpProbe::new(config.destination.clone())));
    registry.register("ping", |config: &HealthcheckConfig| Box::new(ping::PingProbe::new(config.destination.clone())));
}
