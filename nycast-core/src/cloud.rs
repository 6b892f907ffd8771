//! The cloud route-table control plane as a trait object.
//!
//! Grounded on `aws/route_table_manager.go`'s `EC2API` interface: each
//! method here is one AWS SDK call's worth of contract, no more. Wire
//! details (request signing, pagination, retries) belong to whatever
//! implements this trait in `nycast-agent`; spec §1 treats them as an
//! external collaborator.

use crate::error::CloudError;
use crate::models::{CloudRouteTable, InstanceStatus, NetworkInterface};
use async_trait::async_trait;
use dashmap::DashMap;
use ipnetwork::IpNetwork;

#[async_trait]
pub trait RouteTableApi: Send + Sync {
    async fn describe_route_tables(&self) -> Result<Vec<CloudRouteTable>, CloudError>;

    async fn create_route(
        &self,
        route_table_id: &str,
        cidr: IpNetwork,
        instance_id: &str,
        noop: bool,
    ) -> Result<(), CloudError>;

    async fn replace_route(
        &self,
        route_table_id: &str,
        cidr: IpNetwork,
        network_interface_id: &str,
        noop: bool,
    ) -> Result<(), CloudError>;

    async fn delete_route(&self, route_table_id: &str, cidr: IpNetwork, noop: bool) -> Result<(), CloudError>;

    /// All network interfaces currently attached to `instance_id`.
    async fn describe_network_interfaces_for_instance(&self, instance_id: &str) -> Result<Vec<NetworkInterface>, CloudError>;

    /// Network interfaces by id, used to resolve an ENI to its private IP
    /// for remote healthchecks.
    async fn describe_network_interfaces(&self, ids: &[String]) -> Result<Vec<NetworkInterface>, CloudError>;

    /// `None` means the instance had no status entry at all (the Go
    /// source treats this as "assume terminated").
    async fn describe_instance_status(&self, instance_id: &str) -> Result<Option<InstanceStatus>, CloudError>;
}

/// Find the network interface on `instance_id` with source/destination
/// checking disabled: the NAT instance's router NIC.
///
/// Grounded on `routerInterface()`: the first matching interface wins,
/// there is no tie-breaking among multiple candidates.
pub async fn router_interface(api: &dyn RouteTableApi, instance_id: &str) -> Result<String, CloudError> {
    let nics = api.describe_network_interfaces_for_instance(instance_id).await?;
    nics.into_iter()
        .find(|nic| !nic.source_dest_check)
        .map(|nic| nic.network_interface_id)
        .ok_or_else(|| CloudError::NoRouterNic {
            instance_id: instance_id.to_string(),
        })
}

/// Caches `InstanceIsRouter` results. Grounded on
/// `RouteTableManagerEC2.srcdstcheckForInstance`: a *positive* result is
/// permanent (an instance's router NIC doesn't change once it's set up),
/// but a negative result is never cached, since the instance could still
/// become a router later (open question, resolved in DESIGN.md).
pub struct InstanceRouterCache {
    positive: DashMap<String, ()>,
}

impl InstanceRouterCache {
    pub fn new() -> Self {
        InstanceRouterCache {
            positive: DashMap::new(),
        }
    }

    pub async fn is_router(&self, api: &dyn RouteTableApi, instance_id: &str) -> Result<bool, CloudError> {
        if self.positive.contains_key(instance_id) {
            return Ok(true);
        }
        match router_interface(api, instance_id).await {
            Ok(_) => {
                self.positive.insert(instance_id.to_string(), ());
                Ok(true)
            }
            Err(CloudError::NoRouterNic { .. }) => Ok(false),
            Err(other) => Err(other),
        }
    }
}

impl Default for InstanceRouterCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeRouteTableApi;

    #[tokio::test]
    async fn router_interface_finds_nic_with_src_dst_check_disabled() {
        let api = FakeRouteTableApi::new();
        api.set_network_interfaces(
            "i-router",
            vec![
                NetworkInterface {
                    network_interface_id: "eni-0".to_string(),
                    attached_instance_id: Some("i-router".to_string()),
                    private_ipv4: "10.0.0.1".parse().unwrap(),
                    source_dest_check: true,
                },
                NetworkInterface {
                    network_interface_id: "eni-1".to_string(),
                    attached_instance_id: Some("i-router".to_string()),
                    private_ipv4: "10.0.0.2".parse().unwrap(),
                    source_dest_check: false,
                },
            ],
        );
        let nic = router_interface(&api, "i-router").await.unwrap();
        assert_eq!(nic, "eni-1");
    }

    #[tokio::test]
    async fn router_interface_errors_when_no_nic_qualifies() {
        let api = FakeRouteTableApi::new();
        api.set_network_interfaces("i-plain", vec![]);
        let err = router_interface(&api, "i-plain").await.unwrap_err();
        assert!(matches!(err, CloudError::NoRouterNic { .. }));
    }

    #[tokio::test]
    async fn router_cache_remembers_positive_results_only() {
        let api = FakeRouteTableApi::new();
        api.set_network_interfaces("i-plain", vec![]);
        let cache = InstanceRouterCache::new();

        assert!(!cache.is_router(&api, "i-plain").await.unwrap());

        api.set_network_interfaces(
            "i-plain",
            vec![NetworkInterface {
                network_interface_id: "eni-9".to_string(),
                attached_instance_id: Some("i-plain".to_string()),
                private_ipv4: "10.0.0.9".parse().unwrap(),
                source_dest_check: false,
            }],
        );
        assert!(cache.is_router(&api, "i-plain").await.unwrap());

        api.set_network_interfaces("i-plain", vec![]);
        assert!(cache.is_router(&api, "i-plain").await.unwrap(), "positive result must stick even if the underlying state changes");
    }
}
