//! Network-interface-id to private-IP cache used by the remote
//! healthcheck dispatcher.
//!
//! Grounded on the Go source's package-level `eniToIP map[string]string`
//! in `aws/manage_route_spec.go`: an ENI's private IP never changes for
//! the lifetime of the interface, so once resolved an entry is never
//! invalidated, only ever added to.

use crate::cloud::RouteTableApi;
use crate::error::CloudError;
use dashmap::DashMap;
use std::net::Ipv4Addr;

pub struct EniCache {
    ips: DashMap<String, Ipv4Addr>,
}

impl EniCache {
    pub fn new() -> Self {
        EniCache { ips: DashMap::new() }
    }

    pub fn get(&self, eni_id: &str) -> Option<Ipv4Addr> {
        self.ips.get(eni_id).map(|v| *v)
    }

    /// Resolve every id in `eni_ids` not already cached, via a single
    /// batched `DescribeNetworkInterfaces` call, and return the full
    /// id -> ip mapping for the requested ids (including ones that were
    /// already cached).
    pub async fn resolve(&self, api: &dyn RouteTableApi, eni_ids: &[String]) -> Result<Vec<(String, Ipv4Addr)>, CloudError> {
        let to_fetch: Vec<String> = eni_ids.iter().filter(|id| !self.ips.contains_key(*id)).cloned().collect();
        if !to_fetch.is_empty() {
            let nics = api.describe_network_interfaces(&to_fetch).await?;
            for nic in nics {
                self.ips.insert(nic.network_interface_id, nic.private_ipv4);
            }
        }
        Ok(eni_ids.iter().filter_map(|id| self.ips.get(id).map(|ip| (id.clone(), *ip))).collect())
    }
}

impl Default for EniCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeRouteTableApi;
    use crate::models::NetworkInterface;

    fn nic(id: &str, ip: &str) -> NetworkInterface {
        NetworkInterface {
            network_interface_id: id.to_string(),
            attached_instance_id: None,
            private_ipv4: ip.parse().unwrap(),
            source_dest_check: false,
        }
    }

    #[tokio::test]
    async fn resolve_fetches_unknown_ids_and_caches_them() {
        let api = FakeRouteTableApi::new();
        api.set_interface_by_id(nic("eni-1", "10.0.0.1"));
        let cache = EniCache::new();

        let resolved = cache.resolve(&api, &["eni-1".to_string()]).await.unwrap();
        assert_eq!(resolved, vec![("eni-1".to_string(), Ipv4Addr::new(10, 0, 0, 1))]);
        assert_eq!(cache.get("eni-1"), Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[tokio::test]
    async fn resolve_does_not_refetch_already_cached_ids() {
        let api = FakeRouteTableApi::new();
        api.set_interface_by_id(nic("eni-1", "10.0.0.1"));
        let cache = EniCache::new();
        cache.resolve(&api, &["eni-1".to_string()]).await.unwrap();

        api.set_interface_by_id(nic("eni-1", "10.9.9.9"));
        let resolved = cache.resolve(&api, &["eni-1".to_string()]).await.unwrap();
        assert_eq!(resolved[0].1, Ipv4Addr::new(10, 0, 0, 1), "cached ip must not be overwritten");
    }

    #[tokio::test]
    async fn resolve_skips_ids_that_cannot_be_found() {
        let api = FakeRouteTableApi::new();
        let cache = EniCache::new();
        let resolved = cache.resolve(&api, &["eni-missing".to_string()]).await.unwrap();
        assert!(resolved.is_empty());
    }
}
