//! Instance identity, resolved once at bootstrap and treated as immutable
//! thereafter (spec §3).

use async_trait::async_trait;
use std::net::Ipv4Addr;

/// Identity of the host the agent runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceMetadata {
    pub instance_id: String,
    pub availability_zone: String,
    /// Derived from `availability_zone` by stripping its trailing letter.
    pub region: String,
    pub primary_mac: String,
    pub primary_ipv4: Ipv4Addr,
    pub primary_subnet_id: String,
}

/// The narrow surface the agent needs from an instance-metadata service.
///
/// Implementations of the actual HTTP calls (IMDS, or an equivalent on
/// other clouds) are an external collaborator per spec §1; this trait is
/// the only thing `nycast-core` depends on.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    /// True once the metadata service can be reached at all.
    async fn available(&self) -> bool;

    /// Fetch a single metadata key, e.g. `"instance-id"` or
    /// `"placement/availability-zone"`.
    async fn get(&self, key: &str) -> Result<String, String>;
}

/// Derive the region from an availability zone by stripping the trailing
/// letter (`us-east-1a` -> `us-east-1`).
pub fn region_from_az(az: &str) -> String {
    let mut chars = az.chars();
    chars.next_back();
    chars.as_str().to_string()
}

/// Run the bootstrap sequence described in spec §4.6: wait for the
/// metadata service, then pull each of the five keys the agent needs.
pub async fn fetch_metadata(fetcher: &dyn MetadataFetcher) -> Result<InstanceMetadata, String> {
    if !fetcher.available().await {
        return Err("instance metadata service is not available".to_string());
    }
    let availability_zone = fetcher.get("placement/availability-zone").await?;
    let instance_id = fetcher.get("instance-id").await?;
    let primary_mac = fetcher.get("mac").await?;
    let local_ipv4 = fetcher.get("local-ipv4").await?;
    let primary_subnet_id = fetcher
        .get(&format!("network/interfaces/macs/{primary_mac}/subnet-id"))
        .await?;
    let primary_ipv4: Ipv4Addr = local_ipv4
        .parse()
        .map_err(|e| format!("could not parse local-ipv4 '{local_ipv4}': {e}"))?;
    let region = region_from_az(&availability_zone);

    Ok(InstanceMetadata {
        instance_id,
        availability_zone,
        region,
        primary_mac,
        primary_ipv4,
        primary_subnet_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_region_from_az() {
        assert_eq!(region_from_az("us-east-1a"), "us-east-1");
        assert_eq!(region_from_az("eu-west-2b"), "eu-west-2");
    }

    struct FakeFetcher {
        values: std::collections::HashMap<&'static str, &'static str>,
    }

    #[async_trait]
    impl MetadataFetcher for FakeFetcher {
        async fn available(&self) -> bool {
            true
        }

        async fn get(&self, key: &str) -> Result<String, String> {
            self.values
                .get(key)
                .map(|v| v.to_string())
                .ok_or_else(|| format!("no such key {key}"))
        }
    }

    #[tokio::test]
    async fn fetch_metadata_assembles_instance_metadata() {
        let fetcher = FakeFetcher {
            values: [
                ("placement/availability-zone", "us-east-1a"),
                ("instance-id", "i-1234"),
                ("mac", "0a:1b:2c:3d:4e:5f"),
                ("local-ipv4", "10.0.0.5"),
                (
                    "network/interfaces/macs/0a:1b:2c:3d:4e:5f/subnet-id",
                    "subnet-abc",
                ),
            ]
            .into_iter()
            .collect(),
        };

        let meta = fetch_metadata(&fetcher).await.unwrap();
        assert_eq!(meta.instance_id, "i-1234");
        assert_eq!(meta.region, "us-east-1");
        assert_eq!(meta.primary_ipv4, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(meta.primary_subnet_id, "subnet-abc");
    }

    struct UnavailableFetcher;

    #[async_trait]
    impl MetadataFetcher for UnavailableFetcher {
        async fn available(&self) -> bool {
            false
        }
        async fn get(&self, _key: &str) -> Result<String, String> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn fetch_metadata_fails_fast_when_unavailable() {
        let err = fetch_metadata(&UnavailableFetcher).await.unwrap_err();
        assert!(err.contains("not available"));
    }
}
