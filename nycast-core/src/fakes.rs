//! In-process test doubles for `nycast-core`'s external traits.
//!
//! Grounded on the teacher SDK's habit of keeping fakes next to the
//! trait they stand in for rather than in a separate test crate (see
//! `ultrafast-models-sdk/src/providers/custom.rs`'s test module). Only
//! compiled under `#[cfg(test)]` and for other crates in this workspace
//! that enable the `test-support` feature, so `nycast-agent`'s tests can
//! reuse it instead of reimplementing a second fake.

use crate::cloud::RouteTableApi;
use crate::error::CloudError;
use crate::metadata::MetadataFetcher;
use crate::models::{CloudRoute, CloudRouteTable, InstanceStatus, NetworkInterface, NextHop, RouteState};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::sync::Mutex;

/// An in-memory stand-in for a cloud route-table API. Mutating calls
/// (`create_route`/`replace_route`/`delete_route`) apply directly to the
/// stored tables so a reconciler test can assert on resulting state
/// rather than on call arguments alone, but every call is also recorded
/// in `calls()` for tests that care about the exact operation taken (or
/// not taken).
pub struct FakeRouteTableApi {
    tables: Mutex<Vec<CloudRouteTable>>,
    interfaces_by_instance: Mutex<HashMap<String, Vec<NetworkInterface>>>,
    interfaces_by_id: Mutex<HashMap<String, NetworkInterface>>,
    instance_status: Mutex<HashMap<String, InstanceStatus>>,
    calls: Mutex<Vec<String>>,
    fail_next_describe_status: Mutex<bool>,
}

impl FakeRouteTableApi {
    pub fn new() -> Self {
        FakeRouteTableApi {
            tables: Mutex::new(Vec::new()),
            interfaces_by_instance: Mutex::new(HashMap::new()),
            interfaces_by_id: Mutex::new(HashMap::new()),
            instance_status: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_next_describe_status: Mutex::new(false),
        }
    }

    pub fn set_tables(&self, tables: Vec<CloudRouteTable>) {
        *self.tables.lock().unwrap() = tables;
    }

    pub fn table(&self, route_table_id: &str) -> Option<CloudRouteTable> {
        self.tables.lock().unwrap().iter().find(|t| t.route_table_id == route_table_id).cloned()
    }

    pub fn set_network_interfaces(&self, instance_id: &str, nics: Vec<NetworkInterface>) {
        let mut by_id = self.interfaces_by_id.lock().unwrap();
        for nic in &nics {
            by_id.insert(nic.network_interface_id.clone(), nic.clone());
        }
        self.interfaces_by_instance.lock().unwrap().insert(instance_id.to_string(), nics);
    }

    pub fn set_interface_by_id(&self, nic: NetworkInterface) {
        self.interfaces_by_id.lock().unwrap().insert(nic.network_interface_id.clone(), nic);
    }

    pub fn set_instance_status(&self, instance_id: &str, status: InstanceStatus) {
        self.instance_status.lock().unwrap().insert(instance_id.to_string(), status);
    }

    pub fn clear_instance_status(&self, instance_id: &str) {
        self.instance_status.lock().unwrap().remove(instance_id);
    }

    pub fn fail_next_describe_instance_status(&self) {
        *self.fail_next_describe_status.lock().unwrap() = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

impl Default for FakeRouteTableApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouteTableApi for FakeRouteTableApi {
    async fn describe_route_tables(&self) -> Result<Vec<CloudRouteTable>, CloudError> {
        Ok(self.tables.lock().unwrap().clone())
    }

    async fn create_route(&self, route_table_id: &str, cidr: IpNetwork, instance_id: &str, noop: bool) -> Result<(), CloudError> {
        self.record(format!("create_route:{route_table_id}:{cidr}:{instance_id}:noop={noop}"));
        if noop {
            return Ok(());
        }
        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .iter_mut()
            .find(|t| t.route_table_id == route_table_id)
            .ok_or_else(|| CloudError::Api {
                operation: "create_route".to_string(),
                message: format!("no such route table {route_table_id}"),
            })?;
        table.routes.push(CloudRoute {
            destination: cidr,
            state: RouteState::Active,
            next_hop: NextHop::Instance(instance_id.to_string()),
        });
        Ok(())
    }

    async fn replace_route(&self, route_table_id: &str, cidr: IpNetwork, network_interface_id: &str, noop: bool) -> Result<(), CloudError> {
        self.record(format!("replace_route:{route_table_id}:{cidr}:{network_interface_id}:noop={noop}"));
        if noop {
            return Ok(());
        }
        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .iter_mut()
            .find(|t| t.route_table_id == route_table_id)
            .ok_or_else(|| CloudError::Api {
                operation: "replace_route".to_string(),
                message: format!("no such route table {route_table_id}"),
            })?;
        if let Some(route) = table.routes.iter_mut().find(|r| r.destination == cidr) {
            route.state = RouteState::Active;
            route.next_hop = NextHop::NetworkInterface(network_interface_id.to_string());
        }
        Ok(())
    }

    async fn delete_route(&self, route_table_id: &str, cidr: IpNetwork, noop: bool) -> Result<(), CloudError> {
        self.record(format!("delete_route:{route_table_id}:{cidr}:noop={noop}"));
        if noop {
            return Ok(());
        }
        let mut tables = self.tables.lock().unwrap();
        if let Some(table) = tables.iter_mut().find(|t| t.route_table_id == route_table_id) {
            table.routes.retain(|r| r.destination != cidr);
        }
        Ok(())
    }

    async fn describe_network_interfaces_for_instance(&self, instance_id: &str) -> Result<Vec<NetworkInterface>, CloudError> {
        Ok(self.interfaces_by_instance.lock().unwrap().get(instance_id).cloned().unwrap_or_default())
    }

    async fn describe_network_interfaces(&self, ids: &[String]) -> Result<Vec<NetworkInterface>, CloudError> {
        let by_id = self.interfaces_by_id.lock().unwrap();
        Ok(ids.iter().filter_map(|id| by_id.get(id).cloned()).collect())
    }

    async fn describe_instance_status(&self, instance_id: &str) -> Result<Option<InstanceStatus>, CloudError> {
        let mut should_fail = self.fail_next_describe_status.lock().unwrap();
        if *should_fail {
            *should_fail = false;
            return Err(CloudError::Api {
                operation: "describe_instance_status".to_string(),
                message: "simulated failure".to_string(),
            });
        }
        Ok(self.instance_status.lock().unwrap().get(instance_id).copied())
    }
}

/// A scripted instance-metadata fetcher for bootstrap tests.
pub struct FakeMetadataFetcher {
    available: bool,
    values: HashMap<String, String>,
}

impl FakeMetadataFetcher {
    pub fn new(values: HashMap<String, String>) -> Self {
        FakeMetadataFetcher { available: true, values }
    }

    pub fn unavailable() -> Self {
        FakeMetadataFetcher {
            available: false,
            values: HashMap::new(),
        }
    }
}

#[async_trait]
impl MetadataFetcher for FakeMetadataFetcher {
    async fn available(&self) -> bool {
        self.available
    }

    async fn get(&self, key: &str) -> Result<String, String> {
        self.values.get(key).cloned().ok_or_else(|| format!("no such metadata key {key}"))
    }
}
