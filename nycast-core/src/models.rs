//! Plain data types describing cloud route-table state.
//!
//! These mirror what a real cloud SDK's `DescribeRouteTables` response
//! would hand back; the agent only reads these shapes, it never
//! constructs a `CloudRoute` beyond what a create/replace call requires.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which kind of next-hop a route currently points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextHop {
    Gateway(String),
    Instance(String),
    NetworkInterface(String),
}

impl NextHop {
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            NextHop::Instance(id) => Some(id),
            _ => None,
        }
    }

    pub fn network_interface_id(&self) -> Option<&str> {
        match self {
            NextHop::NetworkInterface(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(self, NextHop::Gateway(_))
    }
}

/// Whether a route is actively forwarding traffic or has gone to blackhole
/// (its next-hop resource was terminated/detached).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteState {
    Active,
    Blackhole,
}

impl RouteState {
    pub fn is_active(&self) -> bool {
        matches!(self, RouteState::Active)
    }
}

/// One row in a cloud route table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudRoute {
    pub destination: IpNetwork,
    pub state: RouteState,
    pub next_hop: NextHop,
}

/// A route table association to a subnet, or a flag marking the table as
/// a VPC's main table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTableAssociation {
    pub subnet_id: Option<String>,
    pub main: bool,
}

/// A concrete cloud route table as returned by `DescribeRouteTables`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudRouteTable {
    pub route_table_id: String,
    pub vpc_id: String,
    pub tags: HashMap<String, String>,
    pub associations: Vec<RouteTableAssociation>,
    pub routes: Vec<CloudRoute>,
}

impl CloudRouteTable {
    /// The route whose destination exactly equals `cidr`, if any.
    ///
    /// Grounded on `aws/route_table_manager.go`'s `findRouteFromRouteTable`:
    /// destinations are compared for exact equality, not overlap.
    pub fn find_route(&self, cidr: &IpNetwork) -> Option<&CloudRoute> {
        self.routes.iter().find(|r| &r.destination == cidr)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|s| s.as_str())
    }

    pub fn is_main(&self) -> bool {
        self.associations.iter().any(|a| a.main)
    }

    pub fn is_associated_with_subnet(&self, subnet_id: &str) -> bool {
        self.associations
            .iter()
            .any(|a| a.subnet_id.as_deref() == Some(subnet_id))
    }
}

/// Per-instance health summary, as returned by `DescribeInstanceStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryStatus {
    Ok,
    Impaired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance_status: SummaryStatus,
    pub system_status: SummaryStatus,
}

impl InstanceStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self.instance_status, SummaryStatus::Ok) && matches!(self.system_status, SummaryStatus::Ok)
    }
}

/// A network interface as returned by `DescribeNetworkInterfaces`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub network_interface_id: String,
    pub attached_instance_id: Option<String>,
    pub private_ipv4: std::net::Ipv4Addr,
    pub source_dest_check: bool,
}
