//! The reconciliation decision engine: one cloud route table crossed with
//! one validated route spec produces exactly one [`Action`].
//!
//! Grounded on `aws/route_table_manager.go`'s `ManageInstanceRoute` /
//! `ReplaceInstanceRoute`; the decision and its side effect are kept
//! separate (`decide` vs `apply`) the way `circuit_breaker.rs`'s
//! `CircuitBreaker::call` separates state evaluation from the call it
//! guards, so a test can assert on the decision alone.

use crate::cloud::{router_interface, RouteTableApi};
use crate::error::ReconcileError;
use crate::healthcheck::Healthcheck;
use crate::models::{CloudRouteTable, NextHop};
use crate::route_spec::ValidatedRouteSpec;
use std::sync::Arc;

/// What the reconciler decided to do for one `(table, spec)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Create,
    Replace,
    Delete,
    Noop { reason: NoopReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoopReason {
    /// No existing route, and the local healthcheck isn't healthy yet.
    CreateBlockedByUnhealthyLocalCheck { can_pass_yet: bool },
    /// Route already points at us and nothing is failing.
    AlreadyOursAndHealthy,
    /// Route is ours, local healthcheck failed, but `never_delete` is set.
    NeverDelete,
    /// `if_unhealthy` gate: a remote healthcheck reports the incumbent healthy.
    IncumbentVerifiedByRemoteHealthcheck,
    /// `if_unhealthy` gate: cloud instance status reports the incumbent healthy.
    IncumbentInstanceStatusOk,
    /// Cloud instance status could not be determined; conservative no-op.
    StatusQueryFailed,
    /// A replace was about to happen, but our own local healthcheck is failing.
    LocalHealthcheckFailing,
}

/// What a remote healthcheck (keyed by the incumbent's resolved peer IP)
/// currently reports, as seen by the caller orchestrating one reconcile
/// pass. Resolving a route's next-hop ENI to an IP and looking up the
/// tracked healthcheck for it is the caller's job (it needs the ENI
/// cache and the spec's [`crate::remote_healthcheck::RemoteHealthcheckDispatcher`],
/// neither of which the decision engine itself needs to know about).
#[derive(Debug, Clone, Copy)]
pub struct RemoteHealthcheckStatus {
    pub healthy: bool,
    pub can_pass_yet: bool,
}

pub struct Reconciler {
    api: Arc<dyn RouteTableApi>,
}

impl Reconciler {
    pub fn new(api: Arc<dyn RouteTableApi>) -> Self {
        Reconciler { api }
    }

    /// Decide and apply in one step, returning the action taken so a
    /// caller can log or assert on it without re-deriving it from API
    /// call traces.
    pub async fn reconcile(
        &self,
        table: &CloudRouteTable,
        spec: &ValidatedRouteSpec,
        local_hc: Option<&Healthcheck>,
        remote_hc: Option<RemoteHealthcheckStatus>,
        noop: bool,
    ) -> Result<Action, ReconcileError> {
        let action = self.decide(table, spec, local_hc, remote_hc).await?;
        self.apply(table, spec, &action, noop).await?;
        Ok(action)
    }

    async fn decide(
        &self,
        table: &CloudRouteTable,
        spec: &ValidatedRouteSpec,
        local_hc: Option<&Healthcheck>,
        remote_hc: Option<RemoteHealthcheckStatus>,
    ) -> Result<Action, ReconcileError> {
        let existing = table.find_route(&spec.cidr);

        let action = match existing {
            None => match local_hc {
                None => Action::Create,
                Some(hc) if hc.is_healthy().await => Action::Create,
                Some(hc) => Action::Noop {
                    reason: NoopReason::CreateBlockedByUnhealthyLocalCheck {
                        can_pass_yet: hc.can_pass_yet().await,
                    },
                },
            },
            Some(route) => {
                let current_instance = self.resolve_current_instance(&route.next_hop).await;
                if current_instance.as_deref() == Some(spec.instance_id.as_str()) {
                    match local_hc {
                        Some(hc) if !hc.is_healthy().await && hc.can_pass_yet().await => {
                            if spec.never_delete {
                                Action::Noop { reason: NoopReason::NeverDelete }
                            } else {
                                Action::Delete
                            }
                        }
                        _ => Action::Noop { reason: NoopReason::AlreadyOursAndHealthy },
                    }
                } else if !spec.if_unhealthy {
                    Action::Replace
                } else if route.state.is_active() {
                    if spec.remote_healthcheck_name.is_some() {
                        let remote_says_replace =
                            matches!(remote_hc, Some(status) if status.can_pass_yet && !status.healthy);
                        if !remote_says_replace {
                            Action::Noop { reason: NoopReason::IncumbentVerifiedByRemoteHealthcheck }
                        } else {
                            self.decide_by_instance_status(current_instance.as_deref()).await?
                        }
                    } else {
                        self.decide_by_instance_status(current_instance.as_deref()).await?
                    }
                } else {
                    Action::Replace
                }
            }
        };

        Ok(self.suppress_replace_if_local_unhealthy(action, local_hc).await)
    }

    /// Resolve the instance that currently owns a route's next hop.
    ///
    /// `NextHop::Instance` already names the instance directly. After a
    /// `Replace`, though, the next hop becomes `NextHop::NetworkInterface`
    /// (the API only takes an ENI id for that call), and without
    /// resolving it back to an instance the "already ours" comparison
    /// below would never match again on a later reconcile, firing
    /// `Replace` on every pass instead of settling into a no-op once the
    /// takeover has actually happened.
    async fn resolve_current_instance(&self, next_hop: &NextHop) -> Option<String> {
        match next_hop {
            NextHop::Instance(id) => Some(id.clone()),
            NextHop::NetworkInterface(nic_id) => {
                match self.api.describe_network_interfaces(std::slice::from_ref(nic_id)).await {
                    Ok(nics) => nics.into_iter().find(|n| &n.network_interface_id == nic_id).and_then(|n| n.attached_instance_id),
                    Err(e) => {
                        tracing::warn!(error = %e, nic_id, "describe_network_interfaces failed while resolving current route owner");
                        None
                    }
                }
            }
            NextHop::Gateway(_) => None,
        }
    }

    async fn decide_by_instance_status(&self, instance_id: Option<&str>) -> Result<Action, ReconcileError> {
        let Some(instance_id) = instance_id else {
            return Ok(Action::Noop { reason: NoopReason::StatusQueryFailed });
        };
        match self.api.describe_instance_status(instance_id).await {
            Err(e) => {
                tracing::warn!(error = %e, instance_id, "describe_instance_status failed, degrading to no-op");
                Ok(Action::Noop { reason: NoopReason::StatusQueryFailed })
            }
            Ok(Some(status)) if status.is_healthy() => Ok(Action::Noop { reason: NoopReason::IncumbentInstanceStatusOk }),
            Ok(_) => Ok(Action::Replace),
        }
    }

    async fn suppress_replace_if_local_unhealthy(&self, action: Action, local_hc: Option<&Healthcheck>) -> Action {
        if !matches!(action, Action::Replace) {
            return action;
        }
        if let Some(hc) = local_hc {
            if !hc.is_healthy().await && hc.can_pass_yet().await {
                return Action::Noop { reason: NoopReason::LocalHealthcheckFailing };
            }
        }
        action
    }

    async fn apply(&self, table: &CloudRouteTable, spec: &ValidatedRouteSpec, action: &Action, noop: bool) -> Result<(), ReconcileError> {
        match action {
            Action::Create => {
                self.api.create_route(&table.route_table_id, spec.cidr, &spec.instance_id, noop).await?;
            }
            Action::Replace => {
                run_hooks(&spec.run_before_replace_route).await;
                let nic = router_interface(&*self.api, &spec.instance_id).await?;
                self.api.replace_route(&table.route_table_id, spec.cidr, &nic, noop).await?;
                run_hooks(&spec.run_after_replace_route).await;
            }
            Action::Delete => {
                run_hooks(&spec.run_before_delete_route).await;
                self.api.delete_route(&table.route_table_id, spec.cidr, noop).await?;
                run_hooks(&spec.run_after_delete_route).await;
            }
            Action::Noop { .. } => {}
        }
        Ok(())
    }
}

/// Run an external-command hook. Hook failure (non-zero exit, or the
/// program not existing at all) is logged at debug level and never
/// propagated (spec §4.3).
async fn run_hooks(cmd: &[String]) {
    let Some((program, args)) = cmd.split_first() else {
        return;
    };
    match tokio::process::Command::new(program).args(args).status().await {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::debug!(?status, program, "hook exited non-zero"),
        Err(e) => tracing::debug!(error = %e, program, "hook failed to run"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeRouteTableApi;
    use crate::healthcheck::{HealthcheckConfig, HealthChecker};
    use crate::models::{CloudRoute, InstanceStatus, NextHop, RouteState, RouteTableAssociation, SummaryStatus};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::time::Duration;

    fn table(route_table_id: &str, routes: Vec<CloudRoute>) -> CloudRouteTable {
        CloudRouteTable {
            route_table_id: route_table_id.to_string(),
            vpc_id: "vpc-1".to_string(),
            tags: HashMap::new(),
            associations: vec![RouteTableAssociation { subnet_id: None, main: true }],
            routes,
        }
    }

    fn spec(instance_id: &str) -> ValidatedRouteSpec {
        ValidatedRouteSpec {
            cidr: ipnetwork::IpNetwork::from_str("0.0.0.0/0").unwrap(),
            instance_id: instance_id.to_string(),
            instance_is_self: true,
            healthcheck_name: None,
            remote_healthcheck_name: None,
            if_unhealthy: false,
            never_delete: false,
            run_before_replace_route: Vec::new(),
            run_after_replace_route: Vec::new(),
            run_before_delete_route: Vec::new(),
            run_after_delete_route: Vec::new(),
        }
    }

    struct ScriptedChecker(std::sync::Arc<std::sync::atomic::AtomicBool>);

    #[async_trait]
    impl HealthChecker for ScriptedChecker {
        async fn probe(&self) -> bool {
            self.0.load(std::sync::atomic::Ordering::SeqCst)
        }
        fn new_with_destination(&self, _ip: Ipv4Addr) -> Box<dyn HealthChecker> {
            Box::new(ScriptedChecker(self.0.clone()))
        }
    }

    async fn healthcheck_in_state(healthy: bool, can_pass_yet: bool) -> Healthcheck {
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(healthy));
        let config = HealthcheckConfig {
            type_: "scripted".to_string(),
            destination: "0.0.0.0".to_string(),
            every: Duration::from_secs(3600),
            rise: 1,
            fall: 1,
        };
        let mut hc = Healthcheck::from_checker("test", config, Box::new(ScriptedChecker(flag)));
        if can_pass_yet || healthy {
            // drive one probe synchronously through the internal state by running once.
            hc.run(false);
            tokio::time::sleep(Duration::from_millis(5)).await;
            hc.stop();
        }
        hc
    }

    #[tokio::test]
    async fn e1_creates_route_when_none_exists() {
        let api = std::sync::Arc::new(FakeRouteTableApi::new());
        api.set_tables(vec![table("rtb-1", vec![])]);
        let reconciler = Reconciler::new(api.clone());
        let t = api.table("rtb-1").unwrap();
        let action = reconciler.reconcile(&t, &spec("i-self"), None, None, false).await.unwrap();
        assert_eq!(action, Action::Create);
        assert!(api.calls().iter().any(|c| c.starts_with("create_route:rtb-1")));
    }

    #[tokio::test]
    async fn e2_anycast_takeover_replaces_healthy_incumbent() {
        let api = std::sync::Arc::new(FakeRouteTableApi::new());
        api.set_tables(vec![table(
            "rtb-1",
            vec![CloudRoute {
                destination: ipnetwork::IpNetwork::from_str("0.0.0.0/0").unwrap(),
                state: RouteState::Active,
                next_hop: NextHop::Instance("i-other".to_string()),
            }],
        )]);
        api.set_network_interfaces(
            "i-self",
            vec![crate::models::NetworkInterface {
                network_interface_id: "eni-self".to_string(),
                attached_instance_id: Some("i-self".to_string()),
                private_ipv4: "10.0.0.1".parse().unwrap(),
                source_dest_check: false,
            }],
        );
        let reconciler = Reconciler::new(api.clone());
        let t = api.table("rtb-1").unwrap();
        let mut s = spec("i-self");
        s.if_unhealthy = false;
        let action = reconciler.reconcile(&t, &s, None, None, false).await.unwrap();
        assert_eq!(action, Action::Replace);
        assert!(api.calls().iter().any(|c| c.starts_with("replace_route:rtb-1")));
    }

    #[tokio::test]
    async fn e2b_reconciling_again_after_a_replace_settles_into_a_noop() {
        let api = std::sync::Arc::new(FakeRouteTableApi::new());
        api.set_tables(vec![table(
            "rtb-1",
            vec![CloudRoute {
                destination: ipnetwork::IpNetwork::from_str("0.0.0.0/0").unwrap(),
                state: RouteState::Active,
                next_hop: NextHop::Instance("i-other".to_string()),
            }],
        )]);
        api.set_network_interfaces(
            "i-self",
            vec![crate::models::NetworkInterface {
                network_interface_id: "eni-self".to_string(),
                attached_instance_id: Some("i-self".to_string()),
                private_ipv4: "10.0.0.1".parse().unwrap(),
                source_dest_check: false,
            }],
        );
        let reconciler = Reconciler::new(api.clone());
        let mut s = spec("i-self");
        s.if_unhealthy = false;

        let first_table = api.table("rtb-1").unwrap();
        let first_action = reconciler.reconcile(&first_table, &s, None, None, false).await.unwrap();
        assert_eq!(first_action, Action::Replace);

        // the fake's replace_route already rewrote the stored route's next_hop to
        // NextHop::NetworkInterface("eni-self"); re-fetch it and reconcile again.
        let second_table = api.table("rtb-1").unwrap();
        let second_action = reconciler.reconcile(&second_table, &s, None, None, false).await.unwrap();
        assert_eq!(second_action, Action::Noop { reason: NoopReason::AlreadyOursAndHealthy });
        assert_eq!(api.calls().iter().filter(|c| c.starts_with("replace_route")).count(), 1);
    }

    #[tokio::test]
    async fn e3_if_unhealthy_guard_blocks_replace_when_incumbent_status_ok() {
        let api = std::sync::Arc::new(FakeRouteTableApi::new());
        api.set_tables(vec![table(
            "rtb-1",
            vec![CloudRoute {
                destination: ipnetwork::IpNetwork::from_str("0.0.0.0/0").unwrap(),
                state: RouteState::Active,
                next_hop: NextHop::Instance("i-other".to_string()),
            }],
        )]);
        api.set_instance_status(
            "i-other",
            InstanceStatus {
                instance_status: SummaryStatus::Ok,
                system_status: SummaryStatus::Ok,
            },
        );
        let reconciler = Reconciler::new(api.clone());
        let t = api.table("rtb-1").unwrap();
        let mut s = spec("i-self");
        s.if_unhealthy = true;
        let action = reconciler.reconcile(&t, &s, None, None, false).await.unwrap();
        assert_eq!(action, Action::Noop { reason: NoopReason::IncumbentInstanceStatusOk });
    }

    #[tokio::test]
    async fn e4_deletes_own_route_when_local_healthcheck_fails() {
        let api = std::sync::Arc::new(FakeRouteTableApi::new());
        api.set_tables(vec![table(
            "rtb-1",
            vec![CloudRoute {
                destination: ipnetwork::IpNetwork::from_str("0.0.0.0/0").unwrap(),
                state: RouteState::Active,
                next_hop: NextHop::Instance("i-self".to_string()),
            }],
        )]);
        let reconciler = Reconciler::new(api.clone());
        let t = api.table("rtb-1").unwrap();
        let hc = healthcheck_in_state(false, true).await;
        let action = reconciler.reconcile(&t, &spec("i-self"), Some(&hc), None, false).await.unwrap();
        assert_eq!(action, Action::Delete);
        assert!(api.calls().iter().any(|c| c.starts_with("delete_route:rtb-1")));
    }

    #[tokio::test]
    async fn e5_never_delete_suppresses_delete() {
        let api = std::sync::Arc::new(FakeRouteTableApi::new());
        api.set_tables(vec![table(
            "rtb-1",
            vec![CloudRoute {
                destination: ipnetwork::IpNetwork::from_str("0.0.0.0/0").unwrap(),
                state: RouteState::Active,
                next_hop: NextHop::Instance("i-self".to_string()),
            }],
        )]);
        let reconciler = Reconciler::new(api.clone());
        let t = api.table("rtb-1").unwrap();
        let hc = healthcheck_in_state(false, true).await;
        let mut s = spec("i-self");
        s.never_delete = true;
        let action = reconciler.reconcile(&t, &s, Some(&hc), None, false).await.unwrap();
        assert_eq!(action, Action::Noop { reason: NoopReason::NeverDelete });
    }

    #[tokio::test]
    async fn e6_healthcheck_not_ready_blocks_create() {
        let api = std::sync::Arc::new(FakeRouteTableApi::new());
        api.set_tables(vec![table("rtb-1", vec![])]);
        let reconciler = Reconciler::new(api.clone());
        let t = api.table("rtb-1").unwrap();
        let hc = healthcheck_in_state(false, false).await;
        let action = reconciler.reconcile(&t, &spec("i-self"), Some(&hc), None, false).await.unwrap();
        assert_eq!(
            action,
            Action::Noop {
                reason: NoopReason::CreateBlockedByUnhealthyLocalCheck { can_pass_yet: false }
            }
        );
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn e8_instance_status_unreachable_degrades_to_noop() {
        let api = std::sync::Arc::new(FakeRouteTableApi::new());
        api.set_tables(vec![table(
            "rtb-2",
            vec![CloudRoute {
                destination: ipnetwork::IpNetwork::from_str("0.0.0.0/0").unwrap(),
                state: RouteState::Active,
                next_hop: NextHop::Instance("i-605bd2aa".to_string()),
            }],
        )]);
        api.fail_next_describe_instance_status();
        let reconciler = Reconciler::new(api.clone());
        let t = api.table("rtb-2").unwrap();
        let mut s = spec("i-self");
        s.if_unhealthy = true;
        let action = reconciler.reconcile(&t, &s, None, None, false).await.unwrap();
        assert_eq!(action, Action::Noop { reason: NoopReason::StatusQueryFailed });
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn e9_replace_suppressed_by_failing_local_healthcheck() {
        let api = std::sync::Arc::new(FakeRouteTableApi::new());
        api.set_tables(vec![table(
            "rtb-1",
            vec![CloudRoute {
                destination: ipnetwork::IpNetwork::from_str("0.0.0.0/0").unwrap(),
                state: RouteState::Active,
                next_hop: NextHop::Instance("i-other".to_string()),
            }],
        )]);
        let reconciler = Reconciler::new(api.clone());
        let t = api.table("rtb-1").unwrap();
        let hc = healthcheck_in_state(false, true).await;
        let mut s = spec("i-self");
        s.if_unhealthy = false;
        s.healthcheck_name = Some("local".to_string());
        let action = reconciler.reconcile(&t, &s, Some(&hc), None, false).await.unwrap();
        assert_eq!(action, Action::Noop { reason: NoopReason::LocalHealthcheckFailing });
        assert!(api.calls().is_empty());
    }
}
