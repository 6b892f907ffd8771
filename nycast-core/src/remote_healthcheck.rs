//! Per-route dispatcher that spins up one healthcheck per peer IP
//! currently carrying a route, and tears them down once a peer stops
//! carrying it.
//!
//! Grounded on `aws/manage_route_spec.go`'s `UpdateRemoteHealthchecks`
//! and `aws/route_table_manager.go`'s `checkRemoteHealthCheck`.

use crate::healthcheck::Healthcheck;
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Tracks the live remote healthchecks for one `remote_healthcheck`
/// route spec. One of these exists per `ValidatedRouteSpec` that
/// declares a `remote_healthcheck_name`.
pub struct RemoteHealthcheckDispatcher {
    my_ip: Ipv4Addr,
    peers: DashMap<Ipv4Addr, Arc<Healthcheck>>,
}

impl RemoteHealthcheckDispatcher {
    pub fn new(my_ip: Ipv4Addr) -> Self {
        RemoteHealthcheckDispatcher {
            my_ip,
            peers: DashMap::new(),
        }
    }

    /// Reconcile running healthchecks against `active_ips`, the set of
    /// peer IPs this route is currently (or about to be) routed through.
    /// Spins up a new healthcheck from `template` for any IP not already
    /// tracked, skipping our own IP (spec: "skip starting a remote
    /// healthcheck on myself"), and stops/drops any tracked IP no longer
    /// present.
    ///
    /// `on_new_peer` is called once per freshly started healthcheck, with
    /// the peer's IP and a handle to it, so a caller can subscribe to its
    /// verdicts and trigger its own reconciliation the same way it would
    /// for a local healthcheck (spec §4.5: a remote peer going unhealthy
    /// must be noticed immediately, not just on the next poll tick). This
    /// crate has no notion of "reconcile a table" itself, so it hands the
    /// healthcheck back instead of reacting to it.
    ///
    /// Stale IPs are collected into a `Vec` before removal so the
    /// `DashMap` iterator used to find them is never mutated while it's
    /// still live (open question, resolved in DESIGN.md).
    pub fn sync(&self, template: &Healthcheck, active_ips: &HashSet<Ipv4Addr>, debug: bool, mut on_new_peer: impl FnMut(Ipv4Addr, Arc<Healthcheck>)) {
        for ip in active_ips {
            if *ip == self.my_ip {
                continue;
            }
            if self.peers.contains_key(ip) {
                continue;
            }
            let mut hc = template.new_with_destination(format!("remote-{ip}"), *ip);
            hc.run(debug);
            let hc = Arc::new(hc);
            self.peers.insert(*ip, hc.clone());
            on_new_peer(*ip, hc);
        }

        let stale: Vec<Ipv4Addr> = self
            .peers
            .iter()
            .map(|entry| *entry.key())
            .filter(|ip| !active_ips.contains(ip))
            .collect();
        for ip in stale {
            self.peers.remove(&ip);
        }
    }

    /// `checkRemoteHealthCheck`: whether the reconciler should go ahead
    /// and replace the route currently served by `ip`.
    ///
    /// Returns `false` ("don't replace") if there's no tracked
    /// healthcheck for `ip` yet, or if the healthcheck can't pass yet, or
    /// if it's already healthy (no reason to replace a healthy route).
    /// Returns `true` ("go ahead and replace") only once the healthcheck
    /// has observed enough samples to have an opinion and that opinion
    /// is "unhealthy".
    pub async fn should_replace(&self, ip: Ipv4Addr) -> bool {
        let hc = match self.peers.get(&ip).map(|entry| entry.value().clone()) {
            Some(hc) => hc,
            None => return false,
        };
        if !hc.can_pass_yet().await {
            return false;
        }
        !hc.is_healthy().await
    }

    /// The raw `(healthy, can_pass_yet)` reading for `ip`'s tracked
    /// healthcheck, for callers that need to feed a
    /// [`crate::reconciler::RemoteHealthcheckStatus`] into the reconciler
    /// rather than just the yes/no `should_replace` verdict.
    pub async fn status_for(&self, ip: Ipv4Addr) -> Option<crate::reconciler::RemoteHealthcheckStatus> {
        let hc = self.peers.get(&ip).map(|entry| entry.value().clone())?;
        Some(crate::reconciler::RemoteHealthcheckStatus {
            healthy: hc.is_healthy().await,
            can_pass_yet: hc.can_pass_yet().await,
        })
    }

    pub fn tracked_ips(&self) -> Vec<Ipv4Addr> {
        self.peers.iter().map(|e| *e.key()).collect()
    }
}
