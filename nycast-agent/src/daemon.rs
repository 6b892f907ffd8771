//! Daemon bootstrap and scheduling loop.
//!
//! Grounded on `daemon/daemon.go`'s `Daemon` struct and its
//! `Setup`/`Run`/`RunSleepLoop` trio, translated from a Go
//! channel-`select` to `tokio::select!`.

use crate::cloud_http::HttpRouteTableApi;
use crate::metadata_http::InstanceMetadataHttpFetcher;
use crate::probes::register_builtin_probes;
use nycast_core::cloud::InstanceRouterCache;
use nycast_core::config::{Config, ValidatedConfig};
use nycast_core::eni_cache::EniCache;
use nycast_core::error::{BootstrapError, CloudError};
use nycast_core::healthcheck::{Healthcheck, HealthcheckRegistry};
use nycast_core::metadata::{fetch_metadata, InstanceMetadata, MetadataFetcher};
use nycast_core::models::CloudRouteTable;
use nycast_core::reconciler::{Reconciler, RemoteHealthcheckStatus};
use nycast_core::remote_healthcheck::RemoteHealthcheckDispatcher;
use nycast_core::route_spec::ValidatedRouteSpec;
use nycast_core::cloud::RouteTableApi;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;

type ReconcileKey = (String, String);

/// State built once by [`Daemon::bootstrap`] and shared (read-only, apart
/// from interior mutability in its caches) across the ticker loop and
/// every healthcheck-listener task.
struct DaemonState {
    instance: InstanceMetadata,
    api: Arc<dyn RouteTableApi>,
    reconciler: Reconciler,
    config: ValidatedConfig,
    eni_cache: EniCache,
    remote_dispatchers: HashMap<ReconcileKey, RemoteHealthcheckDispatcher>,
    locks: HashMap<ReconcileKey, Arc<Mutex<()>>>,
    noop: bool,
    debug: bool,
}

impl DaemonState {
    fn lock_key(table_name: &str, spec: &ValidatedRouteSpec) -> ReconcileKey {
        (table_name.to_string(), spec.cidr.to_string())
    }

    /// One full pass: `DescribeRouteTables` once, then for every logical
    /// route table, select the matching cloud tables and reconcile every
    /// declared spec against each.
    ///
    /// Takes `self: &Arc<Self>` (rather than `&self`) because
    /// [`Self::sync_remote_healthchecks`] needs to clone an owned `Arc`
    /// into the listener task it spawns for each freshly started peer
    /// healthcheck.
    async fn run_route_tables(self: &Arc<Self>) -> Result<(), CloudError> {
        let tables = self.api.describe_route_tables().await?;

        for route_table in &self.config.route_tables {
            let selected = route_table.finder.select(&tables);
            if selected.is_empty() && !route_table.finder.no_results_ok {
                tracing::warn!(route_table = %route_table.name, "finder matched no cloud route tables");
            }

            for spec in &route_table.specs {
                if spec.remote_healthcheck_name.is_some() {
                    self.sync_remote_healthchecks(&route_table.name, &selected, spec).await;
                }
                for cloud_table in &selected {
                    self.reconcile_one(&route_table.name, cloud_table, spec).await;
                }
            }
        }
        Ok(())
    }

    /// `UpdateRemoteHealthchecks`: collect the resolved peer IPs of every
    /// matching route's next-hop ENI across every selected table, then
    /// reconcile the dispatcher's running healthchecks against that set.
    ///
    /// Every freshly started peer healthcheck gets its own listener task,
    /// spawned from the `on_new_peer` callback, so a peer going unhealthy
    /// re-triggers reconciliation immediately instead of waiting for the
    /// next poll tick — the same guarantee `start_healthcheck_listeners`
    /// gives local healthchecks.
    async fn sync_remote_healthchecks(self: &Arc<Self>, table_name: &str, selected: &[&CloudRouteTable], spec: &ValidatedRouteSpec) {
        let Some(remote_name) = &spec.remote_healthcheck_name else { return };
        let Some(template) = self.config.remote_healthcheck_templates.get(remote_name) else {
            return;
        };
        let key = Self::lock_key(table_name, spec);
        let Some(dispatcher) = self.remote_dispatchers.get(&key) else { return };

        let nic_ids: Vec<String> = selected
            .iter()
            .filter_map(|t| t.find_route(&spec.cidr))
            .filter_map(|r| r.next_hop.network_interface_id().map(str::to_string))
            .collect();
        let resolved = match self.eni_cache.resolve(&*self.api, &nic_ids).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "could not resolve ENIs for remote healthcheck sync");
                return;
            }
        };
        let active_ips: HashSet<Ipv4Addr> = resolved.into_iter().map(|(_, ip)| ip).collect();

        let state = self.clone();
        let table_name = table_name.to_string();
        let spec = spec.clone();
        dispatcher.sync(template, &active_ips, self.debug, move |ip, hc| {
            tracing::info!(table = %table_name, cidr = %spec.cidr, %ip, "remote healthcheck started, listening for verdict transitions");
            tokio::spawn(listen_for_remote_verdicts(state.clone(), table_name.clone(), spec.clone(), hc));
        });
    }

    async fn remote_status(&self, table_name: &str, cloud_table: &CloudRouteTable, spec: &ValidatedRouteSpec) -> Option<RemoteHealthcheckStatus> {
        spec.remote_healthcheck_name.as_ref()?;
        let route = cloud_table.find_route(&spec.cidr)?;
        let nic_id = route.next_hop.network_interface_id()?;
        let ip = self.eni_cache.get(nic_id)?;
        let key = Self::lock_key(table_name, spec);
        self.remote_dispatchers.get(&key)?.status_for(ip).await
    }

    /// `ManageInstanceRoute`, serialized per `(table, spec)` so a
    /// ticker-triggered and a healthcheck-triggered reconciliation for the
    /// same route never interleave.
    async fn reconcile_one(&self, table_name: &str, cloud_table: &CloudRouteTable, spec: &ValidatedRouteSpec) {
        let key = Self::lock_key(table_name, spec);
        let Some(lock) = self.locks.get(&key) else {
            tracing::error!(table = table_name, cidr = %spec.cidr, "no reconciliation lock registered for this route, skipping");
            return;
        };
        let _guard = lock.lock().await;

        let local_hc = spec.healthcheck_name.as_ref().and_then(|name| self.config.healthchecks.get(name));
        let remote_hc = self.remote_status(table_name, cloud_table, spec).await;

        match self.reconciler.reconcile(cloud_table, spec, local_hc, remote_hc, self.noop).await {
            Ok(action) => tracing::debug!(table = table_name, cidr = %spec.cidr, ?action, "reconciled"),
            Err(e) => tracing::warn!(table = table_name, cidr = %spec.cidr, error = %e, "reconciliation failed"),
        }
    }
}

pub struct Daemon {
    config_file: String,
    version: String,
    debug: bool,
    noop: bool,
    one_shot: bool,
    route_table_api: Option<Arc<dyn RouteTableApi>>,
    metadata_fetcher: Option<Arc<dyn MetadataFetcher>>,
    state: Option<Arc<DaemonState>>,
}

impl Daemon {
    pub fn new(config_file: impl Into<String>, version: impl Into<String>, debug: bool, noop: bool, one_shot: bool) -> Self {
        Daemon {
            config_file: config_file.into(),
            version: version.into(),
            debug,
            noop,
            one_shot,
            route_table_api: None,
            metadata_fetcher: None,
            state: None,
        }
    }

    /// Inject a `RouteTableApi`/`MetadataFetcher` instead of the real
    /// HTTP-backed ones built during [`Daemon::bootstrap`]. Mirrors the Go
    /// source's `if d.RouteTableManager == nil` / `if d.MetadataFetcher ==
    /// nil` pattern used by its own test suite.
    #[cfg(any(test, feature = "test-support"))]
    pub fn with_collaborators(mut self, api: Arc<dyn RouteTableApi>, metadata: Arc<dyn MetadataFetcher>) -> Self {
        self.route_table_api = Some(api);
        self.metadata_fetcher = Some(metadata);
        self
    }

    async fn bootstrap(&mut self) -> Result<(), BootstrapError> {
        let metadata_fetcher = match &self.metadata_fetcher {
            Some(f) => f.clone(),
            None => Arc::new(InstanceMetadataHttpFetcher::new()),
        };
        let instance = fetch_metadata(&*metadata_fetcher).await.map_err(BootstrapError::Metadata)?;

        let api: Arc<dyn RouteTableApi> = match &self.route_table_api {
            Some(api) => api.clone(),
            None => Arc::new(HttpRouteTableApi::new(instance.region.clone(), &self.version)),
        };

        let mut registry = HealthcheckRegistry::new();
        register_builtin_probes(&mut registry);

        let raw_config = Config::load(&self.config_file)?;
        let mut config = raw_config.validate(&instance.instance_id, &registry)?;

        for hc in config.healthchecks.values_mut() {
            hc.run(self.debug);
        }

        let router_cache = InstanceRouterCache::new();
        if !router_cache.is_router(&*api, &instance.instance_id).await.map_err(BootstrapError::InitialRun)? {
            return Err(BootstrapError::NotARouter);
        }

        let mut remote_dispatchers = HashMap::new();
        let mut locks = HashMap::new();
        for route_table in &config.route_tables {
            for spec in &route_table.specs {
                let key = DaemonState::lock_key(&route_table.name, spec);
                locks.insert(key.clone(), Arc::new(Mutex::new(())));
                if spec.remote_healthcheck_name.is_some() {
                    remote_dispatchers.insert(key, RemoteHealthcheckDispatcher::new(instance.primary_ipv4));
                }
            }
        }

        let state = DaemonState {
            instance,
            api: api.clone(),
            reconciler: Reconciler::new(api),
            config,
            eni_cache: EniCache::new(),
            remote_dispatchers,
            locks,
            noop: self.noop,
            debug: self.debug,
        };

        self.state = Some(Arc::new(state));
        Ok(())
    }

    /// Spawn one listener task per spec with a local healthcheck
    /// (`StartHealthcheckListener`): each re-reconciles the spec's table
    /// the moment its healthcheck's verdict flips, rather than waiting for
    /// the next poll tick.
    fn start_healthcheck_listeners(&self) {
        let state = self.state.clone().expect("bootstrap must run before start_healthcheck_listeners");
        for route_table in &state.config.route_tables {
            for spec in &route_table.specs {
                let Some(name) = &spec.healthcheck_name else { continue };
                let Some(hc) = state.config.healthchecks.get(name) else { continue };
                let mut verdicts = hc.subscribe();
                let state = state.clone();
                let table_name = route_table.name.clone();
                let spec = spec.clone();
                tokio::spawn(async move {
                    loop {
                        match verdicts.recv().await {
                            Ok(healthy) => {
                                tracing::info!(table = %table_name, cidr = %spec.cidr, healthy, "healthcheck status change, reevaluating route");
                                if let Err(e) = reconcile_table_for_spec(&state, &table_name, &spec).await {
                                    tracing::warn!(table = %table_name, error = %e, "error reevaluating route after healthcheck transition");
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        }
                    }
                });
            }
        }
    }

    /// `Run(oneShot, noop)`: returns the process exit code, matching the
    /// Go source's `Run` signature rather than propagating a Rust error,
    /// since every failure path here already has a specific log line and
    /// exit code in spec.md §7.
    pub async fn run(&mut self) -> i32 {
        if let Err(e) = self.bootstrap().await {
            tracing::error!(error = %e, "error in initial setup");
            return 1;
        }

        self.start_healthcheck_listeners();

        let state = self.state.clone().expect("bootstrap succeeded");
        if let Err(e) = state.run_route_tables().await {
            tracing::error!(error = %e, "error in initial route table run");
            return 1;
        }

        if self.one_shot {
            return 0;
        }

        self.run_sleep_loop(state).await;
        0
    }

    async fn run_sleep_loop(&self, state: Arc<DaemonState>) {
        let mut ticker = tokio::time::interval(state.config.poll_time);
        ticker.tick().await; // first tick fires immediately; the initial run above already covered it

        #[cfg(unix)]
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler");

        loop {
            #[cfg(unix)]
            let shutdown = tokio::select! {
                _ = tokio::signal::ctrl_c() => true,
                _ = terminate.recv() => true,
                _ = ticker.tick() => false,
            };
            #[cfg(not(unix))]
            let shutdown = tokio::select! {
                _ = tokio::signal::ctrl_c() => true,
                _ = ticker.tick() => false,
            };

            if shutdown {
                tracing::info!("shutdown signal received, exiting sleep loop");
                return;
            }
            if let Err(e) = state.run_route_tables().await {
                tracing::warn!(error = %e, "error in route table poll run");
            }
        }
    }
}

/// Mirrors `start_healthcheck_listeners`'s loop, but for one remote peer
/// healthcheck spun up by [`DaemonState::sync_remote_healthchecks`]:
/// re-reconcile the spec's table the moment the peer's verdict flips,
/// rather than waiting for the next poll tick to notice it.
async fn listen_for_remote_verdicts(state: Arc<DaemonState>, table_name: String, spec: ValidatedRouteSpec, hc: Arc<Healthcheck>) {
    let mut verdicts = hc.subscribe();
    loop {
        match verdicts.recv().await {
            Ok(healthy) => {
                tracing::info!(table = %table_name, cidr = %spec.cidr, healthy, "remote healthcheck status change, reevaluating route");
                if let Err(e) = reconcile_table_for_spec(&state, &table_name, &spec).await {
                    tracing::warn!(table = %table_name, error = %e, "error reevaluating route after remote healthcheck transition");
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn reconcile_table_for_spec(state: &DaemonState, table_name: &str, spec: &ValidatedRouteSpec) -> Result<(), CloudError> {
    let tables = state.api.describe_route_tables().await?;
    let Some(route_table) = state.config.route_tables.iter().find(|rt| rt.name == table_name) else {
        return Ok(());
    };
    let selected = route_table.finder.select(&tables);
    for cloud_table in &selected {
        state.reconcile_one(table_name, cloud_table, spec).await;
    }
    Ok(())
}
