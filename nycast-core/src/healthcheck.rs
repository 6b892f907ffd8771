//! Healthcheck runtime: periodic probing with rise/fall debouncing and a
//! broadcast of verdict transitions to every interested reconciler.
//!
//! Grounded on `ultrafast-models-sdk/src/circuit_breaker.rs`'s
//! `Arc<RwLock<State>>` + named-instance shape, generalized from a
//! 3-state breaker to the rise/fall hysteresis described in spec §4.4.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;

/// The narrow surface a concrete probe (ping/tcp/http, implemented in
/// `nycast-agent`) needs to provide.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Run one probe and report success/failure. Errors count as a
    /// failed probe (spec §7) rather than being distinguished from one.
    async fn probe(&self) -> bool;

    /// Clone this probe's configuration with a new destination. Used by
    /// the remote-healthcheck dispatcher to instantiate one probe per
    /// observed peer IP from a template.
    fn new_with_destination(&self, ip: Ipv4Addr) -> Box<dyn HealthChecker>;
}

/// Declared configuration for one healthcheck entry (local or remote
/// template), as it appears under `healthchecks:`/`remote_healthchecks:`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct HealthcheckConfig {
    #[serde(rename = "type")]
    pub type_: String,
    pub destination: String,
    #[serde(with = "crate::common::duration_serde")]
    pub every: Duration,
    pub rise: u32,
    pub fall: u32,
}

struct HealthcheckState {
    history: VecDeque<bool>,
    total_observed: u64,
    healthy: bool,
}

impl HealthcheckState {
    fn new() -> Self {
        HealthcheckState {
            history: VecDeque::new(),
            total_observed: 0,
            healthy: false,
        }
    }

    fn window_cap(rise: u32, fall: u32) -> usize {
        rise.max(fall).max(1) as usize
    }

    /// Record one probe outcome, returning `Some(new_verdict)` if
    /// `is_healthy()` just transitioned, `None` if it's unchanged.
    fn record(&mut self, outcome: bool, rise: u32, fall: u32) -> Option<bool> {
        let cap = Self::window_cap(rise, fall);
        self.history.push_back(outcome);
        while self.history.len() > cap {
            self.history.pop_front();
        }
        self.total_observed += 1;

        let last_n_all = |n: u32, want: bool| -> bool {
            let n = n as usize;
            if n == 0 || self.history.len() < n {
                return false;
            }
            self.history.iter().rev().take(n).all(|&v| v == want)
        };

        let previous = self.healthy;
        if !self.healthy && last_n_all(rise, true) {
            self.healthy = true;
        } else if self.healthy && last_n_all(fall, false) {
            self.healthy = false;
        }

        if self.healthy != previous {
            Some(self.healthy)
        } else {
            None
        }
    }

    fn can_pass_yet(&self, rise: u32) -> bool {
        self.total_observed >= rise as u64
    }
}

/// A running (or stopped) healthcheck instance.
///
/// `is_healthy()`/`can_pass_yet()` are cheap, lock-free-ish reads (a
/// single `RwLock` acquisition); `subscribe()` hands back a broadcast
/// receiver that sees every verdict transition from the point of
/// subscription onward.
pub struct Healthcheck {
    pub name: String,
    pub config: HealthcheckConfig,
    checker: Arc<dyn HealthChecker>,
    state: Arc<RwLock<HealthcheckState>>,
    verdicts: broadcast::Sender<bool>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    task: Option<JoinHandle<()>>,
}

impl Healthcheck {
    /// `Setup`: resolve `config.type_` from the registry and instantiate
    /// the underlying probe.
    pub fn setup(
        name: impl Into<String>,
        config: HealthcheckConfig,
        registry: &HealthcheckRegistry,
    ) -> Result<Healthcheck, String> {
        let checker: Arc<dyn HealthChecker> = Arc::from(registry.instantiate(&config)?);
        let (verdicts, _rx) = broadcast::channel(32);
        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Healthcheck {
            name: name.into(),
            config,
            checker,
            state: Arc::new(RwLock::new(HealthcheckState::new())),
            verdicts,
            stop_tx,
            stop_rx,
            task: None,
        })
    }

    /// Build a `Healthcheck` directly from an already-instantiated probe;
    /// used by the remote-healthcheck dispatcher, which clones a template
    /// probe via [`HealthChecker::new_with_destination`] instead of
    /// looking the type up in the registry again.
    pub fn from_checker(name: impl Into<String>, config: HealthcheckConfig, checker: Box<dyn HealthChecker>) -> Healthcheck {
        let (verdicts, _rx) = broadcast::channel(32);
        let (stop_tx, stop_rx) = watch::channel(false);
        Healthcheck {
            name: name.into(),
            config,
            checker: Arc::from(checker),
            state: Arc::new(RwLock::new(HealthcheckState::new())),
            verdicts,
            stop_tx,
            stop_rx,
            task: None,
        }
    }

    /// `Run(debug)`: start the ticker task. `debug` only affects log
    /// verbosity at the call site (spec §4.4); it doesn't change timing.
    pub fn run(&mut self, debug: bool) {
        if self.task.is_some() {
            return;
        }
        let checker_probe = self.checker.clone();
        let every = self.config.every;
        let rise = self.config.rise;
        let fall = self.config.fall;
        let state = self.state.clone();
        let verdicts = self.verdicts.clone();
        let mut stop_rx = self.stop_rx.clone();
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        let outcome = match tokio::time::timeout(every, checker_probe.probe()).await {
                            Ok(result) => result,
                            Err(_) => false,
                        };
                        if debug {
                            tracing::debug!(healthcheck = %name, outcome, "probe completed");
                        }
                        let transition = {
                            let mut guard = state.write().await;
                            guard.record(outcome, rise, fall)
                        };
                        if let Some(new_verdict) = transition {
                            tracing::info!(healthcheck = %name, healthy = new_verdict, "healthcheck verdict changed");
                            let _ = verdicts.send(new_verdict);
                        }
                    }
                }
            }
        });
        self.task = Some(handle);
    }

    /// `Stop`: halt the ticker and close listeners.
    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.task.take() {
            handle.abort();
        }
    }

    pub async fn is_healthy(&self) -> bool {
        self.state.read().await.healthy
    }

    pub async fn can_pass_yet(&self) -> bool {
        self.state.read().await.can_pass_yet(self.config.rise)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.verdicts.subscribe()
    }

    /// `NewWithDestination`: used by the remote-healthcheck dispatcher to
    /// build a fresh, independent `Healthcheck` targeting `ip`, from this
    /// instance acting as a template.
    pub fn new_with_destination(&self, name: impl Into<String>, ip: Ipv4Addr) -> Healthcheck {
        let checker = self.checker.new_with_destination(ip);
        let mut config = self.config.clone();
        config.destination = ip.to_string();
        Healthcheck::from_checker(name, config, checker)
    }
}

impl Drop for Healthcheck {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Process-wide registry mapping a healthcheck `type` name to a
/// constructor. Populated once at daemon start (spec §4.4, §9): "no
/// dynamic plugin loading is required".
pub struct HealthcheckRegistry {
    constructors: std::collections::HashMap<String, Box<dyn Fn(&HealthcheckConfig) -> Box<dyn HealthChecker> + Send + Sync>>,
}

impl HealthcheckRegistry {
    pub fn new() -> Self {
        HealthcheckRegistry {
            constructors: std::collections::HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, type_name: impl Into<String>, constructor: F)
    where
        F: Fn(&HealthcheckConfig) -> Box<dyn HealthChecker> + Send + Sync + 'static,
    {
        self.constructors.insert(type_name.into(), Box::new(constructor));
    }

    pub fn instantiate(&self, config: &HealthcheckConfig) -> Result<Box<dyn HealthChecker>, String> {
        let ctor = self
            .constructors
            .get(&config.type_)
            .ok_or_else(|| format!("unknown healthcheck type '{}'", config.type_))?;
        Ok(ctor(config))
    }
}

impl Default for HealthcheckRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedChecker {
        outcomes: Arc<std::sync::Mutex<VecDeque<bool>>>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl HealthChecker for ScriptedChecker {
        async fn probe(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes.lock().unwrap().pop_front().unwrap_or(false)
        }

        fn new_with_destination(&self, _ip: Ipv4Addr) -> Box<dyn HealthChecker> {
            Box::new(ScriptedChecker {
                outcomes: self.outcomes.clone(),
                calls: self.calls.clone(),
            })
        }
    }

    fn config(rise: u32, fall: u32) -> HealthcheckConfig {
        HealthcheckConfig {
            type_: "scripted".to_string(),
            destination: "127.0.0.1".to_string(),
            every: Duration::from_millis(10),
            rise,
            fall,
        }
    }

    #[test]
    fn is_healthy_flips_at_rise_consecutive_successes() {
        let mut state = HealthcheckState::new();
        assert!(!state.record(false, 3, 2).is_some() || !state.healthy);
        assert_eq!(state.record(true, 3, 2), None);
        assert_eq!(state.record(true, 3, 2), None);
        assert_eq!(state.record(true, 3, 2), Some(true));
        assert!(state.healthy);
    }

    #[test]
    fn is_healthy_flips_at_fall_consecutive_failures() {
        let mut state = HealthcheckState::new();
        state.record(true, 2, 3);
        state.record(true, 2, 3);
        assert!(state.healthy);
        assert_eq!(state.record(false, 2, 3), None);
        assert_eq!(state.record(false, 2, 3), None);
        assert_eq!(state.record(false, 2, 3), Some(false));
        assert!(!state.healthy);
    }

    #[test]
    fn can_pass_yet_requires_rise_samples_observed() {
        let mut state = HealthcheckState::new();
        assert!(!state.can_pass_yet(3));
        state.record(true, 3, 3);
        assert!(!state.can_pass_yet(3));
        state.record(true, 3, 3);
        assert!(!state.can_pass_yet(3));
        state.record(true, 3, 3);
        assert!(state.can_pass_yet(3));
    }

    #[tokio::test]
    async fn healthcheck_runtime_debounces_and_publishes_transitions() {
        let outcomes = Arc::new(std::sync::Mutex::new(VecDeque::from(vec![true, true, true, false, false])));
        let checker = Box::new(ScriptedChecker {
            outcomes,
            calls: Arc::new(AtomicUsize::new(0)),
        });
        let mut hc = Healthcheck::from_checker("test", config(2, 2), checker);
        let mut rx = hc.subscribe();
        hc.run(false);

        let first = rx.recv().await.unwrap();
        assert!(first);
        assert!(hc.is_healthy().await);

        let second = rx.recv().await.unwrap();
        assert!(!second);
        assert!(!hc.is_healthy().await);

        hc.stop();
    }
}
