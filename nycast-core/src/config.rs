//! Top-level YAML configuration: the raw deserialized tree, and its
//! validated form built from it.
//!
//! Grounded on `config/route_table.go`'s `RouteTable`/`Config` shape and
//! `Validate()` loop, and on the teacher gateway's `Config::load`
//! returning a crate error rather than propagating `serde_yaml::Error`
//! directly.

use crate::error::ConfigError;
use crate::finder::{CompiledFinder, RouteTableFindSpec};
use crate::healthcheck::{Healthcheck, HealthcheckConfig, HealthcheckRegistry};
use crate::route_spec::{RouteSpecConfig, ValidatedRouteSpec};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// One `routetables:` entry as written in YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteTableConfig {
    pub find: RouteTableFindSpec,
    pub manage_routes: Vec<RouteSpecConfig>,
}

/// The raw configuration tree, one-to-one with the YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(with = "crate::common::duration_serde")]
    pub poll_time: Duration,
    #[serde(default)]
    pub healthchecks: HashMap<String, HealthcheckConfig>,
    #[serde(default)]
    pub remote_healthchecks: HashMap<String, HealthcheckConfig>,
    pub routetables: HashMap<String, RouteTableConfig>,
}

impl Config {
    /// Read and parse the config file. Schema errors are not validated
    /// here; call [`Config::validate`] afterward.
    pub fn load(path: &str) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Cross-validate the whole tree: compile every finder, validate
    /// every route spec against the healthcheck/remote-healthcheck name
    /// sets, and instantiate the healthcheck registry entries. Every
    /// problem found anywhere in the tree is aggregated into one error
    /// rather than stopping at the first (spec §4.2, §7).
    pub fn validate(&self, self_instance_id: &str, registry: &HealthcheckRegistry) -> Result<ValidatedConfig, ConfigError> {
        let mut errors = Vec::new();

        let healthcheck_names: HashSet<String> = self.healthchecks.keys().cloned().collect();
        let remote_healthcheck_names: HashSet<String> = self.remote_healthchecks.keys().cloned().collect();

        let mut healthchecks = HashMap::new();
        for (name, hc_config) in &self.healthchecks {
            match Healthcheck::setup(name.clone(), hc_config.clone(), registry) {
                Ok(hc) => {
                    healthchecks.insert(name.clone(), hc);
                }
                Err(e) => errors.push(ConfigError::Invalid(format!("healthcheck '{name}': {e}"))),
            }
        }

        let mut remote_healthcheck_templates = HashMap::new();
        for (name, hc_config) in &self.remote_healthchecks {
            match Healthcheck::setup(name.clone(), hc_config.clone(), registry) {
                Ok(hc) => {
                    remote_healthcheck_templates.insert(name.clone(), hc);
                }
                Err(e) => errors.push(ConfigError::Invalid(format!("remote healthcheck '{name}': {e}"))),
            }
        }

        let mut route_tables = Vec::new();
        for (name, table_config) in &self.routetables {
            if table_config.manage_routes.is_empty() {
                errors.push(ConfigError::Invalid(format!("route table '{name}' has no manage_routes entries")));
            }

            let finder = match table_config.find.compile() {
                Ok(finder) => Some(finder),
                Err(finder_errors) => {
                    for fe in finder_errors {
                        errors.push(ConfigError::Invalid(format!("route table '{name}': {fe}")));
                    }
                    None
                }
            };

            let mut specs = Vec::new();
            for route_config in &table_config.manage_routes {
                match ValidatedRouteSpec::validate(route_config, name, self_instance_id, &healthcheck_names, &remote_healthcheck_names) {
                    Ok(spec) => specs.push(spec),
                    Err(e) => errors.push(e),
                }
            }

            if let Some(finder) = finder {
                route_tables.push(ValidatedRouteTable {
                    name: name.clone(),
                    finder,
                    specs,
                });
            }
        }

        if let Some(combined) = ConfigError::from_many(errors) {
            return Err(combined);
        }

        Ok(ValidatedConfig {
            poll_time: self.poll_time,
            route_tables,
            healthchecks,
            remote_healthcheck_templates,
        })
    }
}

/// One validated logical route table: its compiled finder and every
/// validated route spec declared against it.
pub struct ValidatedRouteTable {
    pub name: String,
    pub finder: CompiledFinder,
    pub specs: Vec<ValidatedRouteSpec>,
}

/// The fully cross-checked configuration, ready to drive the daemon.
pub struct ValidatedConfig {
    pub poll_time: Duration,
    pub route_tables: Vec<ValidatedRouteTable>,
    pub healthchecks: HashMap<String, Healthcheck>,
    pub remote_healthcheck_templates: HashMap<String, Healthcheck>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healthcheck::HealthChecker;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;

    struct NoopChecker;

    #[async_trait]
    impl HealthChecker for NoopChecker {
        async fn probe(&self) -> bool {
            true
        }
        fn new_with_destination(&self, _ip: Ipv4Addr) -> Box<dyn HealthChecker> {
            Box::new(NoopChecker)
        }
    }

    fn registry() -> HealthcheckRegistry {
        let mut r = HealthcheckRegistry::new();
        r.register("noop", |_config| Box::new(NoopChecker));
        r
    }

    fn minimal_yaml() -> &'static str {
        r#"
poll_time: 30
healthchecks:
  lo:
    type: noop
    destination: 127.0.0.1
    rise: 2
    fall: 2
    every: 5
routetables:
  main:
    find:
      type: main
    manage_routes:
      - cidr: 0.0.0.0/0
        instance: SELF
        healthcheck: lo
"#
    }

    #[test]
    fn validate_builds_a_validated_config_from_good_yaml() {
        let config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        let validated = config.validate("i-self", &registry()).unwrap();
        assert_eq!(validated.route_tables.len(), 1);
        assert_eq!(validated.route_tables[0].specs.len(), 1);
        assert!(validated.healthchecks.contains_key("lo"));
    }

    #[test]
    fn validate_aggregates_errors_across_the_whole_tree() {
        let yaml = r#"
poll_time: 30
routetables:
  main:
    find:
      type: not_a_real_type
    manage_routes:
      - cidr: not-a-cidr
        healthcheck: missing
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate("i-self", &registry()).unwrap_err();
        match err {
            ConfigError::Aggregate(errs) => assert!(errs.len() >= 2),
            other => panic!("expected Aggregate, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_a_route_table_with_no_routes() {
        let yaml = r#"
poll_time: 30
routetables:
  main:
    find:
      type: main
    manage_routes: []
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate("i-self", &registry()).unwrap_err();
        assert!(format!("{err}").contains("manage_routes") || matches!(err, ConfigError::Aggregate(_)));
    }
}
