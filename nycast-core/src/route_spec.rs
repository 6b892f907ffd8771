//! Declarative per-route configuration and its validated, canonicalized
//! form, grounded on `aws/manage_route_spec.go`'s `ManageRoutesSpec` and
//! its `Validate()` method.

use crate::error::ConfigError;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::collections::HashSet;
use std::str::FromStr;

/// One `routes:` entry as written in YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteSpecConfig {
    pub cidr: String,
    #[serde(default)]
    pub instance: String,
    #[serde(default, rename = "healthcheck")]
    pub healthcheck_name: Option<String>,
    #[serde(default, rename = "remote_healthcheck")]
    pub remote_healthcheck_name: Option<String>,
    #[serde(default)]
    pub if_unhealthy: bool,
    #[serde(default)]
    pub never_delete: bool,
    #[serde(default)]
    pub run_before_replace_route: Vec<String>,
    #[serde(default)]
    pub run_after_replace_route: Vec<String>,
    #[serde(default)]
    pub run_before_delete_route: Vec<String>,
    #[serde(default)]
    pub run_after_delete_route: Vec<String>,
}

/// A `RouteSpecConfig` that has been canonicalized and cross-checked
/// against the rest of the config file. Only a `ValidatedRouteSpec` is
/// ever handed to the reconciler.
#[derive(Debug, Clone)]
pub struct ValidatedRouteSpec {
    pub cidr: IpNetwork,
    pub instance_id: String,
    pub instance_is_self: bool,
    pub healthcheck_name: Option<String>,
    pub remote_healthcheck_name: Option<String>,
    pub if_unhealthy: bool,
    pub never_delete: bool,
    pub run_before_replace_route: Vec<String>,
    pub run_after_replace_route: Vec<String>,
    pub run_before_delete_route: Vec<String>,
    pub run_after_delete_route: Vec<String>,
}

impl ValidatedRouteSpec {
    /// Canonicalize and validate one route entry.
    ///
    /// `table_name` and the resulting `cidr` are folded into any error
    /// message so they read the same as the Go source's
    /// `"Route tables %s, route %s cannot find healthcheck '%s'"`.
    pub fn validate(
        config: &RouteSpecConfig,
        table_name: &str,
        self_instance_id: &str,
        healthcheck_names: &HashSet<String>,
        remote_healthcheck_names: &HashSet<String>,
    ) -> Result<ValidatedRouteSpec, ConfigError> {
        let mut errors = Vec::new();

        let cidr = canonicalize_cidr(&config.cidr, table_name, &mut errors);

        let (instance_id, instance_is_self) = match config.instance.as_str() {
            "" | "SELF" => (self_instance_id.to_string(), true),
            other => (other.to_string(), false),
        };

        let cidr_display = if config.cidr.contains('/') {
            config.cidr.clone()
        } else {
            format!("{}/32", config.cidr)
        };

        if let Some(name) = &config.healthcheck_name {
            if !healthcheck_names.contains(name) {
                errors.push(ConfigError::Invalid(format!(
                    "route tables {table_name}, route {cidr_display} cannot find healthcheck '{name}'"
                )));
            }
        }

        if let Some(name) = &config.remote_healthcheck_name {
            if !remote_healthcheck_names.contains(name) {
                errors.push(ConfigError::Invalid(format!(
                    "route tables {table_name}, route {cidr_display} cannot find remote healthcheck '{name}'"
                )));
            }
        }

        if let Some(combined) = ConfigError::from_many(errors) {
            return Err(combined);
        }

        Ok(ValidatedRouteSpec {
            cidr: cidr.expect("cidr errors would have returned above"),
            instance_id,
            instance_is_self,
            healthcheck_name: config.healthcheck_name.clone(),
            remote_healthcheck_name: config.remote_healthcheck_name.clone(),
            if_unhealthy: config.if_unhealthy,
            never_delete: config.never_delete,
            run_before_replace_route: config.run_before_replace_route.clone(),
            run_after_replace_route: config.run_after_replace_route.clone(),
            run_before_delete_route: config.run_before_delete_route.clone(),
            run_after_delete_route: config.run_after_delete_route.clone(),
        })
    }
}

/// Bare IPv4/IPv6 addresses are treated as a `/32` or `/128` host route
/// (spec §4.1); anything `IpNetwork::from_str` rejects is an error.
fn canonicalize_cidr(raw: &str, table_name: &str, errors: &mut Vec<ConfigError>) -> Option<IpNetwork> {
    if raw.is_empty() {
        errors.push(ConfigError::Invalid(format!("cidr is not defined in {table_name}")));
        return None;
    }
    let candidate = if raw.contains('/') {
        raw.to_string()
    } else {
        format!("{raw}/32")
    };
    match IpNetwork::from_str(&candidate) {
        Ok(net) => Some(net),
        Err(e) => {
            errors.push(ConfigError::Invalid(format!("could not parse {candidate} in {table_name}: {e}")));
            None
        }
    }
}
