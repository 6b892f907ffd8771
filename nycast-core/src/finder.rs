//! Route-table finder DSL: a small tree of filters that compiles down to a
//! single predicate selecting which cloud route tables are in scope for a
//! logical `RouteTable` entry.
//!
//! Grounded on the teacher's tagged-enum routing config
//! (`ultrafast-models-sdk/src/routing.rs`'s `RoutingStrategy`/`Condition`),
//! generalized from "pick one provider" to "keep every table matching a
//! boolean expression".

use crate::error::FinderError;
use crate::models::CloudRouteTable;
use ipnetwork::IpNetwork;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Raw, not-yet-compiled finder node as it appears in YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteTableFindSpec {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub not: bool,
    #[serde(default)]
    pub no_results_ok: bool,
    #[serde(default)]
    pub config: serde_yaml::Value,
}

fn require_str(config: &serde_yaml::Value, finder_type: &str, key: &str) -> Result<String, FinderError> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| FinderError::MissingKey {
            finder_type: finder_type.to_string(),
            key: key.to_string(),
        })
}

fn optional_bool(config: &serde_yaml::Value, key: &str) -> bool {
    config.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn require_filters(config: &serde_yaml::Value, finder_type: &str) -> Result<Vec<RouteTableFindSpec>, FinderError> {
    let filters = config
        .get("filters")
        .ok_or_else(|| FinderError::MissingKey {
            finder_type: finder_type.to_string(),
            key: "filters".to_string(),
        })?;
    let parsed: Vec<RouteTableFindSpec> = serde_yaml::from_value(filters.clone()).map_err(|_| FinderError::MissingKey {
        finder_type: finder_type.to_string(),
        key: "filters".to_string(),
    })?;
    if parsed.is_empty() {
        return Err(FinderError::EmptyFilters(finder_type.to_string()));
    }
    Ok(parsed)
}

/// Per-call context available to a compiled predicate: information that
/// depends on the whole candidate batch, not any single table, computed
/// once per `select()` call rather than once per node.
///
/// This exists for the `subnet{id}` fallback rule (spec §4.1): "the VPC
/// main table when no table is explicitly associated with that subnet" is
/// a property of the *set* of tables being filtered, not of one table.
pub struct FilterContext {
    subnets_with_explicit_association: HashSet<String>,
}

impl FilterContext {
    fn build(tables: &[CloudRouteTable]) -> Self {
        let mut subnets_with_explicit_association = HashSet::new();
        for table in tables {
            for assoc in &table.associations {
                if let Some(subnet_id) = &assoc.subnet_id {
                    subnets_with_explicit_association.insert(subnet_id.clone());
                }
            }
        }
        FilterContext {
            subnets_with_explicit_association,
        }
    }
}

type Predicate = Arc<dyn Fn(&CloudRouteTable, &FilterContext) -> bool + Send + Sync>;

/// A finder tree compiled down to one predicate, ready to be applied
/// repeatedly against successive `DescribeRouteTables` snapshots.
#[derive(Clone)]
pub struct CompiledFinder {
    predicate: Predicate,
    pub no_results_ok: bool,
}

impl CompiledFinder {
    /// Select every table in `tables` that the finder keeps.
    pub fn select<'a>(&self, tables: &'a [CloudRouteTable]) -> Vec<&'a CloudRouteTable> {
        let ctx = FilterContext::build(tables);
        tables.iter().filter(|t| (self.predicate)(t, &ctx)).collect()
    }
}

impl RouteTableFindSpec {
    /// Compile this node (and its children) into a [`CompiledFinder`].
    ///
    /// Errors are aggregated across the whole tree rather than returned on
    /// the first failure (spec §4.1).
    pub fn compile(&self) -> Result<CompiledFinder, Vec<FinderError>> {
        let predicate = self.compile_predicate()?;
        Ok(CompiledFinder {
            predicate,
            no_results_ok: self.no_results_ok,
        })
    }

    fn compile_predicate(&self) -> Result<Predicate, Vec<FinderError>> {
        let inner = self.compile_inner()?;
        if self.not {
            Ok(Arc::new(move |t: &CloudRouteTable, ctx: &FilterContext| !inner(t, ctx)))
        } else {
            Ok(inner)
        }
    }

    fn compile_inner(&self) -> Result<Predicate, Vec<FinderError>> {
        match self.type_.as_str() {
            "main" => Ok(Arc::new(|t: &CloudRouteTable, _ctx: &FilterContext| t.is_main())),

            "subnet" => {
                let subnet_id = require_str(&self.config, "subnet", "subnet_id").map_err(|e| vec![e])?;
                Ok(Arc::new(move |t: &CloudRouteTable, ctx: &FilterContext| {
                    t.is_associated_with_subnet(&subnet_id)
                        || (t.is_main() && !ctx.subnets_with_explicit_association.contains(&subnet_id))
                }))
            }

            "by_tag" => {
                let key = require_str(&self.config, "by_tag", "key");
                let value = require_str(&self.config, "by_tag", "value");
                let (key, value) = match (key, value) {
                    (Ok(k), Ok(v)) => (k, v),
                    (k, v) => {
                        let mut errs = Vec::new();
                        if let Err(e) = k {
                            errs.push(e);
                        }
                        if let Err(e) = v {
                            errs.push(e);
                        }
                        return Err(errs);
                    }
                };
                Ok(Arc::new(move |t: &CloudRouteTable, _ctx: &FilterContext| {
                    t.tag(&key) == Some(value.as_str())
                }))
            }

            "by_tag_regexp" => {
                let key = require_str(&self.config, "by_tag_regexp", "key").map_err(|e| vec![e])?;
                let pattern = require_str(&self.config, "by_tag_regexp", "regexp").map_err(|e| vec![e])?;
                let re = Regex::new(&pattern).map_err(|e| {
                    vec![FinderError::InvalidRegex {
                        pattern: pattern.clone(),
                        message: e.to_string(),
                    }]
                })?;
                Ok(Arc::new(move |t: &CloudRouteTable, _ctx: &FilterContext| {
                    t.tag(&key).map(|v| re.is_match(v)).unwrap_or(false)
                }))
            }

            "has_route_to" => {
                let cidr_str = require_str(&self.config, "has_route_to", "cidr").map_err(|e| vec![e])?;
                let cidr: IpNetwork = cidr_str.parse().map_err(|e: ipnetwork::IpNetworkError| {
                    vec![FinderError::InvalidCidr {
                        cidr: cidr_str.clone(),
                        message: e.to_string(),
                    }]
                })?;
                let via_igw = optional_bool(&self.config, "via_igw");
                let via_instance = optional_bool(&self.config, "via_instance");
                let not_active = optional_bool(&self.config, "not_active");
                Ok(Arc::new(move |t: &CloudRouteTable, _ctx: &FilterContext| {
                    t.routes.iter().any(|r| {
                        r.destination == cidr
                            && (!via_igw || r.next_hop.is_gateway())
                            && (!via_instance || r.next_hop.instance_id().is_some())
                            && (!not_active || !r.state.is_active())
                    })
                }))
            }

            "and" => {
                let children = require_filters(&self.config, "and").map_err(|e| vec![e])?;
                let mut compiled = Vec::with_capacity(children.len());
                let mut errs = Vec::new();
                for child in &children {
                    match child.compile_predicate() {
                        Ok(p) => compiled.push(p),
                        Err(e) => errs.extend(e),
                    }
                }
                if !errs.is_empty() {
                    return Err(errs);
                }
                Ok(Arc::new(move |t: &CloudRouteTable, ctx: &FilterContext| {
                    compiled.iter().all(|p| p(t, ctx))
                }))
            }

            "or" => {
                let children = require_filters(&self.config, "or").map_err(|e| vec![e])?;
                let mut compiled = Vec::with_capacity(children.len());
                let mut errs = Vec::new();
                for child in &children {
                    match child.compile_predicate() {
                        Ok(p) => compiled.push(p),
                        Err(e) => errs.extend(e),
                    }
                }
                if !errs.is_empty() {
                    return Err(errs);
                }
                Ok(Arc::new(move |t: &CloudRouteTable, ctx: &FilterContext| {
                    compiled.iter().any(|p| p(t, ctx))
                }))
            }

            other => Err(vec![FinderError::UnknownType(other.to_string())]),
        }
    }
}
