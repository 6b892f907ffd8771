//! Reconciliation and healthcheck engine for the anycast route failover
//! agent.
//!
//! This crate holds everything that can be tested without talking to a
//! real cloud API or a real instance-metadata service: the finder
//! algebra, route-spec validation, the reconciliation decision table,
//! the healthcheck debounce state machine, and the remote-healthcheck
//! dispatcher. `nycast-agent` supplies the concrete `RouteTableApi`,
//! `MetadataFetcher`, and `HealthChecker` implementations and wires
//! everything into a running daemon.

pub mod cloud;
pub mod common;
pub mod config;
pub mod eni_cache;
pub mod error;
pub mod finder;
pub mod healthcheck;
pub mod metadata;
pub mod models;
pub mod reconciler;
pub mod remote_healthcheck;
pub mod route_spec;

#[cfg(any(test, feature = "test-support"))]
pub mod fakes;
