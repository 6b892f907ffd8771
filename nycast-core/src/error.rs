//! Error types for the reconciliation and healthcheck engine.
//!
//! Each layer gets its own leaf `thiserror` enum rather than one catch-all,
//! mirroring the `ClientError`/`ProviderError` split in the teacher SDK:
//! callers match on the narrowest type that can occur at their layer.

use thiserror::Error;

/// Errors raised while loading or validating the YAML configuration tree.
///
/// Config and route-spec validation both accumulate every problem they
/// find rather than stopping at the first one, so `Aggregate` is the
/// common case once a config file has more than one mistake in it.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{0}")]
    Invalid(String),

    #[error("{} validation error(s) found", .0.len())]
    Aggregate(Vec<ConfigError>),
}

impl ConfigError {
    /// Flatten a list of errors into a single `ConfigError`, matching the
    /// Go source's `multierror.Append(...).ErrorOrNil()` pattern: `None`
    /// (`Ok(())`) when the list is empty, the single error unwrapped when
    /// there's exactly one, otherwise an `Aggregate`.
    pub fn from_many(mut errors: Vec<ConfigError>) -> Option<ConfigError> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(ConfigError::Aggregate(errors)),
        }
    }
}

/// Errors compiling a [`crate::finder::RouteTableFindSpec`] into a predicate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FinderError {
    #[error("unknown route table finder type '{0}'")]
    UnknownType(String),

    #[error("missing required config key '{key}' for finder type '{finder_type}'")]
    MissingKey { finder_type: String, key: String },

    #[error("invalid regular expression '{pattern}' for finder type by_tag_regexp: {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("'{0}' finder requires a non-empty 'filters' list")]
    EmptyFilters(String),

    #[error("could not parse cidr '{cidr}' in has_route_to finder: {message}")]
    InvalidCidr { cidr: String, message: String },
}

/// Errors surfaced by the cloud `RouteTableApi` boundary.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("cloud API call {operation} failed: {message}")]
    Api { operation: String, message: String },

    #[error("no network interface with source/destination check disabled was found for instance {instance_id}")]
    NoRouterNic { instance_id: String },
}

/// Errors from a single reconciliation pass over one `(table, spec)` pair.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Fatal errors that abort the daemon before it can enter its main loop.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to fetch instance metadata: {0}")]
    Metadata(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("this instance is not a router: no network interface has source/destination checking disabled")]
    NotARouter,

    #[error("error during initial route table reconciliation: {0}")]
    InitialRun(#[from] CloudError),
}
