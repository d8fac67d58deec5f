use std::io;
use std::path::PathBuf;
use std::time::Duration;

use hyper::StatusCode;
use thiserror::Error as ThisError;

use crate::formatting::valid_metric_name_character;

/// Errors that could occur while loading or validating the metric configuration.
#[derive(Debug, ThisError)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read metric config {}: {source}", path.display())]
    Io {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid YAML, or does not match the expected schema.
    #[error("failed to parse metric config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// An interval or timeout could not be turned into a number of seconds.
    #[error("invalid interval `{value}`: {reason}")]
    InvalidInterval {
        /// The offending interval specification.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A metric name cannot be used as part of a Prometheus metric name.
    #[error("metric name `{0}` is not a valid metric name component")]
    InvalidMetricName(String),

    /// Two metrics share the same name.
    #[error("metric `{0}` is defined more than once")]
    DuplicateMetric(String),
}

/// Errors that could occur while querying graphite-web.
#[derive(Debug, ThisError)]
pub enum BackendError {
    /// The request URI could not be built from the host and render path.
    #[error("invalid graphite URI `{uri}`: {reason}")]
    InvalidUri {
        /// The URI that failed to parse.
        uri: String,
        /// Why it failed to parse.
        reason: String,
    },

    /// The request could not be sent, or the connection failed mid-flight.
    #[error("error sending request to graphite: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    /// The request did not complete within the configured timeout.
    #[error("graphite request timed out after {0:?}")]
    Timeout(Duration),

    /// graphite-web answered with a non-success status.
    #[error("graphite unavailable, status: {status}")]
    Unavailable {
        /// Status returned by graphite-web.
        status: StatusCode,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The response body could not be read.
    #[error("failed to read graphite response body: {0}")]
    Body(#[from] hyper::Error),

    /// The response body was not the expected JSON document.
    #[error("failed to decode graphite response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl BackendError {
    /// Whether retrying the same request may succeed.
    ///
    /// Only transport failures and timeouts are transient: graphite-web answering with an error
    /// status, or with a body we cannot decode, will not change on an immediate retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Request(_) | BackendError::Timeout(_))
    }
}

/// Errors that could occur while building the exporter.
#[derive(Debug, ThisError)]
pub enum BuildError {
    /// No graphite-web hosts were given.
    #[error("at least one graphite host is required")]
    NoBackendHosts,

    /// The exporter was built outside of a Tokio runtime.
    #[error("exporter must be built from within a Tokio runtime: {0}")]
    NoRuntime(String),

    /// Binding/listening to the given address did not succeed.
    #[error("failed to create HTTP listener: {0}")]
    FailedToCreateHTTPListener(String),

    /// The given address could not be parsed successfully as an IP address/subnet.
    #[error("failed to parse address as a valid IP address/subnet: {0}")]
    InvalidAllowlistAddress(String),

    /// The metric configuration was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Builds the exposed metric family name for a custom metric.
pub fn metric_family_name(prefix: &str, name: &str) -> String {
    format!("{}_{}", prefix, name.replace('-', "_"))
}

/// Whether `name` can follow `{prefix}_` in a metric name once `-` is replaced by `_`.
pub(crate) fn valid_metric_name_component(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c == '-' || valid_metric_name_character(c))
}
