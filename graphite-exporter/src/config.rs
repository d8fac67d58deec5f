//! Metric configuration.
//!
//! The configuration is a YAML document with a `global` section of defaults and a `metrics`
//! sequence of custom metric definitions:
//!
//! ```yaml
//! global:
//!   prefix: graphite
//!   interval: 1m
//!   from: -2min
//!   until: -1min
//!   timeout: 5s
//! metrics:
//!   - name: dau
//!     metric: example.*.*.dau
//!     doc: daily active users
//!     labels:
//!       service: ${1}
//!       region: ${2}
//!     interval: 30s
//! ```
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use indexmap::IndexMap;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Deserializer};

use crate::common::{metric_family_name, valid_metric_name_component, ConfigError};
use crate::interval::{parse_duration, parse_interval};

const DEFAULT_PREFIX: &str = "graphite";
const DEFAULT_INTERVAL: &str = "60s";
const DEFAULT_FROM: &str = "-2min";
const DEFAULT_UNTIL: &str = "-1min";

/// Characters escaped in query parameter values. `%` is left alone so that targets can carry
/// their own escapes, such as `%2C`.
const QUERY_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'&')
    .add(b'+')
    .add(b'<')
    .add(b'>')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'|');

/// Defaults shared by every metric.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GlobalConfig {
    /// Prefix of every exposed metric name.
    pub prefix: String,
    /// Default polling interval.
    #[serde(deserialize_with = "deserialize_spec")]
    pub interval: String,
    /// Default start of the render window, relative to now.
    pub from: String,
    /// Default end of the render window, relative to now.
    pub until: String,
    /// Default request timeout. When absent, the client's own timeout applies.
    #[serde(deserialize_with = "deserialize_optional_spec")]
    pub timeout: Option<String>,
}

impl GlobalConfig {
    /// The default request timeout, if one is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the timeout cannot be parsed or is zero.
    pub fn timeout(&self) -> Result<Option<Duration>, ConfigError> {
        self.timeout.as_deref().map(parse_timeout).transpose()
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_owned(),
            interval: DEFAULT_INTERVAL.to_owned(),
            from: DEFAULT_FROM.to_owned(),
            until: DEFAULT_UNTIL.to_owned(),
            timeout: None,
        }
    }
}

/// A single custom metric definition.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct MetricConfig {
    /// Name of the metric, appended to the global prefix.
    pub name: String,
    /// The graphite target expression. Characters not allowed in a query string are escaped.
    pub metric: String,
    /// Help text of the exposed gauge.
    #[serde(default)]
    pub doc: String,
    /// Label templates, keyed by label name.
    #[serde(default)]
    pub labels: IndexMap<String, String>,
    /// Polling interval, overriding the global one.
    #[serde(default, deserialize_with = "deserialize_optional_spec")]
    pub interval: Option<String>,
    /// Start of the render window, overriding the global one.
    #[serde(default)]
    pub from: Option<String>,
    /// End of the render window, overriding the global one.
    #[serde(default)]
    pub until: Option<String>,
    /// Request timeout, overriding the global one.
    #[serde(default, deserialize_with = "deserialize_optional_spec")]
    pub timeout: Option<String>,
}

/// A metric definition with every global default applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedMetric {
    /// Name of the metric, used as the cache key.
    pub name: String,
    /// Full exposed metric name, `{prefix}_{name}` with `-` replaced by `_`.
    pub family_name: String,
    /// Help text of the exposed gauge.
    pub doc: String,
    /// Label templates, keyed by label name.
    pub labels: IndexMap<String, String>,
    /// The render path, including the query string, requested from graphite-web.
    pub url_path: String,
    /// Polling interval, in seconds.
    pub interval_secs: u64,
    /// Request timeout, if any.
    pub timeout: Option<Duration>,
}

impl ResolvedMetric {
    /// Polling interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// The complete metric configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Defaults shared by every metric.
    pub global: GlobalConfig,
    /// Custom metric definitions, in declaration order.
    pub metrics: Vec<MetricConfig>,
}

impl Config {
    /// Loads and validates the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, cannot be parsed, or fails
    /// [validation](Config::validate).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_yaml_str(&contents)
    }

    /// Parses and validates a YAML configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be parsed or fails [validation](Config::validate).
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every interval and timeout parses, that every metric name can be exposed, and
    /// that metric names are unique.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.global.timeout()?;

        let mut seen = HashSet::with_capacity(self.metrics.len());
        for metric in &self.metrics {
            if !valid_metric_name_component(&metric.name) {
                return Err(ConfigError::InvalidMetricName(metric.name.clone()));
            }
            if !seen.insert(metric.name.as_str()) {
                return Err(ConfigError::DuplicateMetric(metric.name.clone()));
            }
            metric.resolve(&self.global)?;
        }

        Ok(())
    }

    /// Resolves every metric definition against the global defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an interval or timeout cannot be parsed.
    pub fn resolve(&self) -> Result<Vec<ResolvedMetric>, ConfigError> {
        self.metrics.iter().map(|metric| metric.resolve(&self.global)).collect()
    }
}

impl MetricConfig {
    /// Applies the global defaults to this definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the effective interval or timeout cannot be parsed, or if either is
    /// zero.
    pub fn resolve(&self, global: &GlobalConfig) -> Result<ResolvedMetric, ConfigError> {
        let interval_secs = parse_interval(self.interval.as_deref().unwrap_or(""), &global.interval)?;
        if interval_secs == 0 {
            return Err(ConfigError::InvalidInterval {
                value: self.interval.clone().unwrap_or_else(|| global.interval.clone()),
                reason: "polling interval must be at least one second",
            });
        }

        let timeout = match self.timeout.as_deref() {
            Some(spec) => Some(parse_timeout(spec)?),
            None => global.timeout()?,
        };

        let from = self.from.as_deref().unwrap_or(&global.from);
        let until = self.until.as_deref().unwrap_or(&global.until);

        Ok(ResolvedMetric {
            name: self.name.clone(),
            family_name: metric_family_name(&global.prefix, &self.name),
            doc: self.doc.clone(),
            labels: self.labels.clone(),
            url_path: render_path(from, until, [self.metric.as_str()]),
            interval_secs,
            timeout,
        })
    }
}

fn parse_timeout(spec: &str) -> Result<Duration, ConfigError> {
    let timeout = parse_duration(spec, "")?;
    if timeout.is_zero() {
        return Err(ConfigError::InvalidInterval {
            value: spec.to_owned(),
            reason: "request timeout must be at least one second",
        });
    }
    Ok(timeout)
}

/// Builds a graphite-web render path requesting JSON for every target in `targets`.
///
/// Characters that cannot appear in a query string are percent-encoded. Existing `%XX` escapes
/// are kept as they are.
pub fn render_path<'a, I>(from: &str, until: &str, targets: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut path = format!(
        "/render?format=json&from={}&until={}",
        utf8_percent_encode(from, QUERY_VALUE),
        utf8_percent_encode(until, QUERY_VALUE)
    );
    for target in targets {
        path.push_str("&target=");
        path.extend(utf8_percent_encode(target, QUERY_VALUE));
    }
    path
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSpec {
    Seconds(u64),
    Text(String),
}

impl From<RawSpec> for String {
    fn from(raw: RawSpec) -> Self {
        match raw {
            RawSpec::Seconds(secs) => secs.to_string(),
            RawSpec::Text(text) => text,
        }
    }
}

fn deserialize_spec<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawSpec::deserialize(deserializer).map(String::from)
}

fn deserialize_optional_spec<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RawSpec>::deserialize(deserializer).map(|raw| raw.map(String::from))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{render_path, Config, GlobalConfig};
    use crate::common::ConfigError;

    const EXAMPLE: &str = r#"
global:
  prefix: example
  interval: 1m
  from: -3min
  until: -1min
  timeout: 5
metrics:
  - name: dau
    metric: example.*.*.dau
    doc: daily active users
    labels:
      service: ${1}
      region: ${2}
    interval: 30s
  - name: user-total
    metric: sumSeries(example.*.*.user)
    doc: registered users
    interval: 120
    from: -10min
    timeout: 2s
"#;

    #[test]
    fn test_parse_example() {
        let config = Config::from_yaml_str(EXAMPLE).unwrap();

        assert_eq!(config.global.prefix, "example");
        assert_eq!(config.global.interval, "1m");
        assert_eq!(config.global.timeout.as_deref(), Some("5"));
        assert_eq!(config.metrics.len(), 2);
        assert_eq!(config.metrics[0].labels["service"], "${1}");
        assert_eq!(config.metrics[1].interval.as_deref(), Some("120"));
    }

    #[test]
    fn test_resolve_applies_overrides_and_defaults() {
        let config = Config::from_yaml_str(EXAMPLE).unwrap();
        let resolved = config.resolve().unwrap();

        let dau = &resolved[0];
        assert_eq!(dau.family_name, "example_dau");
        assert_eq!(dau.interval_secs, 30);
        assert_eq!(dau.timeout, Some(Duration::from_secs(5)));
        assert_eq!(dau.url_path, "/render?format=json&from=-3min&until=-1min&target=example.*.*.dau");

        let total = &resolved[1];
        assert_eq!(total.family_name, "example_user_total");
        assert_eq!(total.interval(), Duration::from_secs(120));
        assert_eq!(total.timeout, Some(Duration::from_secs(2)));
        assert_eq!(
            total.url_path,
            "/render?format=json&from=-10min&until=-1min&target=sumSeries(example.*.*.user)"
        );
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml_str("metrics:\n  - name: a\n    metric: a.b\n").unwrap();

        assert_eq!(config.global, GlobalConfig::default());
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved[0].family_name, "graphite_a");
        assert_eq!(resolved[0].interval_secs, 60);
        assert_eq!(resolved[0].timeout, None);
        assert_eq!(resolved[0].doc, "");
        assert!(resolved[0].labels.is_empty());
    }

    #[test]
    fn test_rejects_unknown_interval_unit() {
        let result = Config::from_yaml_str("metrics:\n  - name: a\n    metric: a\n    interval: 3d\n");
        assert!(matches!(result, Err(ConfigError::InvalidInterval { .. })));

        let result = Config::from_yaml_str("global:\n  interval: 1w\nmetrics:\n  - name: a\n    metric: a\n");
        assert!(matches!(result, Err(ConfigError::InvalidInterval { .. })));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let result = Config::from_yaml_str("metrics:\n  - name: a\n    metric: a\n    interval: 0\n");
        assert!(matches!(result, Err(ConfigError::InvalidInterval { .. })));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let result = Config::from_yaml_str("metrics:\n  - name: a\n    metric: a\n    timeout: 0\n");
        assert!(matches!(result, Err(ConfigError::InvalidInterval { value, .. }) if value == "0"));

        let result = Config::from_yaml_str("global:\n  timeout: 0s\nmetrics:\n  - name: a\n    metric: a\n");
        assert!(matches!(result, Err(ConfigError::InvalidInterval { .. })));

        // Checked even when no metric falls back on it.
        let result = Config::from_yaml_str("global:\n  timeout: 0\n");
        assert!(matches!(result, Err(ConfigError::InvalidInterval { .. })));
    }

    #[test]
    fn test_rejects_invalid_names() {
        let result = Config::from_yaml_str("metrics:\n  - name: a.b\n    metric: a\n");
        assert!(matches!(result, Err(ConfigError::InvalidMetricName(name)) if name == "a.b"));

        let result =
            Config::from_yaml_str("metrics:\n  - name: a\n    metric: a\n  - name: a\n    metric: b\n");
        assert!(matches!(result, Err(ConfigError::DuplicateMetric(name)) if name == "a"));
    }

    #[test]
    fn test_rejects_bad_schema() {
        let result = Config::from_yaml_str("metrics:\n  - doc: missing name and metric\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/graphite-exporter.yaml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_render_path_multiple_targets() {
        let path = render_path("-2min", "-1min", ["a.b", "alias(c.d%2C'e')"]);
        assert_eq!(path, "/render?format=json&from=-2min&until=-1min&target=a.b&target=alias(c.d%2C'e')");
    }

    #[test]
    fn test_render_path_escapes_query_characters() {
        let path = render_path(
            "-2min",
            "-1min",
            ["alias(sumSeries(example.*.*.dau), 'total users')", "example.app1.\"x\".dau"],
        );
        assert_eq!(
            path,
            concat!(
                "/render?format=json&from=-2min&until=-1min",
                "&target=alias(sumSeries(example.*.*.dau),%20'total%20users')",
                "&target=example.app1.%22x%22.dau",
            )
        );
        assert!(path.parse::<hyper::Uri>().is_ok());

        // Globs and existing escapes pass through.
        let path = render_path("-1h", "now", ["example.{app1,app2}.[0-9].dau&x", "a%2Cb"]);
        assert_eq!(
            path,
            "/render?format=json&from=-1h&until=now&target=example.{app1,app2}.[0-9].dau%26x&target=a%2Cb"
        );
    }
}
