use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tracing::{debug, warn};

use super::{CollectFuture, Collector, GaugeFamily};
use crate::client::{GraphiteClient, SeriesResult};
use crate::config::render_path;

/// A built-in metric, fetched with one aliased graphite query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemMetric {
    /// Help text of the exposed gauge.
    pub doc: String,
    /// Graphite target expression. It must alias its result to the catalog name.
    pub query: String,
}

impl SystemMetric {
    /// Creates a new [`SystemMetric`].
    pub fn new<D: Into<String>, Q: Into<String>>(doc: D, query: Q) -> Self {
        Self { doc: doc.into(), query: query.into() }
    }
}

/// The set of built-in metrics that can be exposed, keyed by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemCatalog {
    /// Prefix of every exposed metric name.
    pub prefix: String,
    /// Start of the render window, relative to now.
    pub from: String,
    /// End of the render window, relative to now.
    pub until: String,
    /// Catalog entries, in exposition order.
    pub metrics: IndexMap<String, SystemMetric>,
}

impl SystemCatalog {
    /// Creates an empty catalog.
    pub fn new<P: Into<String>>(prefix: P, from: &str, until: &str) -> Self {
        Self {
            prefix: prefix.into(),
            from: from.to_owned(),
            until: until.to_owned(),
            metrics: IndexMap::new(),
        }
    }

    /// Adds an entry to the catalog.
    #[must_use]
    pub fn with_metric<N: Into<String>>(mut self, name: N, metric: SystemMetric) -> Self {
        self.metrics.insert(name.into(), metric);
        self
    }

    /// The carbon self-instrumentation metrics, aggregated across every carbon agent.
    pub fn carbon() -> Self {
        let entries = [
            ("carbon_update_operations", "all carbon agents update operations", "sumSeries", "updateOperations"),
            ("carbon_metrics_received", "all carbon agents metrics received", "sumSeries", "metricsReceived"),
            ("carbon_committed_points", "all carbon agents committed points", "sumSeries", "committedPoints"),
            ("carbon_points_per_update", "all carbon agents carbon points per update", "sumSeries", "pointsPerUpdate"),
            ("carbon_cpu_usage", "all carbon agents cpu usage", "averageSeries", "cpuUsage"),
            ("carbon_creates", "all carbon agents creates", "sumSeries", "creates"),
        ];

        entries.into_iter().fold(
            SystemCatalog::new("graphite", "-2min", "-1min"),
            |catalog, (name, doc, aggregate, stat)| {
                let query = format!("alias({aggregate}(carbon.agents.*.{stat})%2C'{name}')");
                catalog.with_metric(name, SystemMetric::new(doc, query))
            },
        )
    }

    /// Names of every entry, in catalog order.
    pub fn names(&self) -> Vec<String> {
        self.metrics.keys().cloned().collect()
    }
}

impl Default for SystemCatalog {
    fn default() -> Self {
        SystemCatalog::carbon()
    }
}

/// Exposes built-in metrics, fetched from graphite on every scrape.
pub struct SystemMetricCollector {
    client: Arc<GraphiteClient>,
    catalog: SystemCatalog,
    url_path: String,
    timeout: Option<Duration>,
}

impl SystemMetricCollector {
    /// Creates a collector for the entries of `catalog` named in `allowed`.
    ///
    /// Every allowed metric is fetched by a single request. Names that are not in the catalog are
    /// logged and ignored. Returns `None` if no allowed name is in the catalog.
    pub fn new<I, S>(client: Arc<GraphiteClient>, catalog: SystemCatalog, allowed: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut selected = IndexMap::new();
        for name in allowed {
            let name = name.as_ref();
            match catalog.metrics.get_full(name) {
                Some((index, _, metric)) => {
                    selected.insert(index, metric.query.clone());
                }
                None => warn!(metric = name, "unknown system metric, ignoring"),
            }
        }
        if selected.is_empty() {
            return None;
        }

        // Request the metrics in catalog order, regardless of the order they were allowed in.
        selected.sort_keys();
        let url_path =
            render_path(&catalog.from, &catalog.until, selected.values().map(String::as_str));

        Some(Self { client, catalog, url_path, timeout: None })
    }

    /// Sets a request timeout overriding the client's default.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The render path requested on every scrape.
    pub fn url_path(&self) -> &str {
        &self.url_path
    }

    /// Turns a render response into one unlabeled gauge per recognized series.
    pub fn families(&self, series: Vec<SeriesResult>) -> Vec<GaugeFamily> {
        series
            .into_iter()
            .filter_map(|s| match self.catalog.metrics.get(&s.target) {
                Some(metric) => Some(GaugeFamily::unlabeled(
                    format!("{}_{}", self.catalog.prefix, s.target),
                    metric.doc.clone(),
                    s.latest_value(),
                )),
                None => {
                    debug!(series = %s.target, "series does not match a system metric, skipping");
                    None
                }
            })
            .collect()
    }
}

impl Collector for SystemMetricCollector {
    fn collect(&self) -> CollectFuture<'_> {
        Box::pin(async move {
            match self.client.request(&self.url_path, self.timeout).await {
                Ok(series) => self.families(series),
                Err(e) => {
                    warn!(error = %e, "failed to fetch system metrics, skipping them for this scrape");
                    Vec::new()
                }
            }
        })
    }
}
