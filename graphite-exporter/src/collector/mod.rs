//! Collectors turn graphite series into gauge families at scrape time.
use std::future::Future;
use std::pin::Pin;

use indexmap::IndexMap;

mod cache;
pub use self::cache::{MetricCache, SeriesSample};

mod custom;
pub use self::custom::CustomMetricCollector;

mod system;
pub use self::system::{SystemCatalog, SystemMetric, SystemMetricCollector};

/// Convenience type for the future returned by [`Collector::collect`].
pub type CollectFuture<'a> = Pin<Box<dyn Future<Output = Vec<GaugeFamily>> + Send + 'a>>;

/// A source of gauge families, polled by the registry on every scrape.
///
/// Collecting must not fail: a collector that cannot produce data for a scrape yields fewer, or
/// no, families.
pub trait Collector: Send + Sync {
    /// Produces the current gauge families.
    fn collect(&self) -> CollectFuture<'_>;
}

/// A named gauge with one sample per label set.
#[derive(Clone, Debug, PartialEq)]
pub struct GaugeFamily {
    /// Metric name.
    pub name: String,
    /// Help text.
    pub help: String,
    /// Samples, in the order they will be rendered.
    pub samples: Vec<GaugeSample>,
}

/// A single reading of a gauge.
#[derive(Clone, Debug, PartialEq)]
pub struct GaugeSample {
    /// Labels of this reading.
    pub labels: IndexMap<String, String>,
    /// The reading, if there is one.
    pub value: Option<f64>,
}

impl GaugeFamily {
    /// Creates an empty family.
    pub fn new<N: Into<String>, H: Into<String>>(name: N, help: H) -> Self {
        Self { name: name.into(), help: help.into(), samples: Vec::new() }
    }

    /// Creates a family holding a single unlabeled sample.
    pub fn unlabeled<N: Into<String>, H: Into<String>>(name: N, help: H, value: Option<f64>) -> Self {
        let mut family = Self::new(name, help);
        family.add_sample(IndexMap::new(), value);
        family
    }

    /// Adds a sample.
    pub fn add_sample(&mut self, labels: IndexMap<String, String>, value: Option<f64>) {
        self.samples.push(GaugeSample { labels, value });
    }
}
