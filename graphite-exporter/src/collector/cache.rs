use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

/// The latest reading of one series of a custom metric.
#[derive(Clone, Debug, PartialEq)]
pub struct SeriesSample {
    /// The raw, dot-delimited series name.
    pub target: String,
    /// Newest non-null value of the series, if any.
    pub value: Option<f64>,
    /// Labels derived from the target.
    pub labels: IndexMap<String, String>,
    /// Help text of the metric.
    pub doc: String,
}

type Targets = IndexMap<String, Arc<SeriesSample>>;

/// Point-in-time copy of a [`MetricCache`], keyed by metric name and then by series target.
pub type CacheSnapshot = IndexMap<String, Arc<IndexMap<String, Arc<SeriesSample>>>>;

/// Latest sample per series, per custom metric.
///
/// Refreshes write whole batches of samples under a short write lock; readers take a
/// [snapshot](MetricCache::snapshot) which shares the per-metric maps with the cache instead of
/// copying them. A writer that updates a metric whose map is held by a snapshot clones that map
/// first, so a snapshot never changes after it was taken and never shows half of a batch.
///
/// Entries are never removed: a series that stops reporting keeps its last known value.
#[derive(Debug, Default)]
pub struct MetricCache {
    metrics: RwLock<IndexMap<String, Arc<Targets>>>,
}

impl MetricCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `samples` for `metric`, replacing the previous sample of each target.
    pub fn store(&self, metric: &str, samples: Vec<SeriesSample>) {
        let samples =
            samples.into_iter().map(|s| (s.target.clone(), Arc::new(s))).collect::<Vec<_>>();
        if samples.is_empty() {
            return;
        }

        let mut metrics = self.metrics.write();
        let targets = metrics.entry(metric.to_owned()).or_default();
        Arc::make_mut(targets).extend(samples);
    }

    /// Returns a consistent copy of the whole cache.
    pub fn snapshot(&self) -> CacheSnapshot {
        self.metrics.read().clone()
    }

    /// Returns the cached sample of `target` for `metric`.
    pub fn get(&self, metric: &str, target: &str) -> Option<Arc<SeriesSample>> {
        self.metrics.read().get(metric).and_then(|targets| targets.get(target).cloned())
    }

    /// Number of metrics with at least one cached series.
    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    /// Whether no metric has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }
}
