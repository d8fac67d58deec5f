use std::sync::Arc;

use tracing::debug_span;

use super::{CollectFuture, Collector, GaugeFamily, MetricCache, SeriesSample};
use crate::client::{GraphiteClient, SeriesResult};
use crate::common::{metric_family_name, BackendError};
use crate::config::ResolvedMetric;
use crate::labels::apply_label_templates;

/// Exposes user-defined metrics from a cache that scheduled refreshes keep up to date.
///
/// Refreshing and collecting are independent: [`refresh`](Self::refresh) is driven by the
/// scheduler and is the only writer of the cache, while [`collect`](Collector::collect) only ever
/// reads a snapshot of it and never talks to graphite.
#[derive(Clone)]
pub struct CustomMetricCollector {
    prefix: String,
    client: Arc<GraphiteClient>,
    cache: Arc<MetricCache>,
}

impl CustomMetricCollector {
    /// Creates a collector with an empty cache.
    pub fn new<P: Into<String>>(prefix: P, client: Arc<GraphiteClient>) -> Self {
        Self { prefix: prefix.into(), client, cache: Arc::new(MetricCache::new()) }
    }

    /// The cache shared between refreshes and scrapes.
    pub fn cache(&self) -> &Arc<MetricCache> {
        &self.cache
    }

    /// Fetches the latest series of `metric` and stores them in the cache.
    ///
    /// On failure, the cache is left as it was, so the previous values of `metric` keep being
    /// exposed.
    ///
    /// ## Errors
    ///
    /// Returns the backend error if the series could not be fetched.
    pub async fn refresh(&self, metric: &ResolvedMetric) -> Result<usize, BackendError> {
        let series = self.client.request(&metric.url_path, metric.timeout).await?;
        Ok(self.store(metric, series))
    }

    /// Stores already fetched series of `metric` in the cache, returning how many were stored.
    pub fn store(&self, metric: &ResolvedMetric, series: Vec<SeriesResult>) -> usize {
        let _span = debug_span!("store", metric = %metric.name).entered();

        let samples = series
            .into_iter()
            .map(|s| SeriesSample {
                value: s.latest_value(),
                labels: apply_label_templates(&s.target, &metric.labels),
                doc: metric.doc.clone(),
                target: s.target,
            })
            .collect::<Vec<_>>();

        let stored = samples.len();
        self.cache.store(&metric.name, samples);
        stored
    }

    /// Renders the cached samples as gauge families, one per metric with at least one series.
    pub fn families(&self) -> Vec<GaugeFamily> {
        self.cache
            .snapshot()
            .into_iter()
            .filter_map(|(name, targets)| {
                let help = targets.values().next()?.doc.clone();
                let mut family = GaugeFamily::new(metric_family_name(&self.prefix, &name), help);
                for sample in targets.values() {
                    family.add_sample(sample.labels.clone(), sample.value);
                }
                Some(family)
            })
            .collect()
    }
}

impl Collector for CustomMetricCollector {
    fn collect(&self) -> CollectFuture<'_> {
        let families = self.families();
        Box::pin(async move { families })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use indexmap::IndexMap;

    use super::CustomMetricCollector;
    use crate::client::{decode_series, ClientSettings, GraphiteClient, NULL_SENTINEL};
    use crate::collector::Collector;
    use crate::config::ResolvedMetric;

    fn collector() -> CustomMetricCollector {
        let client = GraphiteClient::new(ClientSettings::default()).unwrap();
        CustomMetricCollector::new("example", Arc::new(client))
    }

    fn metric(name: &str) -> ResolvedMetric {
        let mut labels = IndexMap::new();
        labels.insert("service".to_owned(), "${1}".to_owned());
        labels.insert("region".to_owned(), "${2}".to_owned());

        ResolvedMetric {
            name: name.to_owned(),
            family_name: format!("example_{name}"),
            doc: "daily active users".to_owned(),
            labels,
            url_path: "/render?format=json&target=example.*.*.dau".to_owned(),
            interval_secs: 60,
            timeout: Some(Duration::from_secs(1)),
        }
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(future)
    }

    const RESPONSE: &[u8] = br#"[
        {"target": "example.app1.US_East.dau", "datapoints": [[3.0, 1], [7.0, 2], [null, 3]]},
        {"target": "example.app2.Asia_Pacific.dau", "datapoints": [[null, 1], [null, 2]]}
    ]"#;

    #[test]
    fn test_store_caches_newest_non_null_value() {
        let collector = collector();
        let stored = collector.store(&metric("region-dau"), decode_series(RESPONSE).unwrap());
        assert_eq!(stored, 2);

        let cache = collector.cache();
        let app1 = cache.get("region-dau", "example.app1.US_East.dau").unwrap();
        assert_eq!(app1.value, Some(7.0));
        assert_eq!(app1.labels["service"], "app1");
        assert_eq!(app1.labels["region"], "US_East");
        assert_eq!(app1.doc, "daily active users");

        let app2 = cache.get("region-dau", "example.app2.Asia_Pacific.dau").unwrap();
        assert_eq!(app2.value, Some(NULL_SENTINEL));
    }

    #[test]
    fn test_collect_renders_one_family_per_metric() {
        let collector = collector();
        collector.store(&metric("region-dau"), decode_series(RESPONSE).unwrap());

        let families = block_on(collector.collect());
        assert_eq!(families.len(), 1);

        let family = &families[0];
        assert_eq!(family.name, "example_region_dau");
        assert_eq!(family.help, "daily active users");
        assert_eq!(family.samples.len(), 2);
        assert_eq!(family.samples[0].labels["service"], "app1");
        assert_eq!(family.samples[0].value, Some(7.0));
        assert_eq!(family.samples[1].labels["region"], "Asia_Pacific");
        assert_eq!(family.samples[1].value, Some(-1.0));
    }

    #[test]
    fn test_metric_without_refresh_emits_nothing() {
        let collector = collector();
        collector.store(&metric("empty"), Vec::new());

        assert!(block_on(collector.collect()).is_empty());
    }

    #[test]
    fn test_collect_is_idempotent() {
        let collector = collector();
        collector.store(&metric("region-dau"), decode_series(RESPONSE).unwrap());

        let first = block_on(collector.collect());
        let second = block_on(collector.collect());
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_datapoints_are_cached_without_value() {
        let collector = collector();
        let series = decode_series(br#"[{"target": "example.app3.x.dau", "datapoints": []}]"#).unwrap();
        collector.store(&metric("dau"), series);

        let families = block_on(collector.collect());
        assert_eq!(families[0].samples[0].value, None);
    }
}
