//! Aggregation of collectors into a single scrape payload.
use std::sync::Arc;

use parking_lot::RwLock;

use crate::collector::{Collector, GaugeFamily};
use crate::formatting::{
    sanitize_metric_name, write_help_line, write_metric_line, write_type_line,
};

/// Something collectors can be registered with.
pub trait MetricsRegistry {
    /// Adds a collector. It is polled on every subsequent scrape.
    fn register(&self, collector: Arc<dyn Collector>);
}

/// Polls every registered collector and renders the result in the Prometheus text format.
///
/// Cloning a `Registry` is cheap and every clone shares the same collectors.
#[derive(Clone, Default)]
pub struct Registry {
    collectors: Arc<RwLock<Vec<Arc<dyn Collector>>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered collectors.
    pub fn len(&self) -> usize {
        self.collectors.read().len()
    }

    /// Whether no collector has been registered.
    pub fn is_empty(&self) -> bool {
        self.collectors.read().is_empty()
    }

    /// Collects the gauge families of every collector, in registration order.
    pub async fn gather(&self) -> Vec<GaugeFamily> {
        // Never hold the lock across a collector, which may be waiting on graphite.
        let collectors = self.collectors.read().clone();

        let mut families = Vec::new();
        for collector in collectors {
            families.extend(collector.collect().await);
        }
        families
    }

    /// Renders every collector's gauge families.
    pub async fn render(&self) -> String {
        render_families(&self.gather().await)
    }
}

impl MetricsRegistry for Registry {
    fn register(&self, collector: Arc<dyn Collector>) {
        self.collectors.write().push(collector);
    }
}

/// Renders gauge families in the Prometheus text format. Families without samples are skipped.
pub fn render_families(families: &[GaugeFamily]) -> String {
    let mut output = String::new();

    for family in families {
        if family.samples.is_empty() {
            continue;
        }

        let name = sanitize_metric_name(&family.name);
        if !family.help.is_empty() {
            write_help_line(&mut output, &name, &family.help);
        }
        write_type_line(&mut output, &name, "gauge");
        for sample in &family.samples {
            write_metric_line(&mut output, &name, &sample.labels, sample.value);
        }
        output.push('\n');
    }

    output
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use indexmap::IndexMap;

    use super::{render_families, MetricsRegistry, Registry};
    use crate::collector::{CollectFuture, Collector, GaugeFamily};

    struct Fixed(Vec<GaugeFamily>);

    impl Collector for Fixed {
        fn collect(&self) -> CollectFuture<'_> {
            let families = self.0.clone();
            Box::pin(async move { families })
        }
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(future)
    }

    #[test]
    fn test_render_families() {
        let mut dau = GaugeFamily::new("example_dau", "daily active users");
        let mut labels = IndexMap::new();
        labels.insert("service".to_owned(), "app1".to_owned());
        dau.add_sample(labels, Some(12.0));
        let mut labels = IndexMap::new();
        labels.insert("service".to_owned(), "app2".to_owned());
        dau.add_sample(labels, None);

        let cpu = GaugeFamily::unlabeled("graphite_carbon_cpu_usage", "", Some(0.25));
        let empty = GaugeFamily::new("example_empty", "never refreshed");

        let rendered = render_families(&[dau, cpu, empty]);
        let expected = concat!(
            "# HELP example_dau daily active users\n",
            "# TYPE example_dau gauge\n",
            "example_dau{service=\"app1\"} 12\n",
            "example_dau{service=\"app2\"} NaN\n",
            "\n",
            "# TYPE graphite_carbon_cpu_usage gauge\n",
            "graphite_carbon_cpu_usage 0.25\n",
            "\n",
        );
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_registry_renders_collectors_in_order() {
        let registry = Registry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(Fixed(vec![GaugeFamily::unlabeled("b", "second", Some(2.0))])));
        registry.register(Arc::new(Fixed(vec![])));
        registry.register(Arc::new(Fixed(vec![GaugeFamily::unlabeled("a", "third", Some(1.0))])));
        assert_eq!(registry.len(), 3);

        let rendered = block_on(registry.render());
        assert_eq!(
            rendered,
            "# HELP b second\n# TYPE b gauge\nb 2\n\n# HELP a third\n# TYPE a gauge\na 1\n\n"
        );
    }

    #[test]
    fn test_render_sanitizes_names() {
        let rendered =
            render_families(&[GaugeFamily::unlabeled("my-prefix.dau", "d", Some(1.0))]);
        assert!(rendered.contains("my_prefix_dau 1\n"));
    }
}
