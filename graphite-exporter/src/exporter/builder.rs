use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use ipnet::IpNet;
use tokio::runtime::Handle;
use tracing::info;

use super::ExporterFuture;
use crate::client::{ClientSettings, GraphiteClient};
use crate::collector::{CustomMetricCollector, MetricCache, SystemCatalog, SystemMetricCollector};
use crate::common::BuildError;
use crate::config::Config;
use crate::jobs::generate_jobs;
use crate::registry::{MetricsRegistry, Registry};
use crate::scheduler::{Scheduler, TokioScheduler};

/// Builder for creating a graphite exporter.
pub struct GraphiteExporterBuilder {
    listen_address: SocketAddr,
    allowed_addresses: Option<Vec<IpNet>>,
    client_settings: ClientSettings,
    catalog: SystemCatalog,
    system_metrics: Option<Vec<String>>,
    config: Option<Config>,
}

/// A running exporter's registry, refresh scheduler and custom metric cache.
pub struct GraphiteExporter {
    registry: Registry,
    scheduler: TokioScheduler,
    cache: Option<Arc<MetricCache>>,
    local_address: SocketAddr,
}

impl GraphiteExporter {
    /// The registry every collector was registered with.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The scheduler driving custom metric refreshes.
    pub fn scheduler(&self) -> &TokioScheduler {
        &self.scheduler
    }

    /// The custom metric cache, if a metric configuration was given.
    pub fn cache(&self) -> Option<&Arc<MetricCache>> {
        self.cache.as_ref()
    }

    /// The address the HTTP listener is bound to.
    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    /// Renders the current scrape payload, as the HTTP listener would.
    pub async fn render(&self) -> String {
        self.registry.render().await
    }
}

impl GraphiteExporterBuilder {
    /// Creates a new [`GraphiteExporterBuilder`].
    pub fn new() -> Self {
        Self {
            listen_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 9108),
            allowed_addresses: None,
            client_settings: ClientSettings::default(),
            catalog: SystemCatalog::carbon(),
            system_metrics: None,
            config: None,
        }
    }

    /// Sets the address of the HTTP scrape endpoint.
    ///
    /// The HTTP listener that is spawned answers `GET /health` with `OK`, and every other path
    /// with the rendered metrics.
    ///
    /// Defaults to `0.0.0.0:9108`.
    #[must_use]
    pub fn with_http_listener(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.listen_address = addr.into();
        self
    }

    /// Adds an IP address or subnet to the allowlist for the scrape endpoint.
    ///
    /// If a client makes a request to the scrape endpoint and their IP is not present in the
    /// allowlist, either directly or within any of the allowed subnets, they will receive a 403
    /// Forbidden response.
    ///
    /// Defaults to allowing all IPs.
    ///
    /// ## Errors
    ///
    /// If the given address cannot be parsed into an IP address or subnet, an error variant will be
    /// returned describing the error.
    pub fn add_allowed_address<A>(mut self, address: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        use std::str::FromStr;

        let address = IpNet::from_str(address.as_ref())
            .or_else(|_| IpAddr::from_str(address.as_ref()).map(IpNet::from))
            .map_err(|e| BuildError::InvalidAllowlistAddress(e.to_string()))?;
        self.allowed_addresses.get_or_insert_with(Vec::new).push(address);

        Ok(self)
    }

    /// Sets how graphite-web is reached.
    ///
    /// Defaults to a single host, `127.0.0.1:5000`.
    #[must_use]
    pub fn with_client_settings(mut self, settings: ClientSettings) -> Self {
        self.client_settings = settings;
        self
    }

    /// Sets the catalog of built-in metrics.
    ///
    /// Defaults to [`SystemCatalog::carbon`].
    #[must_use]
    pub fn with_catalog(mut self, catalog: SystemCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Restricts the built-in metrics that are exposed. An empty list disables them.
    ///
    /// Defaults to every metric in the catalog.
    #[must_use]
    pub fn with_system_metrics<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.system_metrics = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the custom metric configuration.
    ///
    /// Defaults to no custom metrics.
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Builds the exporter, schedules the custom metric refreshes and binds the HTTP listener.
    ///
    /// The returned future serves scrapes until it is dropped; it must be polled for the endpoint
    /// to answer. Refreshes run on the current Tokio runtime independently of that future.
    ///
    /// ## Errors
    ///
    /// If there is no current Tokio runtime, if the configuration is invalid, or if the listener
    /// cannot be bound, an error variant will be returned describing the error.
    pub fn build(self) -> Result<(GraphiteExporter, ExporterFuture), BuildError> {
        let handle = Handle::try_current().map_err(|e| BuildError::NoRuntime(e.to_string()))?;
        let client = Arc::new(GraphiteClient::new(self.client_settings)?);
        let registry = Registry::new();
        let scheduler = TokioScheduler::new(handle);

        // Built-in metrics share the configured default timeout with custom ones.
        let timeout = match &self.config {
            Some(config) => config.global.timeout()?,
            None => None,
        };

        let allowed = self.system_metrics.unwrap_or_else(|| self.catalog.names());
        if allowed.is_empty() {
            info!("system metrics disabled");
        } else {
            info!(metrics = ?allowed, "init system metrics");
            match SystemMetricCollector::new(Arc::clone(&client), self.catalog, &allowed) {
                Some(collector) => registry.register(Arc::new(collector.with_timeout(timeout))),
                None => info!("no known system metric selected"),
            }
        }

        let mut cache = None;
        if let Some(config) = self.config {
            let collector = CustomMetricCollector::new(config.global.prefix.clone(), client);
            let jobs = generate_jobs(&config, &collector)?;
            info!(metrics = jobs.len(), "registering custom metrics");

            cache = Some(Arc::clone(collector.cache()));
            registry.register(Arc::new(collector));
            scheduler.schedule_all(jobs);
        }

        let (local_address, exporter) = super::http_listener::new_http_listener(
            registry.clone(),
            self.listen_address,
            self.allowed_addresses,
        )?;
        info!(%local_address, "graphite exporter listening");

        Ok((GraphiteExporter { registry, scheduler, cache, local_address }, exporter))
    }
}

impl Default for GraphiteExporterBuilder {
    fn default() -> Self {
        GraphiteExporterBuilder::new()
    }
}
