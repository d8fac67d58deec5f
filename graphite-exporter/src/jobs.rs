//! Derives the refresh jobs of custom metrics from the configuration.
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::collector::CustomMetricCollector;
use crate::common::ConfigError;
use crate::config::Config;

/// Convenience type for the future returned by a [`JobFn`].
pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A zero-argument callback run by the scheduler on every tick.
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// A refresh callback and how often to run it.
#[derive(Clone)]
pub struct Job {
    /// Name of the metric the job refreshes.
    pub name: String,
    /// Seconds between two runs.
    pub interval_secs: u64,
    /// The refresh itself.
    pub callback: JobFn,
}

impl Job {
    /// Seconds between two runs, as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Runs the callback once.
    pub fn run(&self) -> JobFuture {
        (self.callback)()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("interval_secs", &self.interval_secs)
            .finish_non_exhaustive()
    }
}

/// Builds one refresh job per custom metric of `config`, bound to `collector`.
///
/// Failed refreshes are logged; the collector keeps exposing the previous values until a later
/// run succeeds.
///
/// # Errors
///
/// Returns an error if a metric's interval or timeout cannot be parsed.
pub fn generate_jobs(
    config: &Config,
    collector: &CustomMetricCollector,
) -> Result<Vec<Job>, ConfigError> {
    let mut jobs = Vec::with_capacity(config.metrics.len());
    for metric in config.resolve()? {
        info!(name = %metric.name, url = %metric.url_path, "gen custom metric");

        let name = metric.name.clone();
        let interval_secs = metric.interval_secs;
        let metric = Arc::new(metric);
        let collector = collector.clone();
        let callback: JobFn = Arc::new(move || -> JobFuture {
            let collector = collector.clone();
            let metric = Arc::clone(&metric);
            Box::pin(async move {
                match collector.refresh(&metric).await {
                    Ok(series) => debug!(metric = %metric.family_name, series, "refreshed custom metric"),
                    Err(e) => warn!(
                        metric = %metric.family_name,
                        error = %e,
                        "failed to refresh custom metric, keeping the last known values",
                    ),
                }
            })
        });

        jobs.push(Job { name, interval_secs, callback });
    }

    Ok(jobs)
}
