//! Exposes graphite series as Prometheus gauges.
//!
//! Custom metrics are declared in a YAML [`Config`]: each one is a graphite target that is
//! refreshed in the background at its own interval, and whose series become labeled samples of a
//! single gauge family. A catalog of built-in carbon metrics is fetched on every scrape instead.
//!
//! ```no_run
//! use graphite_exporter::{ClientSettings, Config, GraphiteExporterBuilder};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = tokio::runtime::Runtime::new()?;
//! runtime.block_on(async {
//!     let config = Config::load("metrics.yaml")?;
//!     let (_exporter, future) = GraphiteExporterBuilder::new()
//!         .with_client_settings(ClientSettings::default())
//!         .with_config(config)
//!         .build()?;
//!     future.await?;
//!     Ok(())
//! })
//! # }
//! ```
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(broken_intra_doc_links))]
mod common;
pub use self::common::{metric_family_name, BackendError, BuildError, ConfigError};

pub mod client;
pub use self::client::{ClientSettings, GraphiteClient, SeriesResult};

pub mod collector;

pub mod config;
pub use self::config::Config;

mod exporter;
pub use self::exporter::{ExporterError, ExporterFuture, GraphiteExporter, GraphiteExporterBuilder};

pub mod formatting;

pub mod interval;

pub mod jobs;

pub mod labels;

pub mod registry;

pub mod scheduler;
