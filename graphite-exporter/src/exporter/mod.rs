//! HTTP scrape endpoint and the builder wiring collectors to it.
use std::future::Future;
use std::io;
use std::pin::Pin;

use thiserror::Error as ThisError;

/// Error types possible from an exporter.
#[derive(Debug, ThisError)]
pub enum ExporterError {
    /// The HTTP listener stopped accepting connections.
    #[error("HTTP listener failed: {0}")]
    HttpListener(#[from] io::Error),
}

/// Convenience type for Future implementing an exporter.
pub type ExporterFuture = Pin<Box<dyn Future<Output = Result<(), ExporterError>> + Send + 'static>>;

mod http_listener;

mod builder;
pub use self::builder::{GraphiteExporter, GraphiteExporterBuilder};
