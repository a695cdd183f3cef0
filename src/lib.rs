//! jmx-collector library
//!
//! Periodically collects JMX attributes from a set of instances, selected by
//! declarative include/exclude configurations, and reports them as metric
//! points (gauges as-is, everything else as per-second rates).

pub mod app;
pub mod attribute;
pub mod bean;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod filter;
pub mod instance;
pub mod matcher;
pub mod metric;
pub mod processor;
pub mod reporter;
pub mod server;
pub mod value;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

/// Initialize the logging subsystem
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error)
/// * `format` - Plain text or one JSON object per line
///
/// # Errors
/// Returns an error if the logging system fails to initialize
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}
