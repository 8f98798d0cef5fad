//! Shared logging utilities for Stevedore binaries.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "stevedore=info,stevedore_worker=info,stevedore_db=info";

/// Logging configuration shared by Stevedore binaries.
pub struct LogConfig<'a> {
    /// Explicit level override (`error|warn|info|debug|trace`); `None` defers
    /// to `RUST_LOG` or the built-in default filter.
    pub level: Option<&'a str>,
    /// Emit one JSON object per line instead of the human format.
    pub json: bool,
}

/// Initialize tracing for a process. Call once, early.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let filter = match config.level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .init();

    Ok(())
}
