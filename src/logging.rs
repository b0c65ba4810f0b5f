//! Diagnostic logging setup.
//!
//! Diagnostics go to stderr so command output on stdout stays parseable.
//! `RUST_LOG` wins over the configured level unless an explicit level was
//! passed on the command line.

use crate::config::LogFormat;
use anyhow::{anyhow, Result};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub fn init(level: &str, explicit: bool, format: LogFormat) -> Result<()> {
    let filter = if explicit {
        EnvFilter::try_new(level)?
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let result = match format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish()),
        LogFormat::Compact => tracing::subscriber::set_global_default(builder.compact().finish()),
    };
    result.map_err(|e| anyhow!("failed to install log subscriber: {}", e))
}
