//! Tracing bootstrap
//!
//! Pretty output for development, JSON for production, with an optional
//! append-only log file. A `RUST_LOG` environment variable overrides the
//! configured level.

use anyhow::Context;
use std::fs::File;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber from configuration.
///
/// Fails on an unknown level or an unwritable log file; both are
/// configuration mistakes worth surfacing at startup rather than
/// swallowing.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| level_filter(&config.level))?;
    let registry = tracing_subscriber::registry().with(filter);

    let file = match &config.file_path {
        Some(path) => Some(open_log_file(path)?),
        None => None,
    };

    match (config.format.as_str(), file) {
        ("json", Some(file)) => {
            registry
                .with(fmt::layer().json().with_target(true).with_writer(file))
                .init();
        }
        ("json", None) => {
            registry.with(fmt::layer().json().with_target(true)).init();
        }
        (_, Some(file)) => {
            registry.with(fmt::layer().pretty().with_writer(file)).init();
        }
        (_, None) => {
            registry.with(fmt::layer().pretty()).init();
        }
    }

    Ok(())
}

fn level_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let level: Level = level
        .parse()
        .map_err(|_| anyhow::anyhow!("Unknown log level: {level}"))?;
    Ok(EnvFilter::new(level.to_string()))
}

fn open_log_file(path: &str) -> anyhow::Result<Arc<File>> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Cannot open log file {path}"))?;
    Ok(Arc::new(file))
}
