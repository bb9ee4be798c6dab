//! Logging setup.
//!
//! Console output only: an [`EnvFilter`] built from `RUST_LOG` when set,
//! otherwise from the configured level, feeding a fmt layer.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `RUST_LOG` nor a configured level parses.
pub const DEFAULT_FILTER: &str = "info";

/// Build the filter for `level`, letting `RUST_LOG` win.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!(level, "logging initialized");
    Ok(())
}
