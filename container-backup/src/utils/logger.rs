//! Logging configuration using tracing.
//!
//! Log lines go to stderr. Stdout is reserved for command output so that
//! `list` and `dry-run` can be piped.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Fallback when neither `RUST_LOG` nor the configured level parses.
const DEFAULT_DIRECTIVE: &str = "info";

/// Install the global subscriber. `RUST_LOG` wins over `level`.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
    };

    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry().with(filter).with(fmt).try_init()?;
    Ok(())
}

