//! Log subscriber setup for binaries and examples built on the engine.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Result;

/// Installs the global subscriber. The level comes from `RUST_LOG` (default `info`), the
/// format (`pretty` or `json`) from `LOG_FORMAT`. Output goes to stderr so reports written
/// to stdout stay clean.
pub fn setup_logging() -> Result<()> {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_owned());

    if format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }
    tracing::debug!(%format, "Logging initialized.");
    Ok(())
}
