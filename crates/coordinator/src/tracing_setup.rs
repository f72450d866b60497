use ai_agent_common::LoggingConfig;
use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Install the global subscriber; `RUST_LOG` overrides `level`
pub fn init_tracing_with_level(level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level '{}'", level))?;

    let registry = Registry::default().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_line_number(false),
            )
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }

    info!("Tracing initialized at level {}", level);
    Ok(())
}

pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    init_tracing_with_level(&config.level, config.json)
}
