//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::{Error, Result};

/// Install the global fmt subscriber
///
/// `RUST_LOG` wins over `config.level`. Fails if a global subscriber is
/// already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;

    let installed = if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };

    installed.map_err(|err| Error::Config(format!("tracing subscriber: {}", err)))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level)
        .map_err(|err| Error::Config(format!("invalid log level {:?}: {}", config.level, err)))
}
