//! Logging setup.

use crate::config::LoggingConfig;
use crate::error::ConfigurationError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "telemetry_tests.rs"]
mod tests;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `config.level` when set. Output is plain text unless
/// `config.json_format` is enabled.
///
/// # Errors
///
/// [`ConfigurationError::Invalid`] if the level is not a valid filter or a
/// global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigurationError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| ConfigurationError::Invalid {
            message: format!("invalid logging level '{}': {}", config.level, e),
        })?,
    };

    let (plain, json) = if config.json_format {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .try_init()
        .map_err(|e| ConfigurationError::Invalid {
            message: format!("logging already initialised: {}", e),
        })
}
