use skywatch_config::{LogFormat, LoggingConfig};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::AnalysisError;

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
/// Returns `false` when a subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool, AnalysisError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|err| {
            AnalysisError::Message(format!("invalid log level '{}': {err}", config.level))
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_ansi(false))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
    };

    Ok(installed.is_ok())
}
