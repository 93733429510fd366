//! Tracing subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Install the global subscriber. `RUST_LOG` takes precedence over the configured filter.
pub fn init(config: &LoggingConfig) -> Result<(), BoxError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if config.json {
        builder.json().try_init()?;
    } else {
        builder.try_init()?;
    }
    Ok(())
}
