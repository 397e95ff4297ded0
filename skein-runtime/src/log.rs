//! Logging Infrastructure
//!
//! The runtime reports through the `tracing` macros with structured fields
//! (`fiber_id`, `scope_id`, `layer_id`, `worker`, `attempt`). Nothing is
//! printed unless a subscriber is installed; [`init_tracing`] installs the
//! standard `tracing-subscriber` formatter.
//!
//! The `SKEIN_LOG` environment variable, when set, is parsed as an
//! `EnvFilter` directive and overrides the configured level:
//!
//! ```text
//! SKEIN_LOG=skein_runtime::stm=trace,info
//! ```

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat};

/// Environment variable holding filter directives.
pub const LOG_FILTER_ENV: &str = "SKEIN_LOG";

/// Failure to install the global subscriber.
#[derive(Debug, Error)]
pub enum LogInitError {
    /// A global subscriber was already set.
    #[error("failed to install tracing subscriber: {0}")]
    AlreadyInstalled(String),
}

/// Build the filter for `config`, honoring `SKEIN_LOG`.
pub fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(config.level.as_str()))
}

/// Install a global `tracing` subscriber configured by `config`.
///
/// Returns an error instead of panicking when a subscriber is already
/// installed.
pub fn init_tracing(config: &LogConfig) -> Result<(), LogInitError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_thread_names(true)
        .with_file(config.source_location)
        .with_line_number(config.source_location);

    let result = match (config.format, config.timestamps) {
        (LogFormat::Plain, true) => builder.try_init(),
        (LogFormat::Plain, false) => builder.without_time().try_init(),
        (LogFormat::Json, true) => builder.json().try_init(),
        (LogFormat::Json, false) => builder.json().without_time().try_init(),
    };
    result.map_err(|err| LogInitError::AlreadyInstalled(err.to_string()))
}
