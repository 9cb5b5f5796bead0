//! # tether-logging
//!
//! Installs the global `tracing` subscriber.
//!
//! Output always goes to **stderr**: when the engine runs over stdio, stdout
//! carries protocol frames and must stay clean.
//!
//! Filter resolution: `RUST_LOG` wins when set and valid; otherwise the
//! configured level plus per-module overrides from [`LoggingSettings`].

#![deny(unsafe_code)]

use tether_settings::{LogFormat, LoggingSettings};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Failures while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The configured directive could not be parsed.
    #[error("invalid log filter {directive:?}: {source}")]
    Filter {
        /// Directive that failed to parse.
        directive: String,
        /// Parser error.
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    /// A global subscriber was already installed.
    #[error("logging already initialised: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Build the filter: `RUST_LOG` if present, else the settings directive.
pub fn build_filter(settings: &LoggingSettings) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    filter_from_settings(settings)
}

/// Build the filter from settings alone, ignoring `RUST_LOG`.
pub fn filter_from_settings(settings: &LoggingSettings) -> Result<EnvFilter, LoggingError> {
    let directive = settings.filter_directive();
    EnvFilter::try_new(&directive).map_err(|source| LoggingError::Filter { directive, source })
}

fn stderr_layer(
    format: LogFormat,
    filter: EnvFilter,
) -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
    match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_logging(settings: &LoggingSettings) -> Result<(), LoggingError> {
    let filter = build_filter(settings)?;
    tracing_subscriber::registry()
        .with(stderr_layer(settings.format, filter))
        .try_init()?;
    tracing::debug!(level = ?settings.level, format = ?settings.format, "logging initialized");
    Ok(())
}
