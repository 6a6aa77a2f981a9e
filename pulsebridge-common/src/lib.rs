//! PulseBridge Common Library
//!
//! This crate provides shared types and utilities for the PulseBridge relay:
//!
//! - [`telemetry`] - Reading data model (`TelemetrySample`)
//! - [`protocol`] - Upstream and downstream wire messages
//! - [`target`] - Upstream address parsing
//! - [`config`] - Logging configuration
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod protocol;
pub mod target;
pub mod telemetry;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig};
pub use error::{Error, Result};
pub use protocol::{ClientMessage, InboundFrame, OutboundFrame, ServerMessage};
pub use target::{DEFAULT_UPSTREAM_PORT, UpstreamTarget};
pub use telemetry::{DEFAULT_UNIT, TelemetrySample, current_iso_timestamp, iso_timestamp};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// Logs go to stderr so stdout stays free for the console front end.
/// `RUST_LOG`, when set, takes precedence over the configured level.
///
/// # Example
///
/// ```ignore
/// use pulsebridge_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
