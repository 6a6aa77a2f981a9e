//! Configuration for the relay.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pulsebridge_common::{DEFAULT_UPSTREAM_PORT, LoggingConfig};

/// Largest accepted backoff multiplier.
pub const MAX_MULTIPLIER: f64 = 10.0;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Upstream link settings.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Reconnect backoff settings.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Downstream server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Upstream link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Host of the telemetry source. May also be given on the command line.
    #[serde(default)]
    pub host: Option<String>,

    /// Port of the telemetry source (default: 6667).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Interval between keepalive frames (seconds).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Interval between WebSocket pings sent to the source (seconds).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Silence after which a connected source is considered dead (seconds).
    /// Any inbound frame, pongs included, counts as traffic.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Timeout for a single connection attempt (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Time allowed for the close handshake when tearing a link down (seconds).
    #[serde(default = "default_close_timeout")]
    pub close_timeout_secs: u64,

    /// Largest inbound message accepted from the source (bytes).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_port() -> u16 {
    DEFAULT_UPSTREAM_PORT
}

fn default_heartbeat_interval() -> u64 {
    15
}

fn default_ping_interval() -> u64 {
    20
}

fn default_idle_timeout() -> u64 {
    40
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_close_timeout() -> u64 {
    5
}

fn default_max_message_size() -> usize {
    1 << 20
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            ping_interval_secs: default_ping_interval(),
            idle_timeout_secs: default_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            close_timeout_secs: default_close_timeout(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// Reconnect backoff configuration.
///
/// The first retry waits `base_delay_ms`; each further consecutive failure
/// multiplies the delay by `multiplier`, capped at `max_delay_ms`. A
/// multiplier of 1.0 gives a fixed retry cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_base_delay() -> u64 {
    5_000
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    1.5
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

/// Downstream server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (default: "127.0.0.1:20888").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path of the WebSocket endpoint (default: "/ws").
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Shared secret viewers must present.
    #[serde(default)]
    pub access_code: String,

    /// Outbound frames queued per viewer before it is dropped as too slow.
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
}

fn default_listen() -> String {
    "127.0.0.1:20888".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_send_buffer() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ws_path: default_ws_path(),
            access_code: String::new(),
            send_buffer: default_send_buffer(),
        }
    }
}

/// Timing and sizing of the upstream link, resolved from configuration.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub heartbeat_interval: Duration,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
    pub max_message_size: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        RelayConfig::default().link_settings()
    }
}

impl RelayConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// The upstream host and the access code may come from the command line,
    /// so they are checked separately by [`RelayConfig::validate_complete`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.port == 0 {
            return Err(ConfigError::Validation("upstream.port must be > 0".to_string()));
        }

        if self.upstream.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "heartbeat_interval_secs must be > 0".to_string(),
            ));
        }

        if self.upstream.ping_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "ping_interval_secs must be > 0".to_string(),
            ));
        }

        if self.upstream.idle_timeout_secs <= self.upstream.ping_interval_secs {
            return Err(ConfigError::Validation(
                "idle_timeout_secs must be > ping_interval_secs".to_string(),
            ));
        }

        if self.upstream.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "connect_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.upstream.max_message_size == 0 {
            return Err(ConfigError::Validation(
                "max_message_size must be > 0".to_string(),
            ));
        }

        if self.reconnect.base_delay_ms == 0 {
            return Err(ConfigError::Validation(
                "base_delay_ms must be > 0".to_string(),
            ));
        }

        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ConfigError::Validation(
                "max_delay_ms must be >= base_delay_ms".to_string(),
            ));
        }

        let multiplier = self.reconnect.multiplier;
        if !multiplier.is_finite() || !(1.0..=MAX_MULTIPLIER).contains(&multiplier) {
            return Err(ConfigError::Validation(format!(
                "multiplier must be between 1.0 and {}",
                MAX_MULTIPLIER
            )));
        }

        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.server.listen
            )));
        }

        if !self.server.ws_path.starts_with('/') || self.server.ws_path == "/" {
            return Err(ConfigError::Validation(
                "WebSocket path must start with / and must not be /".to_string(),
            ));
        }

        if self.server.send_buffer == 0 {
            return Err(ConfigError::Validation(
                "send_buffer must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Validate fields that command-line overrides may have filled in.
    pub fn validate_complete(&self) -> Result<(), ConfigError> {
        self.validate()?;

        match self.upstream.host.as_deref().map(str::trim) {
            None | Some("") => {
                return Err(ConfigError::Validation(
                    "upstream host must be set (upstream.host or --host)".to_string(),
                ));
            }
            Some(_) => {}
        }

        if self.server.access_code.is_empty() {
            return Err(ConfigError::Validation(
                "server.access_code must be set".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve the durations used by the link supervisor.
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            heartbeat_interval: Duration::from_secs(self.upstream.heartbeat_interval_secs),
            ping_interval: Duration::from_secs(self.upstream.ping_interval_secs),
            idle_timeout: Duration::from_secs(self.upstream.idle_timeout_secs),
            connect_timeout: Duration::from_secs(self.upstream.connect_timeout_secs),
            close_timeout: Duration::from_secs(self.upstream.close_timeout_secs),
            max_message_size: self.upstream.max_message_size,
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            multiplier: self.reconnect.multiplier,
        }
    }
}
