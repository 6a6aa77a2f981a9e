//! Upstream target addressing.

use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default port of the upstream telemetry source.
pub const DEFAULT_UPSTREAM_PORT: u16 = 6667;

/// Address of the upstream telemetry source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpstreamTarget {
    /// Hostname or IP address (IPv6 without brackets).
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl UpstreamTarget {
    /// Create a target from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse an operator-supplied address.
    ///
    /// Accepts `host`, `host:port`, `[v6]`, `[v6]:port`, a bare IPv6 literal,
    /// or any of those behind a `ws://` scheme. `default_port` is used when
    /// the address carries none.
    pub fn parse(address: &str, default_port: u16) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(Error::InvalidTarget("address must not be empty".to_string()));
        }

        let rest = match address.split_once("://") {
            Some(("ws", rest)) => rest,
            Some((scheme, _)) => {
                return Err(Error::InvalidTarget(format!(
                    "unsupported scheme '{}', only ws:// is supported",
                    scheme
                )));
            }
            None => address,
        };
        let rest = rest.trim_end_matches('/');

        if rest.contains('/') {
            return Err(Error::InvalidTarget(format!(
                "'{}' must not contain a path",
                address
            )));
        }

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(|| {
                Error::InvalidTarget(format!("unterminated IPv6 literal in '{}'", address))
            })?;
            let port = match tail {
                "" => default_port,
                tail => match tail.strip_prefix(':') {
                    Some(port) => parse_port(port, address)?,
                    None => {
                        return Err(Error::InvalidTarget(format!(
                            "unexpected '{}' after IPv6 literal",
                            tail
                        )));
                    }
                },
            };
            (host.to_string(), port)
        } else if rest.parse::<Ipv6Addr>().is_ok() {
            (rest.to_string(), default_port)
        } else if let Some((host, port)) = rest.rsplit_once(':') {
            (host.to_string(), parse_port(port, address)?)
        } else {
            (rest.to_string(), default_port)
        };

        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(Error::InvalidTarget(format!(
                "invalid host in '{}'",
                address
            )));
        }

        Ok(Self { host, port })
    }

    /// WebSocket URL for this target.
    pub fn url(&self) -> String {
        if self.host.contains(':') {
            format!("ws://[{}]:{}", self.host, self.port)
        } else {
            format!("ws://{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url())
    }
}

fn parse_port(port: &str, address: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(Error::InvalidTarget(format!(
            "invalid port '{}' in '{}'",
            port, address
        ))),
        Ok(port) => Ok(port),
    }
}
