// ABOUTME: Environment-driven configuration for the ship and offshore binaries
// ABOUTME: Invalid values are fatal at startup, mapped to a non-zero exit code

use crate::codec::DEFAULT_MAX_FRAME_LEN;
use crate::error::{ProxyError, Result};
use std::env;
use std::time::Duration;

pub const DEFAULT_SHIP_PORT: u16 = 8080;
pub const DEFAULT_OFFSHORE_PORT: u16 = 9999;

/// Ship node configuration.
#[derive(Debug, Clone)]
pub struct ShipConfig {
    /// Port the local HTTP proxy server listens on (`SHIP_PROXY_PORT`).
    pub listen_port: u16,
    /// Offshore node to hold the link to (`OFFSHORE_HOST`, required).
    pub offshore_host: String,
    /// Offshore link port (`OFFSHORE_PORT`).
    pub offshore_port: u16,
    /// Delay between reconnect attempts after the link drops.
    pub reconnect_delay: Duration,
    /// Bound on a transaction's total time, queue wait included. A
    /// transaction past it fails as `UpstreamUnavailable` (502 to the
    /// client) instead of sitting queued forever on a dead link.
    pub request_timeout: Duration,
    /// Frame payload cap enforced by this side's decoder.
    pub max_frame_len: u32,
}

impl ShipConfig {
    pub fn from_env() -> Result<Self> {
        let offshore_host = env::var("OFFSHORE_HOST")
            .map_err(|_| ProxyError::Config("OFFSHORE_HOST is required".into()))?;
        Ok(ShipConfig {
            listen_port: parse_port("SHIP_PROXY_PORT", env_value("SHIP_PROXY_PORT"), DEFAULT_SHIP_PORT)?,
            offshore_host,
            offshore_port: parse_port("OFFSHORE_PORT", env_value("OFFSHORE_PORT"), DEFAULT_OFFSHORE_PORT)?,
            reconnect_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(60),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        })
    }
}

/// Offshore node configuration.
#[derive(Debug, Clone)]
pub struct OffshoreConfig {
    /// Port the link listener binds (`OFFSHORE_PORT`).
    pub listen_port: u16,
    /// Frame payload cap enforced by this side's decoder.
    pub max_frame_len: u32,
}

impl OffshoreConfig {
    pub fn from_env() -> Result<Self> {
        Ok(OffshoreConfig {
            listen_port: parse_port("OFFSHORE_PORT", env_value("OFFSHORE_PORT"), DEFAULT_OFFSHORE_PORT)?,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        })
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_port(name: &str, raw: Option<String>, default: u16) -> Result<u16> {
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u16>()
            .map_err(|_| ProxyError::Config(format!("{name} is not a valid port: {raw:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_defaults_when_unset() {
        assert_eq!(parse_port("X", None, 8080).unwrap(), 8080);
    }

    #[test]
    fn parse_port_accepts_valid_values() {
        assert_eq!(parse_port("X", Some("9999".into()), 1).unwrap(), 9999);
        assert_eq!(parse_port("X", Some(" 80 ".into()), 1).unwrap(), 80);
    }

    #[test]
    fn parse_port_rejects_garbage() {
        assert!(matches!(
            parse_port("X", Some("not-a-port".into()), 1),
            Err(ProxyError::Config(_))
        ));
        assert!(matches!(
            parse_port("X", Some("70000".into()), 1),
            Err(ProxyError::Config(_))
        ));
    }
}
