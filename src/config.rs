//! Relay configuration.
//!
//! Configuration comes from the environment; every knob has a default that
//! yields a loopback relay on the standard port.
//!
//! | Variable | Effect | Default |
//! |----------|--------|---------|
//! | `CDP_RELAY_PORT` | Listen port | 19988 |
//! | `CDP_RELAY_HOST` | Bind address | 127.0.0.1 |
//! | `CDP_RELAY_AUTH_TOKEN` | Token required on every request | unset |
//! | `CDP_RELAY_LOG_FILE` | Log destination (stderr when unset) | unset |
//! | `CDP_RELAY_SEPARATE_WINDOW` | Ask the extension for a separate window | off |
//!
//! Non-loopback binds are refused unless an auth token is configured; the
//! token is compared in constant time on every upgrade.

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default relay port.
pub const DEFAULT_PORT: u16 = 19988;

/// Default bind address (loopback).
pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Crate version served by `/version` and matched by the supervisor.
pub const RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// RelayConfig
// ============================================================================

/// Runtime configuration of a relay instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen port.
    pub port: u16,

    /// Bind address.
    pub host: IpAddr,

    /// Auth token required from clients, compared in constant time.
    pub auth_token: Option<String>,

    /// Log file path; stderr when unset.
    pub log_file: Option<PathBuf>,

    /// Ask the extension to keep automated pages in a separate window.
    pub separate_window: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: DEFAULT_HOST,
            auth_token: None,
            log_file: None,
            separate_window: false,
        }
    }
}

impl RelayConfig {
    /// Builds a configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a set variable fails to parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = non_empty_var("CDP_RELAY_PORT") {
            config.port = raw
                .parse()
                .map_err(|_| Error::config(format!("invalid CDP_RELAY_PORT: {raw}")))?;
        }
        if let Some(raw) = non_empty_var("CDP_RELAY_HOST") {
            config.host = raw
                .parse()
                .map_err(|_| Error::config(format!("invalid CDP_RELAY_HOST: {raw}")))?;
        }
        config.auth_token = non_empty_var("CDP_RELAY_AUTH_TOKEN");
        config.log_file = non_empty_var("CDP_RELAY_LOG_FILE").map(PathBuf::from);
        config.separate_window = non_empty_var("CDP_RELAY_SEPARATE_WINDOW")
            .map(|raw| matches!(raw.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a non-loopback bind without an auth
    /// token.
    pub fn validate(&self) -> Result<()> {
        if !self.host.is_loopback() && self.auth_token.is_none() {
            return Err(Error::config(
                "refusing non-loopback bind without CDP_RELAY_AUTH_TOKEN",
            ));
        }
        Ok(())
    }

    /// Returns the HTTP base URL of this relay.
    #[must_use]
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", display_host(self.host), self.port)
    }

    /// Returns the WebSocket base URL of this relay.
    #[must_use]
    pub fn ws_base(&self) -> String {
        format!("ws://{}:{}", display_host(self.host), self.port)
    }
}

/// Formats an address for URLs, bracketing IPv6.
fn display_host(host: IpAddr) -> String {
    match host {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.host.is_loopback());
        assert!(config.auth_token.is_none());
        assert!(!config.separate_window);
    }

    #[test]
    fn test_http_base_format() {
        let config = RelayConfig::default();
        assert_eq!(config.http_base(), format!("http://127.0.0.1:{DEFAULT_PORT}"));
        assert_eq!(config.ws_base(), format!("ws://127.0.0.1:{DEFAULT_PORT}"));
    }

    #[test]
    fn test_ipv6_host_is_bracketed() {
        let config = RelayConfig {
            host: "::1".parse().expect("ipv6"),
            ..RelayConfig::default()
        };
        assert_eq!(config.http_base(), format!("http://[::1]:{DEFAULT_PORT}"));
    }

    #[test]
    fn test_non_loopback_requires_token() {
        let config = RelayConfig {
            host: "0.0.0.0".parse().expect("ipv4"),
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            auth_token: Some("secret".into()),
            ..config
        };
        assert!(config.validate().is_ok());
    }
}
