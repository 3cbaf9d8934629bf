//! Broker configuration.
//!
//! Loaded from an optional TOML file passed with `-c/--config`; every setting
//! has a sensible default so the broker runs with no file at all.

use std::net::SocketAddr;

use serde::Deserialize;

/// Default maximum packet size (1MB).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,
    /// Server configuration.
    pub server: ServerConfig,
    /// Limits configuration.
    pub limits: LimitsConfig,
    /// Session configuration.
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1883".parse().expect("default bind address"),
        }
    }
}

/// Limits configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum total packet size in bytes (0 = unlimited).
    pub max_packet_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Close connections idle past 1.5x their advertised keep-alive.
    pub enforce_keep_alive: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enforce_keep_alive: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind.port(), 1883);
        assert_eq!(config.limits.max_packet_size, DEFAULT_MAX_PACKET_SIZE);
        assert!(config.session.enforce_keep_alive);
        assert_eq!(config.log.level, "info");
    }
}
