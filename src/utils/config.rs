//! Configuration management for peerline.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "peerline.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "PEERLINE";

/// Complete configuration for a peerline node or relay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerlineConfig {
    /// Local identity
    pub identity: IdentityConfig,
    /// TCP listener and peer connection settings
    pub network: NetworkConfig,
    /// LAN presence beacon
    pub beacon: BeaconConfig,
    /// Relay-assisted global discovery
    pub global: GlobalConfig,
    /// Relay server settings
    pub relay: RelayConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Local identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name announced to other peers
    pub display_name: String,
}

/// TCP listener and peer connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host the inbox listener binds to
    pub listen_host: String,
    /// Port the inbox listener binds to (0 = OS-assigned)
    pub listen_port: u16,
    /// Outbound connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Receive poll interval for connection loops in milliseconds
    pub recv_timeout_ms: u64,
    /// Upper bound when joining background loops on shutdown
    pub join_timeout_ms: u64,
}

/// LAN presence beacon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Shared UDP discovery port
    pub port: u16,
    /// Destination for beacons
    pub broadcast_address: String,
    /// Milliseconds between beacons
    pub interval_ms: u64,
    /// Milliseconds until a silent peer is dropped
    pub peer_ttl_ms: u64,
    /// Receive timeout so the listener can observe stop requests
    pub recv_timeout_ms: u64,
}

/// Global discovery client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Whether the node should try relay-assisted discovery
    pub enabled: bool,
    /// Base URL of the relay (the client posts to `{relay_url}/api`)
    pub relay_url: String,
    /// Milliseconds between presence updates
    pub update_interval_ms: u64,
    /// Milliseconds until a relay-sourced peer is dropped locally
    pub peer_ttl_ms: u64,
    /// Per-request timeout for relay and IP-echo calls
    pub request_timeout_ms: u64,
    /// Public IP echo services, tried in order
    pub ip_echo_endpoints: Vec<String>,
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Host the relay binds to
    pub bind_host: String,
    /// Port the relay binds to
    pub port: u16,
    /// Milliseconds until a registered peer expires
    pub peer_ttl_ms: u64,
    /// Messages retained per recipient mailbox
    pub mailbox_capacity: usize,
    /// Number of lock shards for registry and mailboxes
    pub shard_count: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let display_name = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "User".to_string());
        Self { display_name }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 0,
            connect_timeout_ms: crate::defaults::CONNECT_TIMEOUT_MS,
            recv_timeout_ms: crate::defaults::RECV_TIMEOUT_MS,
            join_timeout_ms: crate::defaults::JOIN_TIMEOUT_MS,
        }
    }
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            port: crate::defaults::BEACON_PORT,
            broadcast_address: "255.255.255.255".to_string(),
            interval_ms: 2_500,
            peer_ttl_ms: 8_000,
            recv_timeout_ms: 500,
        }
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            relay_url: "http://127.0.0.1:5000".to_string(),
            update_interval_ms: 10_000,
            peer_ttl_ms: 30_000,
            request_timeout_ms: 10_000,
            ip_echo_endpoints: vec![
                "https://api.ipify.org".to_string(),
                "https://ipv4.icanhazip.com".to_string(),
                "https://checkip.amazonaws.com".to_string(),
            ],
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: crate::defaults::RELAY_PORT,
            peer_ttl_ms: 30_000,
            mailbox_capacity: 100,
            shard_count: 16,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NetworkConfig {
    /// Outbound connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Receive poll interval
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    /// Shutdown join bound
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl BeaconConfig {
    /// Interval between beacons
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Peer time-to-live
    pub fn peer_ttl(&self) -> Duration {
        Duration::from_millis(self.peer_ttl_ms)
    }

    /// Receive timeout
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

impl GlobalConfig {
    /// Interval between relay ticks
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Peer time-to-live
    pub fn peer_ttl(&self) -> Duration {
        Duration::from_millis(self.peer_ttl_ms)
    }

    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl RelayConfig {
    /// Registry entry time-to-live
    pub fn peer_ttl(&self) -> Duration {
        Duration::from_millis(self.peer_ttl_ms)
    }
}

impl PeerlineConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// An explicit path that does not exist is an error; the default
    /// locations are only consulted when no path is given.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            config = config.merge(Self::from_file(path)?);
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("peerline")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            for location in &default_locations {
                if location.exists() {
                    log::debug!("Loading configuration from {}", location.display());
                    config = config.merge(Self::from_file(location)?);
                    break;
                }
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Merge this configuration with another, preferring values from other
    pub fn merge(mut self, other: Self) -> Self {
        // Section-level replacement; `serde(default)` already filled any
        // fields the file left out.
        self.identity = other.identity;
        self.network = other.network;
        self.beacon = other.beacon;
        self.global = other.global;
        self.relay = other.relay;
        self.logging = other.logging;
        self
    }

    fn merge_from_env(mut self) -> Result<Self> {
        if let Some(name) = env_var("IDENTITY_DISPLAY_NAME") {
            self.identity.display_name = name;
        }
        if let Some(port) = env_var("NETWORK_LISTEN_PORT") {
            self.network.listen_port = parse_env("NETWORK_LISTEN_PORT", port)?;
        }
        if let Some(port) = env_var("BEACON_PORT") {
            self.beacon.port = parse_env("BEACON_PORT", port)?;
        }
        if let Some(enabled) = env_var("GLOBAL_ENABLED") {
            self.global.enabled = parse_env("GLOBAL_ENABLED", enabled)?;
        }
        if let Some(url) = env_var("GLOBAL_RELAY_URL") {
            self.global.relay_url = url;
        }
        if let Some(port) = env_var("RELAY_PORT") {
            self.relay.port = parse_env("RELAY_PORT", port)?;
        }
        if let Some(level) = env_var("LOGGING_LEVEL") {
            self.logging.level = level;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("network.connect_timeout_ms", self.network.connect_timeout_ms),
            ("network.recv_timeout_ms", self.network.recv_timeout_ms),
            ("network.join_timeout_ms", self.network.join_timeout_ms),
            ("beacon.interval_ms", self.beacon.interval_ms),
            ("beacon.peer_ttl_ms", self.beacon.peer_ttl_ms),
            ("beacon.recv_timeout_ms", self.beacon.recv_timeout_ms),
            ("global.update_interval_ms", self.global.update_interval_ms),
            ("global.peer_ttl_ms", self.global.peer_ttl_ms),
            ("global.request_timeout_ms", self.global.request_timeout_ms),
            ("relay.peer_ttl_ms", self.relay.peer_ttl_ms),
            ("beacon.port", u64::from(self.beacon.port)),
            ("relay.mailbox_capacity", self.relay.mailbox_capacity as u64),
            ("relay.shard_count", self.relay.shard_count as u64),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(invalid(field, "0"));
            }
        }

        if self.identity.display_name.trim().is_empty() {
            return Err(invalid("identity.display_name", ""));
        }

        if self.global.enabled && self.global.ip_echo_endpoints.is_empty() {
            return Err(invalid("global.ip_echo_endpoints", "[]"));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid("logging.level", &self.logging.level)),
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}_{suffix}")).ok()
}

fn parse_env<T: std::str::FromStr>(suffix: &str, value: String) -> Result<T> {
    value.parse().map_err(|_| {
        ConfigError::InvalidValue {
            field: format!("{ENV_PREFIX}_{suffix}"),
            value,
        }
        .into()
    })
}

fn invalid(field: &str, value: &str) -> crate::utils::PeerlineError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = PeerlineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.beacon.port, crate::defaults::BEACON_PORT);
        assert_eq!(config.network.listen_port, 0);
        assert!(!config.global.enabled);
        assert_eq!(config.relay.mailbox_capacity, 100);
    }

    #[test]
    fn test_config_serialization() {
        let config = PeerlineConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("listen_port"));
        assert!(toml_str.contains("ip_echo_endpoints"));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = PeerlineConfig::default();
        config.relay.port = 6001;
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = PeerlineConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.relay.port, 6001);
        assert_eq!(loaded.beacon.interval_ms, config.beacon.interval_ms);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[relay]\nmailbox_capacity = 5\n").unwrap();

        let loaded = PeerlineConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.relay.mailbox_capacity, 5);
        assert_eq!(loaded.relay.shard_count, 16);
        assert_eq!(loaded.beacon.peer_ttl_ms, 8_000);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let result = PeerlineConfig::load(Some(Path::new("/nonexistent/peerline.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = PeerlineConfig::default();
        assert!(config.validate().is_ok());

        config.beacon.port = 0;
        assert!(config.validate().is_err());

        config = PeerlineConfig::default();
        config.relay.mailbox_capacity = 0;
        assert!(config.validate().is_err());

        config = PeerlineConfig::default();
        config.global.enabled = true;
        config.global.ip_echo_endpoints.clear();
        assert!(config.validate().is_err());

        config = PeerlineConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_merge() {
        let config1 = PeerlineConfig::default();
        let mut config2 = PeerlineConfig::default();
        config2.relay.port = 7000;

        let merged = config1.merge(config2);
        assert_eq!(merged.relay.port, 7000);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("PEERLINE_RELAY_PORT", "9999");
        let config = PeerlineConfig::default().merge_from_env().unwrap();
        assert_eq!(config.relay.port, 9999);
        std::env::remove_var("PEERLINE_RELAY_PORT");

        std::env::set_var("PEERLINE_GLOBAL_ENABLED", "maybe");
        assert!(PeerlineConfig::default().merge_from_env().is_err());
        std::env::remove_var("PEERLINE_GLOBAL_ENABLED");
    }

    #[test]
    fn test_duration_helpers() {
        let config = PeerlineConfig::default();
        assert_eq!(config.beacon.interval(), Duration::from_millis(2_500));
        assert_eq!(config.network.recv_timeout(), Duration::from_millis(600));
    }
}
