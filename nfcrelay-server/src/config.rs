//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via NFCRELAY_CONFIG or --config)
//! 3. Environment variables
//! 4. Command-line flags (applied by the binary)

use nfcrelay_protocol::{DEFAULT_PORT, MAX_PAYLOAD_SIZE};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Relay behaviour: stage pipeline and per-connection limits.
    pub relay: RelayConfig,
    /// TLS configuration.
    pub tls: TlsConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("NFCRELAY_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }

    /// Applies overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.network.apply_overrides(&lookup);
        self.relay.apply_overrides(&lookup);
        self.tls.apply_overrides(&lookup);
        self.metrics.apply_overrides(&lookup);
    }

    /// Validates the whole configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.idle_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "network.idle_timeout_secs must be positive".to_string(),
            ));
        }
        if self.relay.max_payload_bytes == 0 {
            return Err(ConfigError::Validation(
                "relay.max_payload_bytes must be positive".to_string(),
            ));
        }
        if self.relay.outbound_queue == 0 {
            return Err(ConfigError::Validation(
                "relay.outbound_queue must be positive".to_string(),
            ));
        }
        self.tls.validate()
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Idle read timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            idle_timeout_secs: 300,
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(parsed) = lookup("NFCRELAY_BIND").and_then(|v| v.parse().ok()) {
            self.bind_addr = parsed;
        }

        if let Some(host) = lookup("NFCRELAY_HOST").and_then(|v| v.parse::<IpAddr>().ok()) {
            self.bind_addr.set_ip(host);
        }

        if let Some(port) = lookup("NFCRELAY_PORT").and_then(|v| v.parse().ok()) {
            self.bind_addr.set_port(port);
        }

        if let Some(secs) = lookup("NFCRELAY_IDLE_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.idle_timeout_secs = secs;
        }

        if let Some(n) = lookup("NFCRELAY_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.max_connections = n;
        }
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Ordered list of stage names applied to every relayed payload.
    pub plugins: Vec<String>,
    /// Largest payload a client may announce in a frame header.
    pub max_payload_bytes: u32,
    /// Number of pending broadcasts buffered per receiving connection.
    pub outbound_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
            max_payload_bytes: MAX_PAYLOAD_SIZE,
            outbound_queue: 256,
        }
    }
}

impl RelayConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(list) = lookup("NFCRELAY_PLUGINS") {
            self.plugins = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(n) = lookup("NFCRELAY_MAX_PAYLOAD").and_then(|v| v.parse().ok()) {
            self.max_payload_bytes = n;
        }

        if let Some(n) = lookup("NFCRELAY_OUTBOUND_QUEUE").and_then(|v| v.parse().ok()) {
            self.outbound_queue = n;
        }
    }
}

/// How the listener secures incoming connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Plain TCP.
    Disabled,
    /// TLS with a server certificate only.
    ServerOnly,
    /// TLS that requires a client certificate signed by the configured CA.
    Mutual,
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Enable TLS.
    pub enabled: bool,
    /// Path to PEM-encoded server certificate file.
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key file.
    pub key_path: Option<PathBuf>,
    /// Require client certificate authentication (mTLS).
    pub require_client_cert: bool,
    /// Path to PEM-encoded CA certificate(s) for verifying client certs.
    /// Required if require_client_cert is true.
    pub client_ca_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = lookup("NFCRELAY_TLS_ENABLED") {
            self.enabled = parse_flag(&enabled);
        }
        if let Some(path) = lookup("NFCRELAY_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("NFCRELAY_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Some(require) = lookup("NFCRELAY_TLS_REQUIRE_CLIENT_CERT") {
            self.require_client_cert = parse_flag(&require);
        }
        if let Some(path) = lookup("NFCRELAY_TLS_CLIENT_CA") {
            self.client_ca_path = Some(PathBuf::from(path));
        }
    }

    /// Returns the effective TLS mode.
    pub fn mode(&self) -> TlsMode {
        match (self.enabled, self.require_client_cert) {
            (false, _) => TlsMode::Disabled,
            (true, false) => TlsMode::ServerOnly,
            (true, true) => TlsMode::Mutual,
        }
    }

    /// Validates TLS configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.cert_path.is_none() {
            return Err(ConfigError::Validation(
                "TLS enabled but cert_path not set".to_string(),
            ));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::Validation(
                "TLS enabled but key_path not set".to_string(),
            ));
        }
        if self.require_client_cert && self.client_ca_path.is_none() {
            return Err(ConfigError::Validation(
                "mTLS enabled but client_ca_path not set".to_string(),
            ));
        }

        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9566)),
        }
    }
}

impl MetricsConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = lookup("NFCRELAY_METRICS_ENABLED") {
            self.enabled = parse_flag(&enabled);
        }
        if let Some(parsed) = lookup("NFCRELAY_METRICS_BIND").and_then(|v| v.parse().ok()) {
            self.bind_addr = parsed;
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 5566);
        assert_eq!(config.network.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.relay.max_payload_bytes, MAX_PAYLOAD_SIZE);
        assert!(config.relay.plugins.is_empty());
        assert_eq!(config.tls.mode(), TlsMode::Disabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.yaml");

        let mut config = Config::default();
        config.relay.plugins = vec!["log".to_string(), "count".to_string()];
        config.network.idle_timeout_secs = 30;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.relay.plugins, vec!["log", "count"]);
        assert_eq!(loaded.network.idle_timeout_secs, 30);
        assert_eq!(loaded.network.bind_addr, config.network.bind_addr);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "network:\n  bind_addr: \"0.0.0.0:6000\"\ntls:\n  enabled: true\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.network.bind_addr.port(), 6000);
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(config.tls.mode(), TlsMode::ServerOnly);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/relay.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(..)));
        assert!(err.to_string().contains("/nonexistent/relay.yaml"));
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[
            ("NFCRELAY_HOST", "0.0.0.0"),
            ("NFCRELAY_PORT", "7000"),
            ("NFCRELAY_IDLE_TIMEOUT", "12"),
            ("NFCRELAY_PLUGINS", "log, count,,fingerprint"),
            ("NFCRELAY_TLS_ENABLED", "true"),
            ("NFCRELAY_TLS_REQUIRE_CLIENT_CERT", "1"),
        ]));

        assert_eq!(config.network.bind_addr, "0.0.0.0:7000".parse().unwrap());
        assert_eq!(config.network.idle_timeout_secs, 12);
        assert_eq!(config.relay.plugins, vec!["log", "count", "fingerprint"]);
        assert_eq!(config.tls.mode(), TlsMode::Mutual);
    }

    #[test]
    fn test_invalid_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[("NFCRELAY_PORT", "not-a-port")]));
        assert_eq!(config.network.bind_addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_tls_validation() {
        let mut tls = TlsConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(tls.validate().unwrap_err().to_string().contains("cert_path"));

        tls.cert_path = Some("cert.pem".into());
        assert!(tls.validate().unwrap_err().to_string().contains("key_path"));

        tls.key_path = Some("key.pem".into());
        assert!(tls.validate().is_ok());

        tls.require_client_cert = true;
        assert!(tls
            .validate()
            .unwrap_err()
            .to_string()
            .contains("client_ca_path"));
    }

    #[test]
    fn test_zero_queue_rejected() {
        let mut config = Config::default();
        config.relay.outbound_queue = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_max_payload_rejected() {
        let mut config = Config::default();
        config.relay.max_payload_bytes = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("max_payload_bytes"));
    }
}
