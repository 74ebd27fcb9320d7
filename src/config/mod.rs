/// Configuration management for cerrojo

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main cerrojo configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Store nodes and connection settings
    pub store: StoreConfig,
    /// Retry policy applied to every remote call
    #[serde(default)]
    pub retry: RetryConfig,
    /// Failover alerting
    #[serde(default)]
    pub failover: FailoverConfig,
    /// Health check configuration
    #[serde(default)]
    pub health: HealthConfig,
    /// Token blacklist backend
    #[serde(default)]
    pub blacklist: BlacklistConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Store node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Node entries as `<credential>@<host>:<port>`, keyed by node name.
    /// Nodes are tried in ascending name order.
    pub nodes: BTreeMap<String, String>,
    /// Key holding the master pointer on each node
    #[serde(default = "default_master_key")]
    pub master_key: String,
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-command I/O timeout in milliseconds
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    /// Idle connections kept per node
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 disables retrying
    pub max_retries: u32,
    /// Fixed pause between attempts in milliseconds
    pub backoff_ms: u64,
}

/// Failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Minimum seconds between two outage alerts
    pub alert_interval_sec: u64,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Health check interval in seconds
    pub interval_sec: u64,
    /// Health check timeout in seconds
    pub timeout_sec: u64,
}

/// Where revoked tokens are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlacklistBackend {
    Remote,
    Local,
}

/// Blacklist configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistConfig {
    pub backend: BlacklistBackend,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

fn default_master_key() -> String {
    "primary".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_io_timeout_ms() -> u64 {
    3000
}

fn default_pool_size() -> usize {
    8
}

impl Default for StoreConfig {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("node1".to_string(), "@127.0.0.1:6379".to_string());
        Self {
            nodes,
            master_key: default_master_key(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            pool_size: default_pool_size(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 6,
            backoff_ms: 500,
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            alert_interval_sec: 300,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_sec: 10,
            timeout_sec: 5,
        }
    }
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            backend: BlacklistBackend::Remote,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            retry: RetryConfig::default(),
            failover: FailoverConfig::default(),
            health: HealthConfig::default(),
            blacklist: BlacklistConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.nodes.is_empty() {
            return Err(ConfigError::ValidationError(
                "store.nodes cannot be empty".to_string(),
            ));
        }

        for (name, entry) in &self.store.nodes {
            crate::cluster::NodeAddress::parse(entry).map_err(|e| {
                ConfigError::ValidationError(format!("Invalid store node {}: {}", name, e))
            })?;
        }

        if self.store.master_key.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "store.master_key cannot be empty".to_string(),
            ));
        }

        if self.store.connect_timeout_ms == 0 || self.store.io_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "store timeouts must be greater than 0".to_string(),
            ));
        }

        if self.failover.alert_interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "failover.alert_interval_sec must be greater than 0".to_string(),
            ));
        }

        // Validate health config
        if self.health.interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "health check interval_sec must be greater than 0".to_string(),
            ));
        }

        if self.health.timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "health check timeout_sec must be greater than 0".to_string(),
            ));
        }

        if self.health.timeout_sec >= self.health.interval_sec {
            return Err(ConfigError::ValidationError(
                "health check timeout_sec must be less than interval_sec".to_string(),
            ));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        Ok(())
    }

    /// Create example configuration file with three replica nodes
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let mut nodes = BTreeMap::new();
        nodes.insert("node1".to_string(), "changeme@10.0.1.20:6379".to_string());
        nodes.insert("node2".to_string(), "changeme@10.0.1.21:6379".to_string());
        nodes.insert("node3".to_string(), "changeme@10.0.1.22:6379".to_string());

        let config = Config {
            store: StoreConfig {
                nodes,
                ..Default::default()
            },
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.store.nodes.clear();
        assert!(config.validate().is_err());

        config
            .store
            .nodes
            .insert("a".to_string(), "pw@localhost:notaport".to_string());
        assert!(config.validate().is_err());

        config
            .store
            .nodes
            .insert("a".to_string(), "pw@localhost:6380".to_string());
        assert!(config.validate().is_ok());

        config.health.timeout_sec = config.health.interval_sec;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let toml_str = r#"
            [store.nodes]
            b = "pw@10.0.0.2:6379"
            a = "pw@10.0.0.1:6379"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.master_key, "primary");
        assert_eq!(config.retry.max_retries, 6);
        assert_eq!(config.retry.backoff_ms, 500);
        assert_eq!(config.blacklist.backend, BlacklistBackend::Remote);

        let names: Vec<&String> = config.store.nodes.keys().collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed_config: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed_config.validate().is_ok());
    }

    #[test]
    fn test_config_file_operations() {
        let temp_file = NamedTempFile::new().unwrap();

        Config::create_example_config(temp_file.path()).unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded_config.store.nodes.len(), 3);
    }
}
