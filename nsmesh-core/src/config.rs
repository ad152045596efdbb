use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub healing: HealingConfig,
    pub probe: ProbeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub grpc_port: u16,
    /// Name stamped on every endpoint this instance registers.
    /// Empty means "derive from hostname at start-up".
    pub manager_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            grpc_port: 5001,
            manager_name: String::new(),
        }
    }
}

/// Endpoint selection policy used by `RequestConnection`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    RoundRobin,
    LeastRecentlyUsed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub selection: SelectionPolicy,
    /// Redis URL for endpoint persistence; empty keeps the registry in memory only
    pub redis_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    /// false: a confirmed failure closes the connection without recovery
    pub enabled: bool,
    /// Grace window between the first failed probe and healing
    pub suspect_wait_ms: u64,
    /// Recovery attempts before the connection is closed
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_ceiling_ms: u64,
    /// How long closed bindings are remembered to absorb late events
    pub tombstone_ttl_ms: u64,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            suspect_wait_ms: 5_000,
            max_attempts: 5,
            backoff_base_ms: 200,
            backoff_ceiling_ms: 2_000,
            tombstone_ttl_ms: 10_000,
        }
    }
}

impl HealingConfig {
    #[must_use]
    pub const fn suspect_wait(&self) -> Duration {
        Duration::from_millis(self.suspect_wait_ms)
    }

    #[must_use]
    pub const fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    #[must_use]
    pub const fn backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.backoff_ceiling_ms)
    }

    #[must_use]
    pub const fn tombstone_ttl(&self) -> Duration {
        Duration::from_millis(self.tombstone_ttl_ms)
    }
}

/// How the endpoint side of a connection is probed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMode {
    /// TCP connect to the endpoint's address
    #[default]
    Tcp,
    /// Endpoint must keep sending `Heartbeat` calls
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub max_concurrency: usize,
    pub mode: ProbeMode,
    /// Peers whose last heartbeat is older than this are dead
    pub heartbeat_timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            timeout_ms: 1_000,
            max_concurrency: 64,
            mode: ProbeMode::Tcp,
            heartbeat_timeout_ms: 3_000,
        }
    }
}

impl ProbeConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // NSMESH_HEALING__SUSPECT_WAIT_MS, NSMESH_PROBE__MODE, ...
        builder = builder.add_source(
            Environment::with_prefix("NSMESH")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get gRPC address
    #[must_use]
    pub fn grpc_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.grpc_port)
    }

    /// Check cross-field constraints, returning every violation found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.grpc_port == 0 {
            errors.push("server.grpc_port must be non-zero".to_string());
        }
        if self.healing.max_attempts == 0 {
            errors.push("healing.max_attempts must be at least 1".to_string());
        }
        if self.healing.suspect_wait_ms == 0 {
            errors.push("healing.suspect_wait_ms must be non-zero".to_string());
        }
        if self.healing.backoff_base_ms == 0 {
            errors.push("healing.backoff_base_ms must be non-zero".to_string());
        }
        if self.healing.backoff_ceiling_ms < self.healing.backoff_base_ms {
            errors.push(format!(
                "healing.backoff_ceiling_ms ({}) must not be below healing.backoff_base_ms ({})",
                self.healing.backoff_ceiling_ms, self.healing.backoff_base_ms
            ));
        }
        if self.probe.interval_ms == 0 {
            errors.push("probe.interval_ms must be non-zero".to_string());
        }
        if self.probe.interval_ms >= self.healing.suspect_wait_ms {
            errors.push(format!(
                "probe.interval_ms ({}) must be smaller than healing.suspect_wait_ms ({})",
                self.probe.interval_ms, self.healing.suspect_wait_ms
            ));
        }
        if self.probe.timeout_ms == 0 {
            errors.push("probe.timeout_ms must be non-zero".to_string());
        }
        if self.probe.max_concurrency == 0 {
            errors.push("probe.max_concurrency must be at least 1".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();

        assert!(config.validate().is_ok());
        assert!(config.healing.enabled);
        assert_eq!(config.registry.selection, SelectionPolicy::RoundRobin);
        assert!(config.registry.redis_url.is_empty());
        assert!(config.probe.interval() < config.healing.suspect_wait());
    }

    #[test]
    fn test_grpc_address() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                grpc_port: 5001,
                manager_name: "nsm-1".to_string(),
            },
            ..Config::default()
        };

        assert_eq!(config.grpc_address(), "127.0.0.1:5001");
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.healing.max_attempts = 0;
        config.probe.interval_ms = 10_000;
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("max_attempts")));
        assert!(errors.iter().any(|e| e.contains("probe.interval_ms")));
        assert!(errors.iter().any(|e| e.contains("logging.format")));
    }

    #[test]
    fn test_backoff_ceiling_below_base_rejected() {
        let mut config = Config::default();
        config.healing.backoff_base_ms = 500;
        config.healing.backoff_ceiling_ms = 100;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("backoff_ceiling_ms"));
    }

    #[test]
    fn test_durations() {
        let healing = HealingConfig::default();
        assert_eq!(healing.suspect_wait(), Duration::from_secs(5));
        assert_eq!(healing.backoff_base(), Duration::from_millis(200));
        assert_eq!(healing.backoff_ceiling(), Duration::from_secs(2));
        assert_eq!(healing.tombstone_ttl(), Duration::from_secs(10));

        let probe = ProbeConfig::default();
        assert_eq!(probe.interval(), Duration::from_secs(1));
        assert_eq!(probe.timeout(), Duration::from_secs(1));
        assert_eq!(probe.heartbeat_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_enums_deserialize_snake_case() {
        let policy: SelectionPolicy = serde_json::from_str("\"least_recently_used\"").unwrap();
        assert_eq!(policy, SelectionPolicy::LeastRecentlyUsed);

        let mode: ProbeMode = serde_json::from_str("\"heartbeat\"").unwrap();
        assert_eq!(mode, ProbeMode::Heartbeat);
    }
}
