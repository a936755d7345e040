use serde::{Deserialize, Serialize};
use std::{collections::HashSet, time::Duration};

use crate::{
    credits::CreditTable,
    error::{GateError, Result},
    redis::RedisConfig,
};

/// What the gate does when the cache or counter storage is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFailurePolicy {
    /// Treat the failure as a cache miss / an allowed attempt and carry on
    #[default]
    FailOpen,
    /// Reject the call with a storage error
    FailClosed,
}

/// Top-level gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub caching_enabled: bool,
    pub storage_failure_policy: StorageFailurePolicy,
    pub cache_key_prefix: String,
    /// Capacity of the in-process backend when Redis is not configured
    pub local_cache_size: u64,
    /// Timeout applied by the default HTTP transport
    pub transport_timeout_ms: u64,
    pub redis: Option<RedisSettings>,
    pub clients: Vec<ClientSettings>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            caching_enabled: true,
            storage_failure_policy: StorageFailurePolicy::FailOpen,
            cache_key_prefix: String::new(),
            local_cache_size: 10_000,
            transport_timeout_ms: 30_000,
            redis: None,
            clients: Vec::new(),
        }
    }
}

/// Redis connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
    /// Separate instance for rate limit counters
    pub counters_url: Option<String>,
    pub connection_timeout_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            counters_url: None,
            connection_timeout_ms: 5_000,
            command_timeout_ms: 1_000,
        }
    }
}

impl RedisSettings {
    fn to_config(&self, url: &str) -> RedisConfig {
        RedisConfig {
            url: url.to_string(),
            connection_timeout: Some(Duration::from_millis(self.connection_timeout_ms)),
            command_timeout: Some(Duration::from_millis(self.command_timeout_ms)),
            ..Default::default()
        }
    }

    pub fn primary_config(&self) -> RedisConfig {
        self.to_config(&self.url)
    }

    pub fn counters_config(&self) -> Option<RedisConfig> {
        self.counters_url.as_deref().map(|url| self.to_config(url))
    }
}

/// Per-client caching and rate limit policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    pub name: String,
    /// Cache lifetime; absent means entries live until cleared
    #[serde(default)]
    pub cache_ttl_seconds: Option<u64>,
    /// Attempts per window; absent means the client is unlimited
    #[serde(default)]
    pub rate_limit_max_attempts: Option<u64>,
    #[serde(default = "default_decay_seconds")]
    pub rate_limit_decay_seconds: u64,
    #[serde(default)]
    pub credits: Option<CreditTable>,
}

fn default_decay_seconds() -> u64 {
    60
}

impl ClientSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cache_ttl_seconds: None,
            rate_limit_max_attempts: None,
            rate_limit_decay_seconds: default_decay_seconds(),
            credits: None,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_seconds = Some(ttl.as_secs());
        self
    }

    pub fn with_rate_limit(mut self, max_attempts: u64, decay_seconds: u64) -> Self {
        self.rate_limit_max_attempts = Some(max_attempts);
        self.rate_limit_decay_seconds = decay_seconds;
        self
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_seconds.map(Duration::from_secs)
    }

    pub fn decay(&self) -> Duration {
        Duration::from_secs(self.rate_limit_decay_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GateError::Config("Client name must not be empty".to_string()));
        }
        if self.rate_limit_max_attempts.is_some() && self.rate_limit_decay_seconds == 0 {
            return Err(GateError::Config(format!(
                "Client {}: rate_limit_decay_seconds must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }
}

impl GateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.local_cache_size == 0 {
            return Err(GateError::Config(
                "local_cache_size must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for client in &self.clients {
            client.validate()?;
            if !seen.insert(client.name.as_str()) {
                return Err(GateError::Config(format!(
                    "Client {} is configured more than once",
                    client.name
                )));
            }
        }
        Ok(())
    }

    pub fn client(&self, name: &str) -> Option<&ClientSettings> {
        self.clients.iter().find(|c| c.name == name)
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }
}

/// Load configuration from YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<GateConfig> {
    let config: GateConfig = serde_yaml::from_str(yaml)
        .map_err(|e| GateError::Config(format!("Failed to parse YAML: {}", e)))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from YAML file
pub fn load_config_from_file(path: &str) -> Result<GateConfig> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}

/// Load a YAML file (if given) overlaid with `APIGATE__*` environment variables.
///
/// Nested keys use a double underscore, e.g. `APIGATE__REDIS__URL`.
pub fn load_config_layered(path: Option<&str>) -> Result<GateConfig> {
    let mut builder = ::config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(::config::File::new(path, ::config::FileFormat::Yaml));
    }
    let config: GateConfig = builder
        .add_source(
            ::config::Environment::with_prefix("APIGATE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| GateError::Config(format!("Failed to load configuration: {}", e)))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_from_yaml() {
        let yaml = r#"
storage_failure_policy: fail_closed
cache_key_prefix: apigate
clients:
  - name: scraper
    cache_ttl_seconds: 3600
    rate_limit_max_attempts: 3
    rate_limit_decay_seconds: 60
    credits:
      ai_surcharge: 5
  - name: predictions
"#;

        let config = load_config_from_yaml(yaml).unwrap();
        assert!(config.caching_enabled);
        assert_eq!(config.storage_failure_policy, StorageFailurePolicy::FailClosed);
        assert_eq!(config.clients.len(), 2);

        let scraper = config.client("scraper").unwrap();
        assert_eq!(scraper.cache_ttl(), Some(Duration::from_secs(3600)));
        assert_eq!(scraper.rate_limit_max_attempts, Some(3));
        assert_eq!(scraper.credits.as_ref().unwrap().dynamic_multiplier, 5.0);

        let predictions = config.client("predictions").unwrap();
        assert_eq!(predictions.cache_ttl(), None);
        assert_eq!(predictions.rate_limit_max_attempts, None);
        assert_eq!(predictions.decay(), Duration::from_secs(60));
    }

    #[test]
    fn test_duplicate_clients_rejected() {
        let yaml = r#"
clients:
  - name: scraper
  - name: scraper
"#;
        assert!(matches!(load_config_from_yaml(yaml), Err(GateError::Config(_))));
    }

    #[test]
    fn test_zero_decay_rejected() {
        let settings = ClientSettings::new("scraper").with_rate_limit(3, 0);
        assert!(settings.validate().is_err());
        assert!(ClientSettings::new("scraper").with_rate_limit(3, 1).validate().is_ok());
    }

    #[test]
    fn test_redis_settings() {
        let yaml = r#"
redis:
  url: redis://cache:6379
  counters_url: redis://counters:6379
"#;
        let config = load_config_from_yaml(yaml).unwrap();
        let redis = config.redis.unwrap();
        assert_eq!(redis.primary_config().url, "redis://cache:6379");
        assert_eq!(redis.counters_config().unwrap().url, "redis://counters:6379");
        assert_eq!(
            redis.primary_config().command_timeout,
            Some(Duration::from_millis(1_000))
        );
    }

    #[test]
    fn test_layered_defaults_without_file() {
        let config = load_config_layered(None).unwrap();
        assert_eq!(config.local_cache_size, 10_000);
        assert_eq!(config.transport_timeout(), Duration::from_secs(30));
    }
}
