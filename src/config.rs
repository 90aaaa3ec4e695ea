// TOML configuration: providers, cache and logging

use std::{collections::HashSet, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    cache::CacheConfig,
    circuit_breaker::CircuitBreakerConfig,
    provider::ProviderConfig,
    resilient_client::RetryConfig,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("no enabled providers configured")]
    NoProviders,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub providers: Vec<ProviderSettings>,
    pub cache: CacheSettings,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub name: String,
    pub enabled: bool,
    pub base_url: String,
    /// Appended to `base_url` for the routes request; empty means the base itself.
    pub routes_path: String,
    pub health_path: String,
    pub timeout_ms: u64,
    pub retries: u32,
    pub cache_ttl_secs: u64,
    pub circuit_breaker: BreakerSettings,
    pub backoff: BackoffSettings,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            base_url: String::new(),
            routes_path: String::new(),
            health_path: "/health".to_string(),
            timeout_ms: 10_000,
            retries: 3,
            cache_ttl_secs: 300,
            circuit_breaker: BreakerSettings::default(),
            backoff: BackoffSettings::default(),
        }
    }
}

impl ProviderSettings {
    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            name: self.name.clone(),
            base_url: self.base_url.clone(),
            routes_path: self.routes_path.clone(),
            health_path: self.health_path.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            retry_config: RetryConfig {
                max_retries: self.retries,
                initial_backoff_ms: self.backoff.initial_backoff_ms,
                max_backoff_ms: self.backoff.max_backoff_ms,
                backoff_multiplier: self.backoff.backoff_multiplier,
                jitter_factor: self.backoff.jitter_factor,
            },
            circuit_breaker_config: CircuitBreakerConfig {
                failure_threshold: self.circuit_breaker.failure_threshold,
                success_threshold: self.circuit_breaker.success_threshold,
                reset_timeout: Duration::from_millis(self.circuit_breaker.reset_timeout_ms),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            initial_backoff_ms: retry.initial_backoff_ms,
            max_backoff_ms: retry.max_backoff_ms,
            backoff_multiplier: retry.backoff_multiplier,
            jitter_factor: retry.jitter_factor,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub default_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    /// TTL of the merged snapshot; 0 disables the aggregate cache.
    pub aggregate_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 300,
            cleanup_interval_secs: 600,
            aggregate_ttl_secs: 60,
        }
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            enabled: self.enabled,
            default_ttl: Duration::from_secs(self.default_ttl_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
        }
    }

    pub fn aggregate_ttl(&self) -> Duration {
        Duration::from_secs(self.aggregate_ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderSettings> {
        self.providers.iter().filter(|p| p.enabled)
    }

    /// Checks every rule and reports all violations at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled_providers().next().is_none() {
            return Err(ConfigError::NoProviders);
        }

        let mut problems = Vec::new();
        let mut names = HashSet::new();

        for (index, provider) in self.providers.iter().enumerate() {
            let name = provider.name.trim();
            if name.is_empty() {
                problems.push(format!("providers[{}]: name is required", index));
            } else if !names.insert(name) {
                problems.push(format!("providers[{}]: duplicate name {:?}", index, name));
            }

            if !provider.enabled {
                continue;
            }

            let url = provider.base_url.trim();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                problems.push(format!(
                    "provider {:?}: base_url must be an http(s) URL, got {:?}",
                    name, provider.base_url
                ));
            }
            if provider.timeout_ms == 0 {
                problems.push(format!("provider {:?}: timeout_ms must be positive", name));
            }
            if provider.cache_ttl_secs == 0 {
                problems.push(format!("provider {:?}: cache_ttl_secs must be positive", name));
            }
            if provider.circuit_breaker.failure_threshold == 0 {
                problems.push(format!(
                    "provider {:?}: circuit_breaker.failure_threshold must be positive",
                    name
                ));
            }
            if provider.backoff.backoff_multiplier < 1.0 {
                problems.push(format!(
                    "provider {:?}: backoff.backoff_multiplier must be at least 1.0",
                    name
                ));
            }
            if !(0.0..=1.0).contains(&provider.backoff.jitter_factor) {
                problems.push(format!(
                    "provider {:?}: backoff.jitter_factor must be within 0.0..=1.0",
                    name
                ));
            }
        }

        if self.cache.enabled && self.cache.cleanup_interval_secs == 0 {
            problems.push("cache.cleanup_interval_secs must be positive".to_string());
        }

        if !LOG_LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            problems.push(format!("log.level {:?} is not one of {:?}", self.log.level, LOG_LEVELS));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    AppConfig::from_toml_str(&content)
}
