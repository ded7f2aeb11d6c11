use std::path::Path;
use std::time::Duration;

use relgraph_core::engine::EngineConfig;
use relgraph_core::schema::SchemaLimits;
use serde::Deserialize;

use crate::adapter::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfigValues,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
    pub schema_limits: SchemaLimitsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfigValues {
    pub max_depth: usize,
    pub max_concurrent_branches: usize,
    pub request_timeout_ms: u64,
    pub lookup_page_size: usize,
    pub max_lookup_page_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Weighted budget of the decision cache, in approximate bytes.
    pub max_cost: u64,
    pub lookup_max_cost: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub read_page_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchemaLimitsConfig {
    pub max_types: usize,
    pub max_relations_per_type: usize,
    pub max_permissions_per_type: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl Default for EngineConfigValues {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            max_depth: engine.max_depth,
            max_concurrent_branches: engine.max_concurrent_branches,
            request_timeout_ms: engine.request_timeout.as_millis() as u64,
            lookup_page_size: engine.lookup_page_size,
            max_lookup_page_size: engine.max_lookup_page_size,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cost: 64 * 1024 * 1024,
            lookup_max_cost: 16 * 1024 * 1024,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            read_page_size: 500,
            max_retries: retry.max_retries,
            retry_backoff_ms: retry.base_backoff.as_millis() as u64,
        }
    }
}

impl Default for SchemaLimitsConfig {
    fn default() -> Self {
        let limits = SchemaLimits::default();
        Self {
            max_types: limits.max_types,
            max_relations_per_type: limits.max_relations_per_type,
            max_permissions_per_type: limits.max_permissions_per_type,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl AppConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e.to_string()))?;
            toml::from_str::<AppConfig>(&contents)
                .map_err(|e| ConfigError::ParseToml(e.to_string()))?
        } else {
            AppConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("RELGRAPH_ENGINE_MAX_DEPTH") {
            self.engine.max_depth = n;
        }
        if let Some(n) = env_parse("RELGRAPH_ENGINE_MAX_CONCURRENT_BRANCHES") {
            self.engine.max_concurrent_branches = n;
        }
        if let Some(n) = env_parse("RELGRAPH_ENGINE_REQUEST_TIMEOUT_MS") {
            self.engine.request_timeout_ms = n;
        }
        if let Some(enabled) = env_parse("RELGRAPH_CACHE_ENABLED") {
            self.cache.enabled = enabled;
        }
        if let Some(n) = env_parse("RELGRAPH_CACHE_MAX_COST") {
            self.cache.max_cost = n;
        }
        if let Some(n) = env_parse("RELGRAPH_STORAGE_MAX_RETRIES") {
            self.storage.max_retries = n;
        }
        if let Ok(v) = std::env::var("RELGRAPH_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("RELGRAPH_LOG_FORMAT") {
            match v.as_str() {
                "json" => self.log.format = LogFormat::Json,
                "pretty" => self.log.format = LogFormat::Pretty,
                _ => {}
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_depth == 0 {
            return Err(ConfigError::Validation(
                "engine.max_depth must be non-zero".to_string(),
            ));
        }
        if self.engine.max_concurrent_branches == 0 {
            return Err(ConfigError::Validation(
                "engine.max_concurrent_branches must be non-zero".to_string(),
            ));
        }
        if self.engine.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "engine.request_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.engine.lookup_page_size == 0
            || self.engine.lookup_page_size > self.engine.max_lookup_page_size
        {
            return Err(ConfigError::Validation(
                "engine.lookup_page_size must be between 1 and engine.max_lookup_page_size"
                    .to_string(),
            ));
        }
        if self.storage.read_page_size == 0 {
            return Err(ConfigError::Validation(
                "storage.read_page_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_depth: self.engine.max_depth,
            max_concurrent_branches: self.engine.max_concurrent_branches,
            request_timeout: Duration::from_millis(self.engine.request_timeout_ms),
            lookup_page_size: self.engine.lookup_page_size,
            max_lookup_page_size: self.engine.max_lookup_page_size,
        }
    }

    pub fn to_schema_limits(&self) -> SchemaLimits {
        SchemaLimits {
            max_types: self.schema_limits.max_types,
            max_relations_per_type: self.schema_limits.max_relations_per_type,
            max_permissions_per_type: self.schema_limits.max_permissions_per_type,
        }
    }

    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.storage.max_retries,
            base_backoff: Duration::from_millis(self.storage.retry_backoff_ms),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    ReadFile(String, String),

    #[error("failed to parse TOML config: {0}")]
    ParseToml(String),

    #[error("config validation failed: {0}")]
    Validation(String),
}
