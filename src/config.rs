use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::models::{SourceDescriptor, SourceKind};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub registry: RegistryConfig,
    pub executor: ExecutorConfig,
    pub planner: PlannerConfig,
    pub cache: CacheConfig,
    pub llm: LlmConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub max_parallelism: usize,
    pub operation_timeout_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// LIMIT appended to relational payloads that carry none.
    pub row_limit: u64,
}

impl ExecutorConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerConfig {
    pub context_budget_chars: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

/// A statically declared source.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub kind: String,
    pub connection_url: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn to_descriptor(&self) -> Result<SourceDescriptor, String> {
        let kind = SourceKind::from_str(&self.kind)?;
        let mut source = SourceDescriptor::new(&self.id, kind, &self.connection_url)
            .with_priority(self.priority);
        if let Some(description) = &self.description {
            source = source.with_description(description);
        }
        if !self.enabled {
            source = source.disabled();
        }
        Ok(source)
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, config::ConfigError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| config::ConfigError::Message(format!("invalid value '{}' for {}", raw, key)))
}

impl Config {
    /// Defaults, then `orchestrator.toml` if present, then environment overrides.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();
        Self::load(None, |key| env::var(key).ok())
    }

    /// Load with an explicit settings file and environment lookup.
    pub fn load<F>(file: Option<&Path>, lookup: F) -> Result<Self, config::ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = config::Config::builder()
            .set_default("registry.url", "./registry.db")?
            .set_default("executor.max_parallelism", 4)?
            .set_default("executor.operation_timeout_secs", 30)?
            .set_default("executor.retry_max_attempts", 3)?
            .set_default("executor.retry_base_delay_ms", 200)?
            .set_default("executor.retry_max_delay_ms", 5000)?
            .set_default("executor.row_limit", 10000)?
            .set_default("planner.context_budget_chars", 4000)?
            .set_default("cache.enabled", true)?
            .set_default("cache.max_entries", 256)?
            .set_default("cache.ttl_secs", 300)?
            .set_default("llm.gateway_url", "http://localhost:8080")?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")?;

        builder = match file {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("orchestrator").required(false)),
        };

        if let Some(url) = lookup("REGISTRY_URL") {
            builder = builder.set_override("registry.url", url)?;
        }

        if let Some(raw) = lookup("MAX_PARALLELISM") {
            let value: i64 = parse_override("MAX_PARALLELISM", &raw)?;
            builder = builder.set_override("executor.max_parallelism", value)?;
        }

        if let Some(raw) = lookup("OPERATION_TIMEOUT_SECS") {
            let value: i64 = parse_override("OPERATION_TIMEOUT_SECS", &raw)?;
            builder = builder.set_override("executor.operation_timeout_secs", value)?;
        }

        if let Some(gateway_url) = lookup("LLM_GATEWAY_URL") {
            builder = builder.set_override("llm.gateway_url", gateway_url)?;
        }

        if let Some(api_key) = lookup("LLM_API_KEY") {
            builder = builder.set_override("llm.api_key", Some(api_key))?;
        }

        if let Some(log_level) = lookup("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        if let Some(log_style) = lookup("RUST_LOG_STYLE") {
            builder = builder.set_override("logging.style", log_style)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        if config.executor.max_parallelism == 0 {
            return Err(config::ConfigError::Message(
                "executor.max_parallelism must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::load(None, no_env).unwrap();
        assert_eq!(config.registry.url, "./registry.db");
        assert_eq!(config.executor.max_parallelism, 4);
        assert_eq!(config.executor.operation_timeout(), Duration::from_secs(30));
        assert_eq!(config.executor.retry_max_attempts, 3);
        assert!(config.cache.enabled);
        assert!(config.llm.api_key.is_none());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MAX_PARALLELISM", "8"),
            ("REGISTRY_URL", "sqlite:/tmp/reg.db"),
            ("LLM_API_KEY", "secret"),
        ]);
        let config = Config::load(None, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.executor.max_parallelism, 8);
        assert_eq!(config.registry.url, "sqlite:/tmp/reg.db");
        assert_eq!(config.llm.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_invalid_override_is_an_error() {
        let result = Config::load(None, |k| (k == "MAX_PARALLELISM").then(|| "many".to_string()));
        assert!(result.is_err());

        let result = Config::load(None, |k| (k == "MAX_PARALLELISM").then(|| "0".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_settings_file_declares_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[cache]
ttl_secs = 60

[[sources]]
id = "billing"
kind = "postgres"
connection_url = "postgres://localhost/billing"
priority = 2
description = "orders and invoices"

[[sources]]
id = "events"
kind = "kafka"
connection_url = "kafka://events"
enabled = false
"#
        )
        .unwrap();

        let config = Config::load(Some(&path), no_env).unwrap();
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.cache.max_entries, 256);
        assert_eq!(config.sources.len(), 2);

        let billing = config.sources[0].to_descriptor().unwrap();
        assert_eq!(billing.kind, SourceKind::Relational);
        assert_eq!(billing.priority, 2);
        let events = config.sources[1].to_descriptor().unwrap();
        assert_eq!(events.kind, SourceKind::MessageLog);
        assert!(!events.enabled);
    }
}
