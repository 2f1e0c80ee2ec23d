//! Runtime configuration
//!
//! Everything is read from the process environment after loading an optional
//! `.env` file, the same way the server binaries pick up `OPENAI_API_KEY`.

use crate::error::{CacheError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Which persistence backend the template stores use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Json,
    Sqlite,
}

impl BackendKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" | "file" => Ok(BackendKind::Json),
            "sqlite" | "sqlite3" => Ok(BackendKind::Sqlite),
            other => Err(CacheError::Config(format!(
                "Unknown cache backend '{}' (expected 'json' or 'sqlite')",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub admin_cache_path: PathBuf,
    pub parent_cache_path: PathBuf,
    pub backend: BackendKind,
    pub admin_similarity_threshold: f64,
    pub parent_similarity_threshold: f64,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub translator_timeout: Duration,
    pub database_url: Option<String>,
    pub schema_context_path: Option<PathBuf>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            admin_cache_path: PathBuf::from("sql_query_cache.json"),
            parent_cache_path: PathBuf::from("sql_query_cache1.json"),
            backend: BackendKind::Json,
            admin_similarity_threshold: 0.90,
            parent_similarity_threshold: 0.85,
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "gpt-4o".to_string(),
            translator_timeout: Duration::from_secs(100),
            database_url: None,
            schema_context_path: None,
        }
    }
}

impl AssistantConfig {
    /// Load `.env` (if any) and build the configuration from the environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = match get("CACHE_BACKEND") {
            Some(raw) => BackendKind::parse(&raw)?,
            None => defaults.backend,
        };

        let config = Self {
            admin_cache_path: get("ADMIN_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.admin_cache_path),
            parent_cache_path: get("PARENT_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.parent_cache_path),
            backend,
            admin_similarity_threshold: parse_f64(
                get("ADMIN_SIMILARITY_THRESHOLD"),
                "ADMIN_SIMILARITY_THRESHOLD",
                defaults.admin_similarity_threshold,
            )?,
            parent_similarity_threshold: parse_f64(
                get("PARENT_SIMILARITY_THRESHOLD"),
                "PARENT_SIMILARITY_THRESHOLD",
                defaults.parent_similarity_threshold,
            )?,
            openai_api_key: get("OPENAI_API_KEY"),
            openai_base_url: get("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            openai_model: get("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            translator_timeout: match get("TRANSLATOR_TIMEOUT_SECS") {
                Some(raw) => Duration::from_secs(raw.trim().parse::<u64>().map_err(|e| {
                    CacheError::Config(format!("Invalid TRANSLATOR_TIMEOUT_SECS '{}': {}", raw, e))
                })?),
                None => defaults.translator_timeout,
            },
            database_url: get("DATABASE_URL"),
            schema_context_path: get("SCHEMA_CONTEXT_PATH").map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("ADMIN_SIMILARITY_THRESHOLD", self.admin_similarity_threshold),
            ("PARENT_SIMILARITY_THRESHOLD", self.parent_similarity_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(CacheError::Config(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }

        // The two tiers must never share durable state.
        if self.admin_cache_path == self.parent_cache_path {
            return Err(CacheError::Config(format!(
                "Admin and parent caches both point at {}",
                self.admin_cache_path.display()
            )));
        }

        if self.translator_timeout.is_zero() {
            return Err(CacheError::Config(
                "TRANSLATOR_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Schema description handed to the translator, empty when not configured.
    pub fn load_schema_context(&self) -> Result<String> {
        match &self.schema_context_path {
            Some(path) => Ok(std::fs::read_to_string(path)?),
            None => Ok(String::new()),
        }
    }
}

fn parse_f64(raw: Option<String>, name: &str, default: f64) -> Result<f64> {
    match raw {
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .map_err(|e| CacheError::Config(format!("Invalid {} '{}': {}", name, raw, e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AssistantConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.backend, BackendKind::Json);
        assert_eq!(config.admin_similarity_threshold, 0.90);
        assert_eq!(config.parent_similarity_threshold, 0.85);
        assert_eq!(config.translator_timeout, Duration::from_secs(100));
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = AssistantConfig::from_lookup(lookup_from(&[
            ("CACHE_BACKEND", "sqlite"),
            ("PARENT_SIMILARITY_THRESHOLD", "0.8"),
            ("TRANSLATOR_TIMEOUT_SECS", "15"),
            ("OPENAI_API_KEY", "sk-test"),
        ]))
        .unwrap();
        assert_eq!(config.backend, BackendKind::Sqlite);
        assert_eq!(config.parent_similarity_threshold, 0.8);
        assert_eq!(config.translator_timeout, Duration::from_secs(15));
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_shared_store_path_rejected() {
        let result = AssistantConfig::from_lookup(lookup_from(&[
            ("ADMIN_CACHE_PATH", "cache.json"),
            ("PARENT_CACHE_PATH", "cache.json"),
        ]));
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_threshold_out_of_range() {
        let result =
            AssistantConfig::from_lookup(lookup_from(&[("ADMIN_SIMILARITY_THRESHOLD", "1.5")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_backend() {
        assert!(BackendKind::parse("redis").is_err());
        assert_eq!(BackendKind::parse("SQLite").unwrap(), BackendKind::Sqlite);
    }
}
