//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are never stored in the TOML; `llm.key_env` names the
//! environment variable the key pool is loaded from.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Generative model settings
#[derive(Debug, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub primary_model: String,
    /// Given one attempt after the primary model's budgets are spent
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Primary key variable; numbered variants `{key_env}_1..` are read too
    #[serde(default = "default_key_env")]
    pub key_env: String,
    #[serde(default = "default_max_numbered_keys")]
    pub max_numbered_keys: usize,
}

/// Unified chat response cache
#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
        }
    }
}

fn default_max_connections() -> usize {
    256
}

fn default_base_url() -> String {
    provider::gemini::DEFAULT_BASE_URL.to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_key_env() -> String {
    key_pool::DEFAULT_KEY_VAR.to_string()
}

fn default_max_numbered_keys() -> usize {
    key_pool::MAX_NUMBERED_KEYS
}

fn default_cache_entries() -> usize {
    512
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    ///
    /// `LLM_BASE_URL` in the environment overrides `llm.base_url`.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            config.llm.base_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.llm.base_url.starts_with("http://") && !self.llm.base_url.starts_with("https://")
        {
            return Err(common::Error::invalid(
                "llm.base_url",
                format!("must start with http:// or https://, got: {}", self.llm.base_url),
            ));
        }

        if self.llm.primary_model.trim().is_empty() {
            return Err(common::Error::invalid("llm.primary_model", "must not be empty"));
        }

        if self
            .llm
            .fallback_model
            .as_deref()
            .is_some_and(|m| m.trim().is_empty())
        {
            return Err(common::Error::invalid(
                "llm.fallback_model",
                "must not be empty when set",
            ));
        }

        if self.llm.timeout_secs == 0 {
            return Err(common::Error::invalid("llm.timeout_secs", "must be greater than 0"));
        }

        if self.llm.key_env.trim().is_empty() {
            return Err(common::Error::invalid("llm.key_env", "must not be empty"));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::invalid(
                "server.max_connections",
                "must be greater than 0",
            ));
        }

        if self.cache.max_entries == 0 {
            return Err(common::Error::invalid("cache.max_entries", "must be greater than 0"));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("career-coach.toml")
    }
}
