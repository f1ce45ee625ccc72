//! Configuration loading.
//!
//! Settings come from an optional `marketeer.toml` overlaid with
//! `MARKETEER_`-prefixed environment variables via figment, plus the
//! well-known connection and secret variables (`DATABASE_URL`,
//! `REDIS_URL`, `RABBITMQ_URL`, `JWT_*`). Per-platform outbound budgets
//! load from `integrations.yaml`.

use crate::error::ConfigError;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// JWT parameters for user-auth tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_jwt_expiry")]
    pub expiry_secs: i64,
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

fn default_jwt_expiry() -> i64 {
    3600
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            algorithm: default_jwt_algorithm(),
            expiry_secs: default_jwt_expiry(),
        }
    }
}

/// Agent runtime knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Seconds between integration health sweeps.
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    /// Seconds between engagement monitoring sweeps.
    #[serde(default = "default_monitoring_interval")]
    pub monitoring_interval_secs: u64,
    /// Bound on concurrent handler invocations per agent.
    #[serde(default = "default_pool_size")]
    pub handler_pool_size: usize,
    /// Default wait for task responses.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
    /// Delay between agent starts at boot.
    #[serde(default = "default_stagger_ms")]
    pub start_stagger_ms: u64,
}

fn default_health_interval() -> u64 {
    3600
}

fn default_monitoring_interval() -> u64 {
    3600
}

fn default_pool_size() -> usize {
    32
}

fn default_response_timeout() -> u64 {
    30
}

fn default_stagger_ms() -> u64 {
    1000
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_interval(),
            monitoring_interval_secs: default_monitoring_interval(),
            handler_pool_size: default_pool_size(),
            response_timeout_secs: default_response_timeout(),
            start_stagger_ms: default_stagger_ms(),
        }
    }
}

/// Upload handling for brand logos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadsConfig {
    #[serde(default = "default_uploads_root")]
    pub root: PathBuf,
    #[serde(default = "default_max_logo_bytes")]
    pub max_logo_bytes: u64,
}

fn default_uploads_root() -> PathBuf {
    PathBuf::from("/uploads")
}

fn default_max_logo_bytes() -> u64 {
    10 * 1024 * 1024
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            root: default_uploads_root(),
            max_logo_bytes: default_max_logo_bytes(),
        }
    }
}

/// Outbound budget for one platform, from `integrations.yaml`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PlatformBudget {
    pub requests_per_hour: u32,
    pub posts_per_day: u32,
}

impl Default for PlatformBudget {
    fn default() -> Self {
        Self {
            requests_per_hour: 600,
            posts_per_day: 100,
        }
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database_url: String,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub rabbitmq_url: Option<String>,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub uploads: UploadsConfig,
    #[serde(default)]
    pub rate_limits: HashMap<String, PlatformBudget>,
}

impl AppConfig {
    /// Load configuration: file < `MARKETEER_` env < well-known env vars.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        } else {
            figment = figment.merge(Toml::file("marketeer.toml"));
        }
        figment = figment.merge(Env::prefixed("MARKETEER_").split("__"));

        let mut config: AppConfig = figment
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        // Well-known variables override the file for operational parity
        // with the other deployment surfaces.
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = Some(url);
        }
        if let Ok(url) = std::env::var("RABBITMQ_URL") {
            config.rabbitmq_url = Some(url);
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            config.jwt.secret = secret;
        }
        if let Ok(algorithm) = std::env::var("JWT_ALGORITHM") {
            config.jwt.algorithm = algorithm;
        }
        if let Ok(expiry) = std::env::var("JWT_EXPIRY") {
            config.jwt.expiry_secs = expiry.parse().map_err(|_| ConfigError::Invalid {
                message: format!("JWT_EXPIRY must be seconds, got '{expiry}'"),
            })?;
        }

        if config.database_url.is_empty() {
            config.database_url = "marketeer.db".to_string();
        }
        Ok(config)
    }

    /// The SQLite path encoded by `database_url`. Accepts both bare paths
    /// and `sqlite://` URLs; `:memory:` selects an in-memory database.
    pub fn database_path(&self) -> String {
        self.database_url
            .strip_prefix("sqlite://")
            .or_else(|| self.database_url.strip_prefix("sqlite:"))
            .unwrap_or(&self.database_url)
            .to_string()
    }

    /// Load per-platform budgets from an `integrations.yaml` document of
    /// the form `{platform: {requests_per_hour, posts_per_day}}`.
    pub fn load_rate_limits(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        let parsed: HashMap<String, PlatformBudget> =
            serde_yaml::from_str(&raw).map_err(|e| ConfigError::ParseError {
                message: format!("{}: {e}", path.display()),
            })?;
        self.rate_limits.extend(parsed);
        Ok(())
    }

    /// The budget for a platform, defaulted when unconfigured.
    pub fn budget_for(&self, platform: &str) -> PlatformBudget {
        self.rate_limits
            .get(&platform.to_ascii_lowercase())
            .copied()
            .unwrap_or_default()
    }
}

/// Resolve the agent id selection from the environment: `AGENT_NAME`
/// (single) or `AGENT_NAMES` (comma-separated).
pub fn agent_selection_from_env() -> Vec<String> {
    if let Ok(name) = std::env::var("AGENT_NAME") {
        let name = name.trim().to_string();
        if !name.is_empty() {
            return vec![name];
        }
    }
    if let Ok(names) = std::env::var("AGENT_NAMES") {
        return names
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    Vec::new()
}
