use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const SERVICE_NAME: &str = "llm-proxy-service";

const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub common: core_config::Config,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub upstream: UpstreamConfig,
    pub storage: StorageConfig,
    /// Largest inbound request body accepted for forwarding.
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: Secret<String>,
    /// Non-positive values are replaced by the dispatcher default.
    pub rate_limit_per_min: i64,
    /// Whole-exchange deadline. `None` waits for as long as the upstream takes.
    pub timeout_secs: Option<u64>,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "sqlite" => Ok(StorageBackend::Sqlite),
            other => Err(format!("unknown storage backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Raw `REPOSITORY_TYPE` value; see [`StorageConfig::backend`].
    pub repository_type: String,
    pub sqlite_dsn: String,
    pub sqlite_max_connections: u32,
}

impl StorageConfig {
    /// The selected backend. Unknown names fall back to memory with a warning.
    pub fn backend(&self) -> StorageBackend {
        self.repository_type.parse().unwrap_or_else(|e| {
            tracing::warn!("{}; falling back to in-memory session storage", e);
            StorageBackend::Memory
        })
    }
}

impl ProxyConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        Self::from_lookup(common_config, |key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source. `load` passes the process
    /// environment.
    pub fn from_lookup<F>(common: core_config::Config, lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let is_prod = lookup("ENVIRONMENT").unwrap_or_else(|| "dev".to_string()) == "prod";
        let var = |key: &str, default: Option<&str>| get_env(&lookup, key, default, is_prod);

        Ok(ProxyConfig {
            common,
            log_level: var("LOG_LEVEL", Some("info"))?,
            otlp_endpoint: lookup("OTLP_ENDPOINT").filter(|s| !s.is_empty()),
            upstream: UpstreamConfig {
                base_url: var("OPENAI_BASE_URL", Some("https://api.openai.com"))?,
                api_key: Secret::new(var("OPENAI_API_KEY", None)?),
                rate_limit_per_min: parse_number(
                    "RATE_LIMIT_PER_MIN",
                    &var("RATE_LIMIT_PER_MIN", Some("60"))?,
                )?,
                timeout_secs: lookup("UPSTREAM_TIMEOUT_SECS")
                    .filter(|s| !s.is_empty())
                    .map(|raw| parse_number("UPSTREAM_TIMEOUT_SECS", &raw))
                    .transpose()?,
            },
            storage: StorageConfig {
                repository_type: var("REPOSITORY_TYPE", Some("memory"))?,
                sqlite_dsn: var("SQLITE_DSN", Some("sessions.db"))?,
                sqlite_max_connections: parse_number(
                    "SQLITE_MAX_CONNECTIONS",
                    &var("SQLITE_MAX_CONNECTIONS", Some("5"))?,
                )?,
            },
            max_body_bytes: parse_number(
                "MAX_BODY_BYTES",
                &var("MAX_BODY_BYTES", Some(&DEFAULT_MAX_BODY_BYTES.to_string()))?,
            )?,
        })
    }
}

fn get_env<F>(lookup: &F, key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(val) => Ok(val),
        None => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("{} must be a number, got '{}': {}", key, raw, e))
    })
}
