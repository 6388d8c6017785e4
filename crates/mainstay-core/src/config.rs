//! Configuration
//!
//! Environment-driven with the `MAINSTAY_` prefix and `__` nesting
//! (`MAINSTAY_WORKERS__RETRY_DELAY=2`). Database URLs may interpolate other
//! environment variables with `${VAR}`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration loading/validation failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("environment variable '{0}' referenced in configuration is not set")]
    MissingInterpolation(String),
}

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Sqlite,
    Postgresql,
}

impl std::str::FromStr for DatabaseType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgresql" | "postgres" => Ok(Self::Postgresql),
            other => Err(ConfigError::Invalid {
                key: "database_type".into(),
                message: format!("must be sqlite or postgresql, got '{other}'"),
            }),
        }
    }
}

/// Payload serializer for stored values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Serializer {
    Json,
    Pkl,
}

impl std::str::FromStr for Serializer {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pkl" => Ok(Self::Pkl),
            other => Err(ConfigError::Invalid {
                key: "serializer".into(),
                message: format!("must be json or pkl, got '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub database_type: DatabaseType,
    pub pool_size: u32,
    pub max_overflow: u32,
    pub pool_timeout: Duration,
    pub pool_recycle: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/mainstay".to_string(),
            database_type: DatabaseType::Postgresql,
            pool_size: 5,
            max_overflow: 10,
            pool_timeout: Duration::from_secs(30),
            pool_recycle: Duration::from_secs(1800),
        }
    }
}

impl DatabaseConfig {
    /// Total connections the pool may open.
    pub fn max_connections(&self) -> u32 {
        self.pool_size + self.max_overflow
    }
}

/// Worker-side defaults and the shared bootstrap secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkersConfig {
    pub bootstrap_token: String,
    pub server_url: String,
    pub default_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub retry_backoff: f64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            bootstrap_token: uuid::Uuid::new_v4().simple().to_string(),
            server_url: "http://localhost:8000".to_string(),
            default_timeout: Duration::ZERO,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            retry_backoff: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Key material for secret encryption at rest.
    pub encryption_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub serializer: Serializer,
    pub server_host: String,
    pub server_port: u16,
    pub log_level: String,
    pub cache_path: String,
    pub local_storage_path: String,
    pub workers: WorkersConfig,
    pub security: SecurityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            serializer: Serializer::Json,
            server_host: "localhost".to_string(),
            server_port: 8000,
            log_level: "info".to_string(),
            cache_path: ".cache".to_string(),
            local_storage_path: ".data".to_string(),
            workers: WorkersConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl Config {
    /// Load from process environment (`MAINSTAY_*`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an explicit lookup function; tests inject maps here.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        let get = |suffix: &str| lookup(&format!("MAINSTAY_{suffix}"));

        if let Some(url) = get("DATABASE_URL") {
            config.database.url = interpolate(&url, &lookup)?;
        }
        if let Some(db_type) = get("DATABASE_TYPE") {
            config.database.database_type = db_type.parse()?;
        }
        if let Some(size) = get("DATABASE_POOL_SIZE") {
            config.database.pool_size = parse_num(&size, "database_pool_size")?;
        }
        if let Some(overflow) = get("DATABASE_MAX_OVERFLOW") {
            config.database.max_overflow = parse_num(&overflow, "database_max_overflow")?;
        }
        if let Some(timeout) = get("DATABASE_POOL_TIMEOUT") {
            config.database.pool_timeout =
                Duration::from_secs(parse_num(&timeout, "database_pool_timeout")?);
        }
        if let Some(recycle) = get("DATABASE_POOL_RECYCLE") {
            config.database.pool_recycle =
                Duration::from_secs(parse_num(&recycle, "database_pool_recycle")?);
        }
        if let Some(serializer) = get("SERIALIZER") {
            config.serializer = serializer.parse()?;
        }
        if let Some(host) = get("SERVER_HOST") {
            config.server_host = host;
        }
        if let Some(port) = get("SERVER_PORT") {
            config.server_port = parse_num(&port, "server_port")?;
        }
        if let Some(level) = get("LOG_LEVEL") {
            config.log_level = level;
        }
        if let Some(path) = get("CACHE_PATH") {
            config.cache_path = path;
        }
        if let Some(path) = get("LOCAL_STORAGE_PATH") {
            config.local_storage_path = path;
        }

        if let Some(token) = get("WORKERS__BOOTSTRAP_TOKEN") {
            config.workers.bootstrap_token = token;
        }
        if let Some(url) = get("WORKERS__SERVER_URL") {
            config.workers.server_url = url;
        }
        if let Some(timeout) = get("WORKERS__DEFAULT_TIMEOUT") {
            config.workers.default_timeout =
                Duration::from_secs(parse_num(&timeout, "workers.default_timeout")?);
        }
        if let Some(attempts) = get("WORKERS__RETRY_ATTEMPTS") {
            config.workers.retry_attempts = parse_num(&attempts, "workers.retry_attempts")?;
        }
        if let Some(delay) = get("WORKERS__RETRY_DELAY") {
            config.workers.retry_delay =
                Duration::from_secs(parse_num(&delay, "workers.retry_delay")?);
        }
        if let Some(backoff) = get("WORKERS__RETRY_BACKOFF") {
            config.workers.retry_backoff =
                backoff.parse().map_err(|_| ConfigError::Invalid {
                    key: "workers.retry_backoff".into(),
                    message: format!("expected a number, got '{backoff}'"),
                })?;
        }

        if let Some(key) = get("SECURITY__ENCRYPTION_KEY") {
            config.security.encryption_key = Some(key);
        }

        Ok(config)
    }
}

fn parse_num<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        message: format!("expected a number, got '{value}'"),
    })
}

/// Replace `${VAR}` references with environment values.
fn interpolate(
    input: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let var = &after[..end];
        let value = lookup(var).ok_or_else(|| ConfigError::MissingInterpolation(var.to_string()))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
