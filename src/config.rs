use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;
use validator::Validate;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),

    #[error("Parse error for {field}: {value} - {source}")]
    Parse {
        field: String,
        value: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Connection parameters for the PostgreSQL gateway plus the batch
/// analyzer's tunables, validated the same way the rest of the ambient
/// stack validates its inputs.
#[derive(Clone, Debug, Validate, Serialize, Deserialize)]
pub struct AdvisorConfig {
    /// Database host
    #[validate(length(min = 1, message = "host cannot be empty"))]
    pub host: String,

    /// Database port (1-65535)
    #[validate(range(min = 1, max = 65535, message = "port must be between 1 and 65535"))]
    pub port: u16,

    /// Database name
    #[validate(length(min = 1, message = "database name cannot be empty"))]
    pub database: String,

    /// Database user
    #[validate(length(min = 1, message = "user cannot be empty"))]
    pub user: String,

    /// Database password
    pub password: String,

    /// Minimum number of pooled connections
    #[validate(range(min = 1, message = "pool_min must be at least 1"))]
    pub pool_min: usize,

    /// Maximum number of pooled connections
    #[validate(range(min = 1, message = "pool_max must be at least 1"))]
    pub pool_max: usize,

    /// Statement timeout applied to every gateway round-trip, in milliseconds
    #[validate(range(min = 1, message = "statement_timeout_ms must be positive"))]
    pub statement_timeout_ms: u64,

    /// Bounded worker pool size for the batch analyzer, capped at 20
    #[validate(range(min = 1, max = 20, message = "workers must be between 1 and 20"))]
    pub workers: usize,

    /// Minimum call count for a query pulled from `pg_stat_statements`
    pub min_calls: i64,

    /// Minimum mean execution time (ms) for a query pulled from `pg_stat_statements`
    pub min_mean_ms: f64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: String::new(),
            user: String::new(),
            password: String::new(),
            pool_min: 2,
            pool_max: 10,
            statement_timeout_ms: 30_000,
            workers: 10,
            min_calls: 10,
            min_mean_ms: 100.0,
        }
    }
}

impl AdvisorConfig {
    /// Create configuration from environment variables with validation.
    ///
    /// Reads `DB_HOST`, `DB_PORT`, `DB_NAME`, `DB_USER`, `DB_PASSWORD`,
    /// `DB_POOL_MIN`, `DB_POOL_MAX`, `ADVISOR_WORKERS`, `ADVISOR_MIN_CALLS`,
    /// `ADVISOR_MIN_MEAN_MS` and `ADVISOR_STATEMENT_TIMEOUT_MS`, falling back
    /// to the defaults above when a variable is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            host: env::var("DB_HOST").unwrap_or(defaults.host),
            port: parse_env_var("DB_PORT", &defaults.port.to_string())?,
            database: env::var("DB_NAME").unwrap_or(defaults.database),
            user: env::var("DB_USER").unwrap_or(defaults.user),
            password: env::var("DB_PASSWORD").unwrap_or(defaults.password),
            pool_min: parse_env_var("DB_POOL_MIN", &defaults.pool_min.to_string())?,
            pool_max: parse_env_var("DB_POOL_MAX", &defaults.pool_max.to_string())?,
            statement_timeout_ms: parse_env_var(
                "ADVISOR_STATEMENT_TIMEOUT_MS",
                &defaults.statement_timeout_ms.to_string(),
            )?,
            workers: parse_env_var("ADVISOR_WORKERS", &defaults.workers.to_string())?,
            min_calls: parse_env_var("ADVISOR_MIN_CALLS", &defaults.min_calls.to_string())?,
            min_mean_ms: parse_env_var("ADVISOR_MIN_MEAN_MS", &defaults.min_mean_ms.to_string())?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Create configuration from CLI arguments with validation.
    pub fn from_cli(cli: CliConfig) -> Result<Self, ConfigError> {
        let config = Self {
            host: cli.host,
            port: cli.port,
            database: cli.database,
            user: cli.user,
            password: cli.password,
            pool_min: cli.pool_min,
            pool_max: cli.pool_max,
            statement_timeout_ms: cli.statement_timeout_ms,
            workers: cli.workers,
            min_calls: cli.min_calls,
            min_mean_ms: cli.min_mean_ms,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }
}

/// CLI configuration (parsed from command line arguments)
#[derive(Clone, Debug)]
pub struct CliConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub pool_min: usize,
    pub pool_max: usize,
    pub statement_timeout_ms: u64,
    pub workers: usize,
    pub min_calls: i64,
    pub min_mean_ms: f64,
}

/// Parse an environment variable with a default value
fn parse_env_var<T: std::str::FromStr>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = env::var(key).unwrap_or_else(|_| default.to_string());
    value.parse().map_err(|e| ConfigError::Parse {
        field: key.to_string(),
        value,
        source: Box::new(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn default_config_is_valid_once_required_fields_are_set() {
        let config = AdvisorConfig {
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.pool_min, 2);
        assert_eq!(config.pool_max, 10);
        assert_eq!(config.workers, 10);
    }

    #[test]
    fn rejects_empty_database() {
        let config = AdvisorConfig {
            database: String::new(),
            user: "postgres".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_worker_count_above_twenty() {
        let config = AdvisorConfig {
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            workers: 21,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn from_env_applies_overrides() {
        unsafe {
            env::set_var("DB_HOST", "db.internal");
            env::set_var("DB_NAME", "app");
            env::set_var("DB_USER", "app_ro");
            env::set_var("ADVISOR_WORKERS", "4");
        }
        let config = AdvisorConfig::from_env().unwrap();
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.workers, 4);
        unsafe {
            env::remove_var("DB_HOST");
            env::remove_var("DB_NAME");
            env::remove_var("DB_USER");
            env::remove_var("ADVISOR_WORKERS");
        }
    }
}
