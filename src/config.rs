use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::services::PoolConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub pool: PoolSettings,
    pub query: QuerySettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Pool settings as read from the environment; zero disables a timeout.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    pub max_size: usize,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub connection_timeout_secs: u64,
    pub test_on_check_out: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuerySettings {
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let defaults = PoolConfig::default();
        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("pool.max_size", defaults.max_size as u64)?
            .set_default("pool.idle_timeout_secs", 300)?
            .set_default("pool.max_lifetime_secs", 1800)?
            .set_default("pool.connection_timeout_secs", 30)?
            .set_default("pool.test_on_check_out", true)?
            .set_default("query.batch_size", defaults.batch_size as u64)?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")?;

        let overrides = [
            ("HOST", "server.host"),
            ("PORT", "server.port"),
            ("POOL_MAX_SIZE", "pool.max_size"),
            ("POOL_IDLE_TIMEOUT_SECS", "pool.idle_timeout_secs"),
            ("POOL_MAX_LIFETIME_SECS", "pool.max_lifetime_secs"),
            ("POOL_CONNECTION_TIMEOUT_SECS", "pool.connection_timeout_secs"),
            ("POOL_TEST_ON_CHECK_OUT", "pool.test_on_check_out"),
            ("QUERY_BATCH_SIZE", "query.batch_size"),
            ("RUST_LOG", "logging.level"),
            ("RUST_LOG_STYLE", "logging.style"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                builder = builder.set_override(key, value)?;
            }
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Settings applied to every pool the server opens.
    pub fn pool_config(&self) -> PoolConfig {
        let optional = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        PoolConfig::new(self.pool.max_size)
            .with_idle_timeout(optional(self.pool.idle_timeout_secs))
            .with_max_lifetime(optional(self.pool.max_lifetime_secs))
            .with_connection_timeout(Duration::from_secs(self.pool.connection_timeout_secs))
            .with_test_on_check_out(self.pool.test_on_check_out)
            .with_batch_size(self.query.batch_size)
    }
}
