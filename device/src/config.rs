//! Configuration management for the device host.

use msync_engine::MoneyPolicy;
use std::env;

/// Device configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Name given to this device when it is first set up
    pub device_name: String,
    /// Maximum pooled database connections
    pub max_connections: u32,
    /// How incoming money changes are merged
    pub money_policy: MoneyPolicy,
    /// Default bundle passphrase for the command line
    pub passphrase: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("MSYNC_DATABASE_URL").unwrap_or_else(|_| "sqlite://msync.db".to_string());

        let device_name = env::var("MSYNC_DEVICE_NAME")
            .ok()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(default_device_name);

        let max_connections = env::var("MSYNC_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .ok()
            .filter(|&n: &u32| n > 0)
            .ok_or(ConfigError::InvalidMaxConnections)?;

        let money_policy = match env::var("MSYNC_MONEY_POLICY") {
            Ok(value) => value
                .parse()
                .map_err(|_| ConfigError::InvalidMoneyPolicy(value))?,
            Err(_) => MoneyPolicy::default(),
        };

        let passphrase = env::var("MSYNC_PASSPHRASE").ok().filter(|p| !p.is_empty());

        Ok(Self {
            database_url,
            device_name,
            max_connections,
            money_policy,
            passphrase,
        })
    }

    /// Configuration for a database file, with defaults for everything else.
    pub fn for_database(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            device_name: default_device_name(),
            max_connections: 5,
            money_policy: MoneyPolicy::default(),
            passphrase: None,
        }
    }
}

fn default_device_name() -> String {
    env::var("HOSTNAME")
        .or_else(|_| env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "This device".to_string())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid MSYNC_MAX_CONNECTIONS value")]
    InvalidMaxConnections,

    #[error("Invalid MSYNC_MONEY_POLICY value '{0}' (expected fast-forward or review-all)")]
    InvalidMoneyPolicy(String),
}
