//! Runtime configuration.
//!
//! Loaded once at startup from an optional YAML file (`crm.yaml`, or the path
//! in `CRM_CONFIG`) overlaid by `CRM__SECTION__KEY` environment variables.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::idem::HashAlgo;

/// Default configuration file name (extension resolved by the loader).
pub const DEFAULT_CONFIG_FILE: &str = "crm";
/// Environment variable holding an explicit configuration file path.
pub const CONFIG_ENV_VAR: &str = "CRM_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CRM";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("store.isolation must be at least read_committed, got {0:?}")]
    IsolationTooWeak(Isolation),

    #[error("store.statement_timeout_ms must be greater than zero")]
    ZeroStatementTimeout,

    #[error("store.max_connections must be greater than zero")]
    ZeroConnections,
}

/// Transaction isolation level requested for the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Isolation {
    /// Statement that opens a transaction at this level. Both take the
    /// database write lock up front.
    pub fn begin_statement(self) -> &'static str {
        match self {
            Isolation::Serializable => "BEGIN EXCLUSIVE",
            _ => "BEGIN IMMEDIATE",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub idempotency: IdempotencyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database URL, e.g. `sqlite://crm.db`.
    pub url: String,
    pub max_connections: u32,
    pub isolation: Isolation,
    /// Upper bound on a single statement, lock waits included.
    pub statement_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: IN_MEMORY_URL.to_string(),
            max_connections: 4,
            isolation: Isolation::ReadCommitted,
            statement_timeout_ms: 5_000,
        }
    }
}

/// Private in-memory database, dropped with the store.
pub const IN_MEMORY_URL: &str = "sqlite::memory:";

impl StoreConfig {
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }

    pub fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Hash used to shorten derived keys longer than 64 characters.
    pub hash: HashAlgo,
}

impl Config {
    /// Load configuration from files and environment, then validate it.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File};

        let mut builder =
            ConfigLib::builder().add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::with_name(config_path).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.isolation < Isolation::ReadCommitted {
            return Err(ConfigError::IsolationTooWeak(self.store.isolation));
        }
        if self.store.statement_timeout_ms == 0 {
            return Err(ConfigError::ZeroStatementTimeout);
        }
        if self.store.max_connections == 0 {
            return Err(ConfigError::ZeroConnections);
        }
        Ok(())
    }
}
