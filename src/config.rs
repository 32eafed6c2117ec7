use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::LedgerError;
use crate::transfer::retry::RetryPolicy;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LedgerConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    /// PostgreSQL connection URL; required by `LedgerServices::connect`
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Bound on row-lock waits inside one store transaction
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_lock_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: String,
    pub file: String,
    pub json: bool,
    /// `hourly`, `daily` or `never`
    pub rotation: String,
    /// Per-target level overrides, e.g. `transfer_ledger::store: debug`
    #[serde(default)]
    pub targets: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: "./logs".to_string(),
            file: "ledger.log".to_string(),
            json: false,
            rotation: "daily".to_string(),
            targets: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            acquire_timeout_ms: 5_000,
        }
    }
}

/// Retry budget for transient store conflicts
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 20,
            max_delay_ms: 500,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl LedgerConfig {
    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            LedgerError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Load `config/<env>.yaml`
    pub fn for_env(env: &str) -> Result<Self, LedgerError> {
        Self::load(format!("config/{env}.yaml"))
    }

    pub fn parse(content: &str) -> Result<Self, LedgerError> {
        let config: LedgerConfig = serde_yaml::from_str(content)?;
        if config.lock_timeout_ms == 0 {
            return Err(LedgerError::Config("lock_timeout_ms must be positive".into()));
        }
        Ok(config)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
