//! Configuration management module
//!
//! Provides centralized configuration including:
//! - File paths under `$HOME/.aura-notify/` (log, config, state)
//! - Engine tuning (`EngineConfig`) loaded from `config.toml`
//! - Build information (version)
//!
//! Every setting has a default, so a missing config file is not an error.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Path helpers
pub struct Config;

impl Config {
    /// Base directory: `$HOME/.aura-notify`, or a temp directory if HOME is not set
    pub fn base_dir() -> PathBuf {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".aura-notify");
        }
        std::env::temp_dir().join("aura-notify")
    }

    /// Get the log file path: `$HOME/.aura-notify/engine.log`
    pub fn log_file_path() -> PathBuf {
        Self::base_dir().join("engine.log")
    }

    /// Get the config file path: `$HOME/.aura-notify/config.toml`
    pub fn config_file_path() -> PathBuf {
        Self::base_dir().join("config.toml")
    }

    /// Get the state file path: `$HOME/.aura-notify/state.json`
    ///
    /// Holds entities, rules, execution logs, notifications and preferences
    /// for the file-backed store.
    pub fn state_file_path() -> PathBuf {
        Self::base_dir().join("state.json")
    }

    /// Ensure the base directory exists
    pub fn ensure_base_directory() -> std::io::Result<()> {
        std::fs::create_dir_all(Self::base_dir())
    }

    /// Get the version string
    pub fn version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }
}

/// Rule evaluator worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Entities per batch
    pub batch_size: usize,
    /// Entities evaluated concurrently
    pub max_concurrency: usize,
    /// No new entity is started after this many seconds
    pub pass_timeout_secs: u64,
    pub snapshot_timeout_secs: u64,
    /// Run lock lifetime; the lock expires on its own if a pass dies
    pub lock_ttl_secs: u64,
    /// Run lock key
    pub job_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrency: 8,
            pass_timeout_secs: 55,
            snapshot_timeout_secs: 10,
            lock_ttl_secs: 120,
            job_name: "rule-evaluator".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout_secs)
    }
}

/// Notification delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub max_retries: u32,
    /// Backoff base: the n-th retry waits `retry_base_secs * 2^n`
    pub retry_base_secs: u64,
    pub retry_max_delay_secs: u64,
    /// Non-terminal notifications older than this expire
    pub max_age_hours: i64,
    pub send_timeout_secs: u64,
    pub sweep_batch_size: usize,
    /// Try to dispatch right away when queuing (otherwise wait for the sweep)
    pub dispatch_on_queue: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_secs: 60,
            retry_max_delay_secs: 3600,
            max_age_hours: 24,
            send_timeout_secs: 10,
            sweep_batch_size: 100,
            dispatch_on_queue: true,
        }
    }
}

impl DeliveryConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

/// One HTTP-backed channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEndpointConfig {
    pub endpoint: String,
    /// Environment variable holding the bearer token
    #[serde(default)]
    pub token_env: Option<String>,
    /// Sender id / from address
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// External channels; unset channels are not registered
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub web_push: Option<ChannelEndpointConfig>,
    pub sms: Option<ChannelEndpointConfig>,
    pub whatsapp: Option<ChannelEndpointConfig>,
    pub email: Option<ChannelEndpointConfig>,
}

/// Built-in scheduler settings (`serve` command)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Cron expression (with seconds) for evaluation passes
    pub pass_cron: String,
    /// Cron expression (with seconds) for dispatch sweeps
    pub sweep_cron: String,
    /// Environment variable holding the shared scheduler secret
    pub secret_env: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pass_cron: "0 * * * * *".to_string(),
            sweep_cron: "30 * * * * *".to_string(),
            secret_env: "AURA_CRON_SECRET".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// The shared secret, if the environment provides one
    pub fn secret(&self) -> Option<String> {
        std::env::var(&self.secret_env)
            .ok()
            .filter(|s| !s.is_empty())
    }
}

/// Everything in `config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub worker: WorkerConfig,
    pub delivery: DeliveryConfig,
    pub channels: ChannelsConfig,
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Config: {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse config file {:?}", path))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config.worker.batch_size, 50);
        assert_eq!(config.delivery.max_retries, 3);
        assert_eq!(config.delivery.max_age_hours, 24);
        assert!(config.channels.sms.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml(
            r#"
            [worker]
            batch_size = 10
            pass_timeout_secs = 20

            [delivery]
            max_retries = 5

            [channels.sms]
            endpoint = "https://sms.example.com/v1/messages"
            token_env = "AURA_SMS_TOKEN"
            sender = "+41000000000"
            "#,
        )
        .unwrap();
        assert_eq!(config.worker.batch_size, 10);
        assert_eq!(config.worker.max_concurrency, 8);
        assert_eq!(config.worker.pass_timeout(), Duration::from_secs(20));
        assert_eq!(config.delivery.max_retries, 5);
        assert_eq!(config.delivery.retry_base_secs, 60);
        let sms = config.channels.sms.unwrap();
        assert_eq!(sms.token_env.as_deref(), Some("AURA_SMS_TOKEN"));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.scheduler.secret_env, "AURA_CRON_SECRET");
    }
}
