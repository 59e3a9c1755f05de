use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    // Directory of the file-backed swap store
    pub store_dir: PathBuf,

    // Confirmations before an observed lock is usable
    pub required_confirmations: u64,

    // Timelocks, relative to negotiation time
    #[serde(with = "humantime_serde")]
    pub initiator_lock_period: Duration,
    #[serde(with = "humantime_serde")]
    pub responder_lock_period: Duration,

    // Driver retry policy for proceed_next
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    pub max_proceed_attempts: usize,
    // Upper bound on one simulated swap, counterparty included
    #[serde(with = "humantime_serde")]
    pub swap_timeout: Duration,

    // Experiments
    pub default_amount: u64,
    pub simulated_swaps: usize,
    pub log_filter: String,
}

impl Default for SwapConfig {
    fn default() -> Self {
        SwapConfig {
            store_dir: PathBuf::from("swap-store"),
            required_confirmations: 1,
            initiator_lock_period: Duration::from_secs(48 * 3600),
            responder_lock_period: Duration::from_secs(24 * 3600),
            retry_interval: Duration::from_millis(50),
            max_proceed_attempts: 20,
            swap_timeout: Duration::from_secs(30),
            default_amount: 100,
            simulated_swaps: 10,
            log_filter: "info".to_string(),
        }
    }
}

impl SwapConfig {
    /// Loads a JSON config. Missing fields fall back to their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config: SwapConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initiator_lock_period <= self.responder_lock_period {
            return Err(ConfigError::Invalid(format!(
                "initiator_lock_period ({:?}) must be longer than responder_lock_period ({:?})",
                self.initiator_lock_period, self.responder_lock_period
            )));
        }
        if self.required_confirmations == 0 {
            return Err(ConfigError::Invalid("required_confirmations must be at least 1".to_string()));
        }
        if self.swap_timeout < self.retry_interval {
            return Err(ConfigError::Invalid("swap_timeout must not be shorter than retry_interval".to_string()));
        }
        if self.max_proceed_attempts == 0 {
            return Err(ConfigError::Invalid("max_proceed_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}
