use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_DEBOUNCE_MS, MAX_QUEUE_ENTRIES, MAX_SYNC_ATTEMPTS};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid sync config: {0}")]
    Invalid(String),
    #[error("failed to parse sync config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tuning for the queue and the executor. Shells hand this over as JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Drain attempts before an operation is parked as failed.
    pub max_attempts: u32,
    pub max_entries: usize,
    /// Window a reconnect must survive before it triggers a drain.
    pub debounce_ms: u64,
    /// Local ids of recently synced creates, kept to reject replays.
    pub completed_cache_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_SYNC_ATTEMPTS,
            max_entries: MAX_QUEUE_ENTRIES,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            completed_cache_size: 1_024,
        }
    }
}

impl SyncConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be > 0".into()));
        }
        if self.max_entries == 0 {
            return Err(ConfigError::Invalid("max_entries must be > 0".into()));
        }
        if self.completed_cache_size == 0 {
            return Err(ConfigError::Invalid(
                "completed_cache_size must be > 0".into(),
            ));
        }
        if self.debounce_ms > 60_000 {
            return Err(ConfigError::Invalid(
                "debounce_ms should not exceed 60000ms".into(),
            ));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
