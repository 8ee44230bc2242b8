use crate::actor::{StallPolicy, DEFAULT_LANE_IDLE};
use crate::persistence::{DEFAULT_MAX_THREADS, DEFAULT_STORAGE_KEY};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use weft_contract::DisplayMode;
use weft_protocol_langgraph::DEFAULT_STREAM_MODES;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config (JSON): {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Runtime configuration. Every field has a default, so `{}` is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    pub assistant_id: String,
    pub actor_timeout_ms: u64,
    /// Idle time after which a thread's actor lane is retired.
    pub lane_idle_ms: u64,
    pub stall_policy: StallPolicy,
    pub max_threads: usize,
    pub storage_key: String,
    pub display_mode: DisplayMode,
    /// Stream modes always requested; callers' modes are added on top.
    pub stream_modes: Vec<String>,
}

impl Default for WeftConfig {
    fn default() -> Self {
        Self {
            assistant_id: "agent".to_string(),
            actor_timeout_ms: 5000,
            lane_idle_ms: DEFAULT_LANE_IDLE.as_millis() as u64,
            stall_policy: StallPolicy::default(),
            max_threads: DEFAULT_MAX_THREADS,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            display_mode: DisplayMode::default(),
            stream_modes: DEFAULT_STREAM_MODES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl WeftConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.actor_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "actor_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.lane_idle_ms == 0 {
            return Err(ConfigError::Invalid(
                "lane_idle_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_threads == 0 {
            return Err(ConfigError::Invalid(
                "max_threads must be greater than zero".to_string(),
            ));
        }
        if self.storage_key.trim().is_empty() {
            return Err(ConfigError::Invalid("storage_key cannot be empty".to_string()));
        }
        if self.assistant_id.trim().is_empty() {
            return Err(ConfigError::Invalid("assistant_id cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn actor_timeout(&self) -> Duration {
        Duration::from_millis(self.actor_timeout_ms)
    }

    pub fn lane_idle(&self) -> Duration {
        Duration::from_millis(self.lane_idle_ms)
    }
}
