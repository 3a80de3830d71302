use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::PhxError;

/// What the router does when a bounded event queue is full
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Never drop. Envelopes that do not fit wait, in order, until the
    /// worker makes room; frames keep being read meanwhile.
    #[default]
    Block,
    /// Discard the incoming envelope
    DropNewest,
    /// Discard the oldest queued envelope
    DropOldest,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// `None` means unbounded
    #[serde(default)]
    pub capacity: Option<usize>,

    #[serde(default)]
    pub overflow: OverflowPolicy,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// `None` retries forever
    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl ReconnectConfig {
    /// Backoff before reconnect attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: None,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Zero disables heartbeats
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn validate(&self) -> Result<(), PhxError> {
        if self.queue.capacity == Some(0) {
            return Err(PhxError::Config(
                "queue.capacity must be at least 1".to_string(),
            ));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(PhxError::Config(
                "reconnect.base_delay_ms must not exceed reconnect.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            queue: QueueConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

/// Load a client config from a TOML file, falling back to defaults when the
/// file does not exist.
pub fn load_config(path: &Path) -> Result<ClientConfig, PhxError> {
    if !path.exists() {
        debug!("Config file does not exist, using defaults");
        return Ok(ClientConfig::default());
    }

    debug!("Loading config from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| PhxError::Config(format!("{}: {e}", path.display())))?;
    let config: ClientConfig =
        toml::from_str(&content).map_err(|e| PhxError::Config(e.to_string()))?;
    config.validate()?;

    debug!("Loaded config: {:?}", config);
    Ok(config)
}
