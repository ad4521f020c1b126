//! Persistent acquisition configuration
//!
//! Pool geometry, pacing and the initial device settings, stored as JSON.
//! Every field has a default so partial files stay loadable.

use crate::acquisition::gate::ArmMode;
use crate::device::{InputStage, TriggerEdge, TriggerSource};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_pool_size() -> usize {
    crate::DEFAULT_POOL_SIZE
}

fn default_poll_interval_ms() -> u64 {
    crate::DEFAULT_POLL_INTERVAL_MS
}

fn default_read_timeout_ms() -> u64 {
    crate::DEFAULT_READ_TIMEOUT_MS
}

/// Acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Number of pooled sample buffers
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Target loop period in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Timeout handed to every async device read
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Trigger mode at start
    #[serde(default)]
    pub initial_mode: ArmMode,
    /// Pretrigger samples to program at start (None = keep device value)
    #[serde(default)]
    pub pre_trigger_samples: Option<usize>,
    /// Total decimation to program at start
    #[serde(default)]
    pub decimation: Option<u32>,
    /// Trigger level in percent of full scale
    #[serde(default)]
    pub trigger_level_percent: Option<f64>,
    /// Trigger source (None = keep device value)
    #[serde(default)]
    pub trigger_source: Option<TriggerSource>,
    /// Trigger edge (None = keep device value)
    #[serde(default)]
    pub trigger_edge: Option<TriggerEdge>,
    /// Auto trigger on or off
    #[serde(default)]
    pub auto_trigger: Option<bool>,
    /// Variable attenuation per channel in dB, starting at channel A
    #[serde(default)]
    pub attenuation_db: Vec<f64>,
    /// Input stage switches per channel, starting at channel A
    #[serde(default)]
    pub input_stages: Vec<InputStage>,
    /// Channel written by single-channel exports
    #[serde(default)]
    pub export_channel: usize,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            poll_interval_ms: default_poll_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            initial_mode: ArmMode::default(),
            pre_trigger_samples: None,
            decimation: None,
            trigger_level_percent: None,
            trigger_source: None,
            trigger_edge: None,
            auto_trigger: None,
            attenuation_db: Vec::new(),
            input_stages: Vec::new(),
            export_channel: 0,
        }
    }
}

impl ScopeConfig {
    /// Load config from `path`, falling back to defaults on any error
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded config from disk");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Save config to `path`, creating parent directories if needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }

    /// Reject values the loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            bail!("pool_size must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be at least 1");
        }
        if self.read_timeout_ms == 0 {
            bail!("read_timeout_ms must be at least 1");
        }
        if let Some(0) = self.decimation {
            bail!("decimation must be at least 1");
        }
        if let Some(db) = self.attenuation_db.iter().find(|db| !db.is_finite()) {
            bail!("attenuation_db entries must be finite, got {db}");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}
