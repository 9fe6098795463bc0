use super::types::*;
use crate::error_handling::types::ConfigError;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration, read from a TOML file.
///
/// Every field has a default, so an empty file is a valid configuration:
///
/// ```toml
/// storage_path = "/var/lib/forensic-engine"
///
/// [dissector]
/// tshark_path = "/usr/bin/tshark"
/// analysis_timeout_secs = 300
///
/// [dispatcher]
/// max_concurrent_jobs = 2
/// max_queued_jobs = 8
/// ```
///
/// # Fields Overview
///
/// - `storage_path`: directory holding uploaded and live-captured files (`<id>-<name>`)
/// - `dissector`: dissector location, timeouts and correlation knobs
/// - `dispatcher`: concurrency limit and wait-queue depth for heavy jobs
/// - `capture`: live capture tool, start grace window and stop timeout
/// - `follow`: default follow-stream budgets
/// - `rules`: rule flag thresholds
#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub storage_path: PathBuf,
    pub dissector: DissectorConfig,
    pub dispatcher: DispatcherConfig,
    pub capture: CaptureConfig,
    pub follow: FollowConfig,
    pub rules: RuleThresholds,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("forensic-data"),
            dissector: DissectorConfig::default(),
            dispatcher: DispatcherConfig::default(),
            capture: CaptureConfig::default(),
            follow: FollowConfig::default(),
            rules: RuleThresholds::default(),
        }
    }
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        debug!("Configuration parsed: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_path.exists() && !self.storage_path.is_dir() {
            return Err(ConfigError::DirectoryDoesNotExist(format!(
                "storage_path {} is not a directory",
                self.storage_path.display()
            )));
        }
        if self.dispatcher.max_concurrent_jobs == 0 {
            return Err(ConfigError::NotInRange(
                "dispatcher.max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.dissector.analysis_timeout_secs == 0 || self.dissector.stream_timeout_secs == 0 {
            return Err(ConfigError::NotInRange(
                "dissector timeouts must be at least 1 second".to_string(),
            ));
        }
        if self.capture.stop_timeout_secs == 0 {
            return Err(ConfigError::NotInRange(
                "capture.stop_timeout_secs must be at least 1 second".to_string(),
            ));
        }
        if self.follow.max_bytes_per_direction == 0
            || self.follow.max_combined_bytes == 0
            || self.follow.max_segment_bytes == 0
        {
            return Err(ConfigError::NotInRange(
                "follow budgets must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.dissector.analysis_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.dissector.stream_timeout_secs)
    }
}
