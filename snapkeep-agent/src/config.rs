//! Configuration management for the snapkeep agent.
//!
//! Loads configuration from a TOML file. Every field has an explicit default
//! applied at deserialization time, so a loaded `Config` is always complete.

use crate::utils::errors::{Result, SnapkeepError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Lowest accepted poll cadence.
pub const MIN_POLL_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// File under watch
    pub source_path: PathBuf,

    /// Archive root; created if absent
    pub archive_path: PathBuf,

    /// Fallback poll cadence in milliseconds (>= 500)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Burst-coalescing window in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Retention ceiling (>= 1)
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    /// What to do when a capture matches the newest backup
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
}

/// Handling of a capture whose digest equals the newest record's digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Discard the copy and leave the ledger untouched.
    #[default]
    Skip,
    /// Append a ledger record but delete its archive file. The record
    /// references a file that no longer exists.
    Record,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_max_backups() -> usize {
    20
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl MonitorConfig {
    /// Build a configuration for `source_path` with every other field defaulted
    pub fn new(source_path: impl Into<PathBuf>, archive_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            archive_path: archive_path.into(),
            poll_interval_ms: default_poll_interval_ms(),
            debounce_ms: default_debounce_ms(),
            max_backups: default_max_backups(),
            duplicate_policy: DuplicatePolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.source_path.is_absolute() {
            return Err(SnapkeepError::Config(format!(
                "source_path must be absolute: {}",
                self.source_path.display()
            )));
        }
        if !self.archive_path.is_absolute() {
            return Err(SnapkeepError::Config(format!(
                "archive_path must be absolute: {}",
                self.archive_path.display()
            )));
        }
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(SnapkeepError::Config(format!(
                "poll_interval_ms must be at least {}, got {}",
                MIN_POLL_INTERVAL_MS, self.poll_interval_ms
            )));
        }
        if self.debounce_ms == 0 {
            return Err(SnapkeepError::Config("debounce_ms must be positive".into()));
        }
        if self.max_backups == 0 {
            return Err(SnapkeepError::Config("max_backups must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = toml::from_str(
            r#"
            [monitor]
            source_path = "/home/user/notes.txt"
            archive_path = "/home/user/.snapkeep"
            "#,
        )
        .unwrap();

        assert_eq!(config.monitor.poll_interval_ms, 2000);
        assert_eq!(config.monitor.debounce_ms, 1000);
        assert_eq!(config.monitor.max_backups, 20);
        assert_eq!(config.monitor.duplicate_policy, DuplicatePolicy::Skip);
        assert_eq!(config.log.level, "info");
        assert!(config.monitor.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [monitor]
            source_path = "/data/save.dat"
            archive_path = "/data/archive"
            poll_interval_ms = 750
            debounce_ms = 250
            max_backups = 3
            duplicate_policy = "record"

            [log]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.monitor.poll_interval_ms, 750);
        assert_eq!(config.monitor.max_backups, 3);
        assert_eq!(config.monitor.duplicate_policy, DuplicatePolicy::Record);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_validate_rejects_fast_poll() {
        let mut config = MonitorConfig::new("/a/file", "/a/archive");
        config.poll_interval_ms = 100;
        assert!(matches!(config.validate(), Err(SnapkeepError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_retention() {
        let mut config = MonitorConfig::new("/a/file", "/a/archive");
        config.max_backups = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_paths() {
        let config = MonitorConfig::new("file.txt", "/a/archive");
        assert!(config.validate().is_err());
    }
}
