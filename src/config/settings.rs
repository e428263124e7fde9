//! Configuration settings for fieldsync.
//!
//! Settings are loaded from `~/.fieldsync/config.yaml`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::args::OutputFormat;
use crate::config::Paths;
use crate::error::FieldsyncError;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// General settings.
    pub general: GeneralConfig,
    /// Remote API settings.
    pub server: ServerConfig,
    /// Sync queue settings.
    pub sync: SyncConfig,
    /// Offline cache settings.
    pub cache: CacheConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default output format.
    #[serde(default = "default_output_format")]
    pub default_output: OutputFormat,
    /// Color output setting.
    #[serde(default = "default_color")]
    pub color: ColorSetting,
}

/// Color output setting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColorSetting {
    /// Auto-detect based on terminal.
    #[default]
    Auto,
    /// Always use colors.
    Always,
    /// Never use colors.
    Never,
}

/// Remote API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the farm-management API.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Timeout applied to every executor request.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Path probed to measure reachability.
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Timeout of the reachability probe.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

/// Sync queue settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Failed attempts before an item is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff table in seconds, indexed by attempt number.
    #[serde(default = "default_retry_delays")]
    pub retry_delays_secs: Vec<u64>,
    /// Delay before the follow-up pass scheduled when work remains.
    #[serde(default = "default_followup_delay_ms")]
    pub followup_delay_ms: u64,
    /// Hours completed items are kept; 0 deletes them on completion.
    #[serde(default = "default_completed_retention_hours")]
    pub completed_retention_hours: u64,
    /// Hours failed items are kept before `cleanup` purges them.
    #[serde(default = "default_cleanup_retention_hours")]
    pub cleanup_retention_hours: u64,
    /// Start a pass right after `enqueue` when online.
    #[serde(default = "default_true")]
    pub process_on_enqueue: bool,
    /// Mark permanently failing items failed without using the retry budget.
    #[serde(default)]
    pub fail_fast_on_permanent: bool,
    /// Tag passed to the background sync hook.
    #[serde(default = "default_background_sync_tag")]
    pub background_sync_tag: String,
}

/// Offline cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which time-series records are pruned.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

/// Upper bound for a single retry delay (one week).
const MAX_RETRY_DELAY_SECS: u64 = 7 * 24 * 60 * 60;
/// Upper bound for queue retention windows (ten years).
const MAX_RETENTION_HOURS: u64 = 10 * 365 * 24;

// Default value functions for serde
const fn default_output_format() -> OutputFormat {
    OutputFormat::Pretty
}

const fn default_color() -> ColorSetting {
    ColorSetting::Auto
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

const fn default_timeout_secs() -> u64 {
    30
}

fn default_health_path() -> String {
    "/api/health".to_string()
}

const fn default_probe_timeout_secs() -> u64 {
    5
}

const fn default_max_retries() -> u32 {
    3
}

fn default_retry_delays() -> Vec<u64> {
    vec![5, 10, 30, 60]
}

const fn default_followup_delay_ms() -> u64 {
    1000
}

const fn default_completed_retention_hours() -> u64 {
    24
}

const fn default_cleanup_retention_hours() -> u64 {
    168 // one week
}

const fn default_true() -> bool {
    true
}

fn default_background_sync_tag() -> String {
    "sync-pending-operations".to_string()
}

const fn default_max_age_days() -> u32 {
    30
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_output: default_output_format(),
            color: default_color(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            health_path: default_health_path(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl ServerConfig {
    /// Per-request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Reachability probe timeout.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delays_secs: default_retry_delays(),
            followup_delay_ms: default_followup_delay_ms(),
            completed_retention_hours: default_completed_retention_hours(),
            cleanup_retention_hours: default_cleanup_retention_hours(),
            process_on_enqueue: default_true(),
            fail_fast_on_permanent: false,
            background_sync_tag: default_background_sync_tag(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
        }
    }
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// If the config file doesn't exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self, FieldsyncError> {
        let paths = Paths::new()?;
        Self::load_from_path(&paths.config_file)
    }

    /// Load configuration from a specific path.
    ///
    /// If the config file doesn't exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load_from_path(path: &std::path::Path) -> Result<Self, FieldsyncError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            FieldsyncError::Config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        let config: Self = serde_yaml::from_str(&contents).map_err(|e| {
            FieldsyncError::Config(format!(
                "Failed to parse config file {}: {e}",
                path.display()
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save_to_path(&self, path: &std::path::Path) -> Result<(), FieldsyncError> {
        let contents = serde_yaml::to_string(self)
            .map_err(|e| FieldsyncError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, contents).map_err(|e| {
            FieldsyncError::Config(format!(
                "Failed to write config file {}: {e}",
                path.display()
            ))
        })
    }

    /// Reject settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a config error describing the first invalid value.
    pub fn validate(&self) -> Result<(), FieldsyncError> {
        if self.sync.max_retries == 0 {
            return Err(FieldsyncError::Config(
                "sync.max_retries must be at least 1".to_string(),
            ));
        }
        if self.sync.retry_delays_secs.is_empty() {
            return Err(FieldsyncError::Config(
                "sync.retry_delays_secs must not be empty".to_string(),
            ));
        }
        if let Some(delay) = self
            .sync
            .retry_delays_secs
            .iter()
            .find(|&&d| d > MAX_RETRY_DELAY_SECS)
        {
            return Err(FieldsyncError::Config(format!(
                "sync.retry_delays_secs entries must be at most {MAX_RETRY_DELAY_SECS}, got {delay}"
            )));
        }
        if self.sync.followup_delay_ms > MAX_RETRY_DELAY_SECS * 1000 {
            return Err(FieldsyncError::Config(format!(
                "sync.followup_delay_ms must be at most {}",
                MAX_RETRY_DELAY_SECS * 1000
            )));
        }
        for (name, hours) in [
            ("completed_retention_hours", self.sync.completed_retention_hours),
            ("cleanup_retention_hours", self.sync.cleanup_retention_hours),
        ] {
            if hours > MAX_RETENTION_HOURS {
                return Err(FieldsyncError::Config(format!(
                    "sync.{name} must be at most {MAX_RETENTION_HOURS}, got {hours}"
                )));
            }
        }
        if !self.server.base_url.starts_with("http://")
            && !self.server.base_url.starts_with("https://")
        {
            return Err(FieldsyncError::Config(format!(
                "server.base_url must be an http(s) URL, got '{}'",
                self.server.base_url
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.general.default_output, OutputFormat::Pretty);
        assert_eq!(config.general.color, ColorSetting::Auto);
        assert_eq!(config.server.base_url, "http://localhost:3000");
        assert_eq!(config.server.timeout(), Duration::from_secs(30));
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.retry_delays_secs, vec![5, 10, 30, 60]);
        assert_eq!(config.sync.background_sync_tag, "sync-pending-operations");
        assert!(config.sync.process_on_enqueue);
        assert!(!config.sync.fail_fast_on_permanent);
        assert_eq!(config.cache.max_age_days, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let config = Config::load_from_path(&config_path).unwrap();

        // Should return defaults when file doesn't exist
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut config = Config::default();
        config.server.base_url = "https://agro.example.com".to_string();
        config.sync.completed_retention_hours = 0;

        config.save_to_path(&config_path).unwrap();

        let loaded = Config::load_from_path(&config_path).unwrap();

        assert_eq!(loaded.server.base_url, "https://agro.example.com");
        assert_eq!(loaded.sync.completed_retention_hours, 0);
    }

    #[test]
    fn test_partial_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let partial_yaml = r"
sync:
  max_retries: 5
";
        std::fs::write(&config_path, partial_yaml).unwrap();

        let config = Config::load_from_path(&config_path).unwrap();

        assert_eq!(config.sync.max_retries, 5);
        // Defaults should be used for missing fields
        assert_eq!(config.sync.retry_delays_secs, vec![5, 10, 30, 60]);
        assert_eq!(config.server.health_path, "/api/health");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        std::fs::write(&config_path, "sync:\n  retry_delays_secs: []\n").unwrap();
        let err = Config::load_from_path(&config_path).unwrap_err();
        assert!(matches!(err, FieldsyncError::Config(_)));

        std::fs::write(&config_path, "server:\n  base_url: ftp://farm\n").unwrap();
        assert!(Config::load_from_path(&config_path).is_err());
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let mut config = Config::default();
        config.sync.retry_delays_secs = vec![5, u64::MAX];
        assert!(matches!(config.validate(), Err(FieldsyncError::Config(_))));

        let mut config = Config::default();
        config.sync.cleanup_retention_hours = u64::MAX;
        assert!(matches!(config.validate(), Err(FieldsyncError::Config(_))));

        let mut config = Config::default();
        config.sync.retry_delays_secs = vec![7 * 24 * 60 * 60];
        config.sync.completed_retention_hours = 10 * 365 * 24;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        std::fs::write(&config_path, "sync: [unclosed").unwrap();
        assert!(Config::load_from_path(&config_path).is_err());
    }
}
