//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/streamwatch/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/streamwatch/` (~/.config/streamwatch/)
//! - Data: `$XDG_DATA_HOME/streamwatch/` (~/.local/share/streamwatch/)
//! - State/Logs: `$XDG_STATE_HOME/streamwatch/` (~/.local/state/streamwatch/)
//!
//! The monitoring thresholds (grouping window, stale timeouts, poll
//! intervals, retention horizon) are empirically chosen defaults and are all
//! overridable in `[monitoring]`.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Activity monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Database configuration
#[derive(Debug, Deserialize, Default)]
pub struct DatabaseConfig {
    /// Override path for the SQLite database file
    pub path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Activity monitoring configuration.
///
/// Cloned into every collector context so background tasks never reach back
/// into shared mutable configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct MonitoringConfig {
    /// How often the orchestrator reconciles collectors against the registry
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Maximum number of concurrently running collectors
    #[serde(default = "default_max_collectors")]
    pub max_collectors: usize,

    /// Capacity of the collector -> ingestion event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// HTTP timeout for backend requests
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    // Poll cadence per protocol
    /// Plex backup poll while the alert stream is live
    #[serde(default = "default_plex_backup_poll")]
    pub plex_backup_poll_secs: u64,

    /// Plex: tracked sessions unseen live for longer than this are force-stopped
    #[serde(default = "default_plex_orphan")]
    pub plex_orphan_secs: u64,

    #[serde(default = "default_jellyfin_poll")]
    pub jellyfin_poll_secs: u64,

    #[serde(default = "default_audiobookshelf_poll")]
    pub audiobookshelf_poll_secs: u64,

    #[serde(default = "default_generic_poll")]
    pub generic_poll_secs: u64,

    /// Poll interval after a push channel permanently falls back to polling
    #[serde(default = "default_fallback_poll")]
    pub fallback_poll_secs: u64,

    /// Cap for the per-iteration poll error backoff
    #[serde(default = "default_poll_backoff_cap")]
    pub poll_backoff_cap_secs: u64,

    // Push transport retry policy
    /// Subscription attempts before permanently demoting to polling
    #[serde(default = "default_transport_retries")]
    pub transport_retry_attempts: u32,

    /// Backoff base; attempt N waits base * N, capped below
    #[serde(default = "default_transport_backoff_base")]
    pub transport_backoff_base_secs: u64,

    #[serde(default = "default_transport_backoff_cap")]
    pub transport_backoff_cap_secs: u64,

    /// Emby websocket keep-alive ping interval
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    // Plex session state machine
    /// Sessions with less real play time than this are discarded, not persisted
    #[serde(default = "default_min_play")]
    pub session_min_play_secs: i64,

    /// One-shot force-stop timer; reset by every alert for the session
    #[serde(default = "default_session_stale")]
    pub session_stale_secs: u64,

    /// Progress emission cadence once a session is enriched
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: i64,

    /// Progress/enrichment retry cadence while enrichment is outstanding
    #[serde(default = "default_enrichment_retry")]
    pub enrichment_retry_secs: i64,

    /// Buffer events per session before a warning is logged
    #[serde(default = "default_buffer_warn")]
    pub buffer_warn_threshold: u32,

    // Ingestion
    /// Window within which sessions for the same user/media are grouped
    #[serde(default = "default_grouping_window")]
    pub grouping_window_secs: i64,

    /// Commit attempts for lock-contended writes
    #[serde(default = "default_commit_retries")]
    pub commit_retry_attempts: u32,

    /// Base delay for commit retries; doubles per attempt
    #[serde(default = "default_commit_retry_base")]
    pub commit_retry_base_ms: u64,

    // Maintenance
    /// Active sessions untouched for this long are ended by the sweep
    #[serde(default = "default_stale_session_hours")]
    pub stale_session_hours: i64,

    /// Conservative updated_at cutoff when startup recovery cannot reach a server
    #[serde(default = "default_recovery_cutoff")]
    pub recovery_cutoff_secs: i64,

    /// Sessions older than this many days are deleted
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// How often retention and the stale sweep run
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            max_collectors: default_max_collectors(),
            event_buffer: default_event_buffer(),
            http_timeout_secs: default_http_timeout(),
            plex_backup_poll_secs: default_plex_backup_poll(),
            plex_orphan_secs: default_plex_orphan(),
            jellyfin_poll_secs: default_jellyfin_poll(),
            audiobookshelf_poll_secs: default_audiobookshelf_poll(),
            generic_poll_secs: default_generic_poll(),
            fallback_poll_secs: default_fallback_poll(),
            poll_backoff_cap_secs: default_poll_backoff_cap(),
            transport_retry_attempts: default_transport_retries(),
            transport_backoff_base_secs: default_transport_backoff_base(),
            transport_backoff_cap_secs: default_transport_backoff_cap(),
            keepalive_secs: default_keepalive(),
            session_min_play_secs: default_min_play(),
            session_stale_secs: default_session_stale(),
            progress_interval_secs: default_progress_interval(),
            enrichment_retry_secs: default_enrichment_retry(),
            buffer_warn_threshold: default_buffer_warn(),
            grouping_window_secs: default_grouping_window(),
            commit_retry_attempts: default_commit_retries(),
            commit_retry_base_ms: default_commit_retry_base(),
            stale_session_hours: default_stale_session_hours(),
            recovery_cutoff_secs: default_recovery_cutoff(),
            retention_days: default_retention_days(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

impl MonitoringConfig {
    /// Transport backoff for a 1-based retry attempt, capped.
    pub fn transport_backoff(&self, attempt: u32) -> Duration {
        let secs = self
            .transport_backoff_base_secs
            .saturating_mul(u64::from(attempt))
            .min(self.transport_backoff_cap_secs);
        Duration::from_secs(secs)
    }
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_max_collectors() -> usize {
    10
}

fn default_event_buffer() -> usize {
    256
}

fn default_http_timeout() -> u64 {
    10
}

fn default_plex_backup_poll() -> u64 {
    10
}

fn default_plex_orphan() -> u64 {
    60
}

fn default_jellyfin_poll() -> u64 {
    10
}

fn default_audiobookshelf_poll() -> u64 {
    30
}

fn default_generic_poll() -> u64 {
    30
}

fn default_fallback_poll() -> u64 {
    30
}

fn default_poll_backoff_cap() -> u64 {
    60
}

fn default_transport_retries() -> u32 {
    5
}

fn default_transport_backoff_base() -> u64 {
    5
}

fn default_transport_backoff_cap() -> u64 {
    60
}

fn default_keepalive() -> u64 {
    30
}

fn default_min_play() -> i64 {
    10
}

fn default_session_stale() -> u64 {
    300
}

fn default_progress_interval() -> i64 {
    30
}

fn default_enrichment_retry() -> i64 {
    10
}

fn default_buffer_warn() -> u32 {
    3
}

fn default_grouping_window() -> i64 {
    1800
}

fn default_commit_retries() -> u32 {
    3
}

fn default_commit_retry_base() -> u64 {
    100
}

fn default_stale_session_hours() -> i64 {
    24
}

fn default_recovery_cutoff() -> i64 {
    3600
}

fn default_retention_days() -> i64 {
    90
}

fn default_maintenance_interval() -> u64 {
    3600
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate config values that would break the engine at runtime.
    pub fn validate(&self) -> Result<()> {
        let m = &self.monitoring;
        if m.max_collectors == 0 {
            return Err(Error::Config(
                "monitoring.max_collectors must be at least 1".to_string(),
            ));
        }
        if m.event_buffer == 0 {
            return Err(Error::Config(
                "monitoring.event_buffer must be at least 1".to_string(),
            ));
        }
        if m.reconcile_interval_secs == 0 {
            return Err(Error::Config(
                "monitoring.reconcile_interval_secs must be at least 1".to_string(),
            ));
        }
        if m.retention_days <= 0 {
            return Err(Error::Config(
                "monitoring.retention_days must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/streamwatch/config.toml` (~/.config/streamwatch/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("streamwatch").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite database)
    ///
    /// `$XDG_DATA_HOME/streamwatch/` (~/.local/share/streamwatch/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("streamwatch")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/streamwatch/` (~/.local/state/streamwatch/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("streamwatch")
    }

    /// Returns the database file path, honoring the `[database]` override.
    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("data.db"))
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/streamwatch/streamwatch.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("streamwatch.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.monitoring.reconcile_interval_secs, 30);
        assert_eq!(config.monitoring.max_collectors, 10);
        assert_eq!(config.monitoring.grouping_window_secs, 1800);
        assert_eq!(config.monitoring.session_min_play_secs, 10);
        assert_eq!(config.monitoring.session_stale_secs, 300);
        assert_eq!(config.monitoring.stale_session_hours, 24);
        assert_eq!(config.monitoring.retention_days, 90);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[logging]
level = "debug"

[monitoring]
grouping_window_secs = 900
retention_days = 30
jellyfin_poll_secs = 5
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.monitoring.grouping_window_secs, 900);
        assert_eq!(config.monitoring.retention_days, 30);
        assert_eq!(config.monitoring.jellyfin_poll_secs, 5);
        // Untouched fields keep their defaults
        assert_eq!(config.monitoring.session_min_play_secs, 10);
    }

    #[test]
    fn test_validate_rejects_zero_collectors() {
        let toml = r#"
[monitoring]
max_collectors = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transport_backoff_caps() {
        let m = MonitoringConfig::default();
        assert_eq!(m.transport_backoff(1), Duration::from_secs(5));
        assert_eq!(m.transport_backoff(3), Duration::from_secs(15));
        // 5s * 20 would be 100s; capped at 60s
        assert_eq!(m.transport_backoff(20), Duration::from_secs(60));
    }
}
