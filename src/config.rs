//! Guard configuration, persisted to `config.json` in the platform config directory.
//!
//! On macOS this resolves to `~/Library/Application Support/hsse-guard/`,
//! on Linux to `$XDG_CONFIG_HOME/hsse-guard/`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::transport::EntityFilter;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "warning threshold ({warning_threshold_ms} ms) must be shorter than the idle timeout ({idle_timeout_ms} ms)"
    )]
    WarningNotBeforeTimeout {
        idle_timeout_ms: u64,
        warning_threshold_ms: u64,
    },
    #[error("idle timeout must be greater than zero")]
    ZeroTimeout,
}

// ---------------------------------------------------------------------------
// Idle timer
// ---------------------------------------------------------------------------

/// Idle timeout settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleTimerConfig {
    /// Total inactivity before the session is terminated
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Length of the warning countdown that precedes the timeout
    #[serde(default = "default_warning_threshold_ms")]
    pub warning_threshold_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_idle_timeout_ms() -> u64 {
    15 * 60 * 1000
}

fn default_warning_threshold_ms() -> u64 {
    2 * 60 * 1000
}

fn default_enabled() -> bool {
    true
}

impl Default for IdleTimerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            warning_threshold_ms: default_warning_threshold_ms(),
            enabled: default_enabled(),
        }
    }
}

impl IdleTimerConfig {
    pub fn new(idle_timeout_ms: u64, warning_threshold_ms: u64) -> Self {
        Self {
            idle_timeout_ms,
            warning_threshold_ms,
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn warning_threshold(&self) -> Duration {
        Duration::from_millis(self.warning_threshold_ms)
    }

    /// Time after last activity at which the warning countdown begins.
    pub fn warning_offset(&self) -> Duration {
        self.idle_timeout().saturating_sub(self.warning_threshold())
    }

    /// Full countdown length in whole seconds (rounded up).
    pub fn timeout_secs(&self) -> u64 {
        self.idle_timeout_ms.div_ceil(1000)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.warning_threshold_ms >= self.idle_timeout_ms {
            return Err(ConfigError::WarningNotBeforeTimeout {
                idle_timeout_ms: self.idle_timeout_ms,
                warning_threshold_ms: self.warning_threshold_ms,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Realtime
// ---------------------------------------------------------------------------

/// Realtime notification settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Severity hints that raise an alert on insert (compared lowercase)
    #[serde(default = "default_alert_severities")]
    pub alert_severities: Vec<String>,
    /// Record field holding the severity hint
    #[serde(default = "default_severity_field")]
    pub severity_field: String,
    /// Play a sound alongside the alert toast
    #[serde(default = "default_enabled")]
    pub alert_sound: bool,
    /// Emit a cache invalidation hint for every accepted change
    #[serde(default = "default_enabled")]
    pub invalidate_on_change: bool,
}

fn default_alert_severities() -> Vec<String> {
    vec!["critical".to_string(), "high".to_string()]
}

fn default_severity_field() -> String {
    "severity".to_string()
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            alert_severities: default_alert_severities(),
            severity_field: default_severity_field(),
            alert_sound: true,
            invalidate_on_change: true,
        }
    }
}

impl RealtimeConfig {
    pub fn is_alert_severity(&self, hint: &str) -> bool {
        self.alert_severities
            .iter()
            .any(|s| s.eq_ignore_ascii_case(hint))
    }
}

/// A realtime channel the daemon subscribes to at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub key: String,
    pub table: String,
    /// Narrow the channel to one record (`filter_column = filter_value`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_value: Option<String>,
}

impl ChannelConfig {
    pub fn entity_filter(&self) -> EntityFilter {
        let filter = EntityFilter::table(&self.table);
        match (&self.filter_column, &self.filter_value) {
            (Some(column), Some(value)) => filter.with_row(column, value),
            _ => filter,
        }
    }
}

fn default_channels() -> Vec<ChannelConfig> {
    vec![ChannelConfig {
        key: "incident-notifications".to_string(),
        table: "incidents".to_string(),
        filter_column: None,
        filter_value: None,
    }]
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Daemon configuration (persisted to config.json).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub idle: IdleTimerConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
    /// Shell command run when the idle timeout terminates the session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign_out_command: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle: IdleTimerConfig::default(),
            realtime: RealtimeConfig::default(),
            channels: default_channels(),
            sign_out_command: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Directory helpers
// ---------------------------------------------------------------------------

fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("hsse-guard"))
}

/// Default config file location.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.json"))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from disk, returning defaults if the file is missing or invalid.
pub fn load_config_from(path: &Path) -> Config {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Config::default(),
    };
    match serde_json::from_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            Config::default()
        }
    }
}

/// Save config to disk.
pub fn save_config_to(config: &Config, path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Write bytes to a file atomically: write to a temp file in the same
/// directory, then rename over the target.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
