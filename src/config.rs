//! Store configuration loading.
//!
//! ## Environment Variables
//! - `REDIACC_STORE_CONFIG` - Explicit YAML settings file
//! - `REDIACC_CONFIG_DIR` - Config directory (default: `~/.config/rediacc`)
//! - `REDIACC_LOCK_STALE_SECS` - Stale lock threshold in seconds (`0` disables)
//! - `REDIACC_CONFIG` - Active config name (default: `rediacc`)

use crate::types::DEFAULT_CONFIG_NAME;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding `<name>.json` files.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    #[serde(default)]
    pub lock: LockConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            lock: LockConfig::default(),
        }
    }
}

/// Lock tuning for cooperation with other processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Age after which a sentinel left by another process is taken over.
    /// `None` or `0` waits forever.
    #[serde(
        default = "default_stale_after",
        deserialize_with = "deserialize_stale_after"
    )]
    pub stale_after_secs: Option<u64>,

    /// Initial poll interval while another process holds the sentinel.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Upper bound for the poll interval.
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
            poll_interval_ms: default_poll_interval(),
            max_poll_interval_ms: default_max_poll_interval(),
        }
    }
}

impl LockConfig {
    pub fn stale_after(&self) -> Option<Duration> {
        takeover_secs(self.stale_after_secs).map(Duration::from_secs)
    }
}

/// `0` disables takeover, the same as leaving the threshold unset.
fn takeover_secs(secs: Option<u64>) -> Option<u64> {
    secs.filter(|&secs| secs > 0)
}

fn deserialize_stale_after<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<u64>::deserialize(deserializer).map(takeover_secs)
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("rediacc"))
        .or_else(|| dirs::home_dir().map(|h| h.join(".rediacc")))
        .unwrap_or_else(|| PathBuf::from(".rediacc"))
}

fn default_stale_after() -> Option<u64> {
    Some(300) // 5 minutes
}

fn default_poll_interval() -> u64 {
    20
}

fn default_max_poll_interval() -> u64 {
    500
}

impl StoreConfig {
    /// Config rooted at `dir` with default lock settings.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: dir.into(),
            lock: LockConfig::default(),
        }
    }

    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read store config: {}", path.display()))?;
        let config: StoreConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse store config: {}", path.display()))?;
        Ok(config)
    }

    /// Load from `REDIACC_STORE_CONFIG` if set, then apply environment overrides.
    pub fn load_or_default() -> Result<Self> {
        let mut config = match std::env::var("REDIACC_STORE_CONFIG") {
            Ok(path) => Self::load(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `REDIACC_CONFIG_DIR` and `REDIACC_LOCK_STALE_SECS` as read by `var`.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("REDIACC_CONFIG_DIR") {
            self.config_dir = PathBuf::from(dir);
        }

        if let Some(secs) = var("REDIACC_LOCK_STALE_SECS") {
            match secs.parse::<u64>() {
                Ok(parsed) => self.lock.stale_after_secs = takeover_secs(Some(parsed)),
                Err(_) => {
                    tracing::warn!(value = %secs, "Ignoring unparseable REDIACC_LOCK_STALE_SECS")
                }
            }
        }
    }
}

/// Resolve the active config name.
///
/// Priority: explicit override > `REDIACC_CONFIG` > `rediacc`.
pub fn active_config_name(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var("REDIACC_CONFIG").ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG_NAME.to_string())
}
