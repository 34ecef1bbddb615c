//! TOML-based engine configuration.
//!
//! Holds the tunables of the engine:
//! - Compliance thresholds (grace periods, no-show delay, reminder lead)
//! - Cohort query chunk size
//! - Watcher tick and sweep periods
//! - Database location override
//!
//! Configuration is stored at `~/.config/studytrack/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::data_dir;
use crate::compliance::CompliancePolicy;
use crate::error::{ConfigError, Result};
use crate::monitor::DEFAULT_CHUNK_SIZE;

/// Cohort query configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Students per batched lookup.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// Background loop periods, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    #[serde(default = "default_sweep_seconds")]
    pub sweep_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file; defaults to `studytrack.db` in the data directory.
    #[serde(default)]
    pub database_path: Option<String>,
}

/// Engine configuration.
///
/// Serialized to/from TOML at `~/.config/studytrack/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub compliance: CompliancePolicy,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

// Default functions
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_tick_seconds() -> u64 {
    30
}
fn default_sweep_seconds() -> u64 {
    60
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
            sweep_seconds: default_sweep_seconds(),
        }
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

impl Config {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> std::result::Result<(), ConfigError> {
        let mut parts = key.split('.').peekable();
        if key.is_empty() {
            return Err(invalid(key, "config key is empty"));
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            let is_leaf = parts.peek().is_none();
            if is_leaf {
                let obj = current
                    .as_object_mut()
                    .ok_or_else(|| invalid(key, "unknown config key"))?;
                let existing = obj
                    .get(part)
                    .ok_or_else(|| invalid(key, "unknown config key"))?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value
                            .parse::<bool>()
                            .map_err(|e| invalid(key, e.to_string()))?,
                    ),
                    serde_json::Value::Number(_) => value
                        .parse::<i64>()
                        .map(|n| serde_json::Value::Number(n.into()))
                        .map_err(|_| invalid(key, format!("cannot parse '{value}' as integer")))?,
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        return Err(invalid(key, "not a leaf value"));
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current
                .get_mut(part)
                .ok_or_else(|| invalid(key, "unknown config key"))?;
        }

        Err(invalid(key, "unknown config key"))
    }

    /// Path of the config file in the data directory.
    pub fn path() -> Result<PathBuf> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from disk, writing the defaults on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path()?)
    }

    /// Load from an explicit file, writing the defaults there if it is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let cfg: Config = toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(_) => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
        }
    }

    /// Persist to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written to disk.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))?;
        Ok(())
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by dot-separated key. The caller decides when to save.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or the value does not parse or
    /// fails validation. The config is left unchanged on error.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut json = serde_json::to_value(&*self)?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: Config =
            serde_json::from_value(json).map_err(|e| invalid(key, e.to_string()))?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let policy = &self.compliance;
        for (key, value) in [
            ("compliance.on_time_grace_minutes", policy.on_time_grace_minutes),
            ("compliance.late_lookback_minutes", policy.late_lookback_minutes),
            ("compliance.early_leave_grace_minutes", policy.early_leave_grace_minutes),
            ("compliance.no_show_delay_minutes", policy.no_show_delay_minutes),
            ("compliance.no_show_horizon_hours", policy.no_show_horizon_hours),
            ("compliance.reminder_lead_minutes", policy.reminder_lead_minutes),
        ] {
            if value < 0 {
                return Err(invalid(key, "must not be negative"));
            }
        }
        if policy.late_lookback_minutes < policy.on_time_grace_minutes {
            return Err(invalid(
                "compliance.late_lookback_minutes",
                "must be at least the on-time grace",
            ));
        }
        if self.monitor.chunk_size == 0 {
            return Err(invalid("monitor.chunk_size", "must be at least 1"));
        }
        if self.watcher.tick_seconds == 0 {
            return Err(invalid("watcher.tick_seconds", "must be at least 1"));
        }
        if self.watcher.sweep_seconds == 0 {
            return Err(invalid("watcher.sweep_seconds", "must be at least 1"));
        }
        Ok(())
    }

    /// Database file to open: the override if set, else the data directory default.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.storage.database_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(data_dir()?.join("studytrack.db")),
        }
    }
}
