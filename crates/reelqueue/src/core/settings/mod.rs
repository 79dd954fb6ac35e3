//! Scheduler Settings Persistence
//!
//! Provides persistent scheduler settings with:
//! - Atomic file writes (temp file + rename)
//! - Defaults for missing fields and missing files
//! - Normalization of out-of-range values
//!
//! Storage location: {config_dir}/scheduler.json

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::jobs::PoolConfig;
use crate::core::{CoreError, CoreResult};

/// Settings schema version for migration support
pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name
pub const SETTINGS_FILE: &str = "scheduler.json";

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSettings {
    /// Schema version for migrations
    #[serde(default = "default_version")]
    pub version: u32,

    /// Execution pool sizing
    #[serde(default)]
    pub pool: PoolConfig,

    /// Default log filter directive (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            pool: PoolConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl SchedulerSettings {
    /// Normalizes settings so persisted state is always valid.
    ///
    /// Bad values are corrected rather than rejected.
    pub fn normalize(&mut self) {
        self.version = SETTINGS_VERSION;
        self.pool.normalize();
        self.log_level = normalize_enum(
            &self.log_level,
            &["trace", "debug", "info", "warn", "error"],
            default_log_level(),
        );
    }
}

fn normalize_enum(value: &str, allowed: &[&str], fallback: String) -> String {
    if allowed.iter().any(|v| v.eq_ignore_ascii_case(value)) {
        value.to_ascii_lowercase()
    } else {
        fallback
    }
}

/// Loads and saves [`SchedulerSettings`] in a config directory
pub struct SettingsManager {
    settings_path: PathBuf,
}

impl SettingsManager {
    /// Create a settings manager rooted at the given config directory
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            settings_path: config_dir.as_ref().join(SETTINGS_FILE),
        }
    }

    /// Create a settings manager for an explicit settings file
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            settings_path: path.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Load settings from disk, returning defaults if the file doesn't exist
    pub fn load(&self) -> CoreResult<SchedulerSettings> {
        if !self.settings_path.exists() {
            info!(
                "Settings file {} not found, using defaults",
                self.settings_path.display()
            );
            return Ok(SchedulerSettings::default());
        }

        let content = fs::read_to_string(&self.settings_path)?;
        let mut settings: SchedulerSettings = serde_json::from_str(&content)
            .map_err(|e| CoreError::Settings(format!("failed to parse settings file: {e}")))?;

        if settings.version < SETTINGS_VERSION {
            info!(
                "Migrating settings from version {} to {}",
                settings.version, SETTINGS_VERSION
            );
        }

        settings.normalize();
        Ok(settings)
    }

    /// Load settings, falling back to defaults on any error
    pub fn load_or_default(&self) -> SchedulerSettings {
        match self.load() {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to load settings, using defaults: {}", e);
                SchedulerSettings::default()
            }
        }
    }

    /// Save settings to disk using atomic write (temp file + rename)
    pub fn save(&self, settings: &SchedulerSettings) -> CoreResult<SchedulerSettings> {
        let mut normalized = settings.clone();
        normalized.normalize();

        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_vec_pretty(&normalized)?;

        let temp_path = self.settings_path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(&content)?;
            file.sync_all()?;
        }

        if cfg!(windows) && self.settings_path.exists() {
            // rename does not overwrite on Windows
            let backup_path = self.settings_path.with_extension("json.bak");
            if backup_path.exists() {
                let _ = fs::remove_file(&backup_path);
            }
            fs::rename(&self.settings_path, &backup_path)?;
            if let Err(e) = fs::rename(&temp_path, &self.settings_path) {
                let _ = fs::rename(&backup_path, &self.settings_path);
                return Err(CoreError::IoError(e));
            }
            let _ = fs::remove_file(&backup_path);
        } else {
            fs::rename(&temp_path, &self.settings_path)?;
        }

        info!("Settings saved to {}", self.settings_path.display());
        Ok(normalized)
    }
}
