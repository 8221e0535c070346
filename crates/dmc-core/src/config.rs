//! Control plane configuration.
//!
//! Loaded from a TOML file, optionally overridden from `DMC_*` environment
//! variables, and validated before any service is built from it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Fleet-level switches for each management capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub apple_mdm_enabled: bool,
    pub windows_mdm_enabled: bool,
    pub scripts_enabled: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            apple_mdm_enabled: true,
            windows_mdm_enabled: true,
            scripts_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Retry cycles a missing profile gets before it is marked failed.
    pub max_retries: u32,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self { max_retries: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    /// Number of digits in a generated unlock PIN.
    pub unlock_pin_length: usize,
    /// Pending actions older than this are flagged as stuck in status views.
    pub stuck_after_secs: Option<u64>,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            unlock_pin_length: 6,
            stuck_after_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Enrollments under any other solution name are not actionable.
    pub management_solution_name: String,
    pub features: FeatureConfig,
    pub verification: VerificationConfig,
    pub actions: ActionConfig,

    // Logging
    pub log_level: String,
    pub audit_log: Option<PathBuf>,

    // Storage
    pub database_path: Option<PathBuf>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            management_solution_name: "dmc".to_string(),
            features: FeatureConfig::default(),
            verification: VerificationConfig::default(),
            actions: ActionConfig::default(),
            log_level: "info".to_string(),
            audit_log: None,
            database_path: None,
        }
    }
}

impl ControlPlaneConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {}", path.display(), e)))?;

        let config: ControlPlaneConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by environment variables.
    pub fn load_from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `DMC_*` environment overrides on top of the current values.
    /// Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(name) = std::env::var("DMC_SOLUTION_NAME") {
            self.management_solution_name = name;
        }
        if let Some(v) = env_bool("DMC_APPLE_MDM_ENABLED") {
            self.features.apple_mdm_enabled = v;
        }
        if let Some(v) = env_bool("DMC_WINDOWS_MDM_ENABLED") {
            self.features.windows_mdm_enabled = v;
        }
        if let Some(v) = env_bool("DMC_SCRIPTS_ENABLED") {
            self.features.scripts_enabled = v;
        }
        if let Ok(v) = std::env::var("DMC_MAX_PROFILE_RETRIES") {
            if let Ok(n) = v.parse::<u32>() {
                self.verification.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("DMC_STUCK_AFTER_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.actions.stuck_after_secs = Some(n);
            }
        }
        if let Ok(path) = std::env::var("DMC_AUDIT_LOG") {
            self.audit_log = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("DMC_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.log_level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.management_solution_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "management_solution_name must not be empty".to_string(),
            ));
        }
        if !(4..=10).contains(&self.actions.unlock_pin_length) {
            return Err(ConfigError::ValidationError(
                "actions.unlock_pin_length must be between 4 and 10".to_string(),
            ));
        }
        if self.actions.stuck_after_secs == Some(0) {
            return Err(ConfigError::ValidationError(
                "actions.stuck_after_secs must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stuck_after(&self) -> Option<chrono::Duration> {
        self.actions
            .stuck_after_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(chrono::Duration::seconds)
    }
}

fn env_bool(key: &str) -> Option<bool> {
    match std::env::var(key).ok()?.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
