#![allow(clippy::result_large_err)]

use super::{ConductorConfig, DeliveryMode};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use std::env;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "conductor.toml";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load config from workspace root (workspace/conductor.toml)
    /// Environment variables override config file values
    pub fn load_from_workspace(workspace_path: &Path) -> Result<ConductorConfig, AppError> {
        Self::load(workspace_path, None)
    }

    /// Load an explicit config file when given (it must exist), otherwise the
    /// workspace default. Environment overrides apply either way.
    pub fn load(
        workspace_path: &Path,
        config_file: Option<&Path>,
    ) -> Result<ConductorConfig, AppError> {
        let mut config = match config_file {
            Some(path) => Self::load_from_file(path)?.ok_or_else(|| {
                AppError::new(
                    ErrorCategory::IoError,
                    format!("Config file {} does not exist", path.display()),
                )
            })?,
            None => Self::load_from_file(&workspace_path.join(CONFIG_FILE_NAME))?
                .unwrap_or_default(),
        };

        // Apply environment variable overrides
        Self::apply_env_overrides(&mut config);
        Self::validate_config(&config)?;

        Ok(config)
    }

    /// Load config from specific file path
    /// Returns Ok(None) if file doesn't exist
    pub fn load_from_file(path: &Path) -> Result<Option<ConductorConfig>, AppError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::new(
                ErrorCategory::IoError,
                format!("Failed to read config file {}: {}", path.display(), e),
            )
        })?;

        let config: ConductorConfig = toml::from_str(&content).map_err(|e| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("Failed to parse config file {}: {}", path.display(), e),
            )
        })?;

        Ok(Some(config))
    }

    /// Apply environment variable overrides to the configuration
    /// Unparsable values are ignored and leave the current value in place
    fn apply_env_overrides(config: &mut ConductorConfig) {
        if let Ok(value) = env::var("CONDUCTOR_CHECKPOINT_ON_EACH_NODE") {
            if let Ok(enabled) = value.parse::<bool>() {
                config.engine.checkpoint_on_each_node = enabled;
            }
        }

        if let Ok(value) = env::var("CONDUCTOR_APPROVAL_DELIVERY") {
            if let Ok(mode) = value.parse::<DeliveryMode>() {
                config.approvals.delivery = mode;
            }
        }

        if let Ok(value) = env::var("CONDUCTOR_APPROVAL_POLL_INTERVAL") {
            if let Ok(interval) = humantime::parse_duration(&value) {
                config.approvals.poll_interval = interval;
            }
        }
    }

    /// Get documentation for supported environment variables
    pub fn env_var_documentation() -> &'static [&'static str] {
        &[
            "CONDUCTOR_CHECKPOINT_ON_EACH_NODE - Override per-node checkpointing (true/false, default: true)",
            "CONDUCTOR_APPROVAL_DELIVERY - Override approval delivery (watch/poll, default: watch)",
            "CONDUCTOR_APPROVAL_POLL_INTERVAL - Override approval poll interval (humantime, default: 500ms)",
            "CONDUCTOR_REMOTE_AGENT - Force the remote-agent logging context (1/true)",
        ]
    }

    /// Validate configuration values
    pub fn validate_config(config: &ConductorConfig) -> Result<(), AppError> {
        if config.engine.state_dir.as_os_str().is_empty() {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "Engine state_dir cannot be empty".to_string(),
            ));
        }

        if config.approvals.store_dir.as_os_str().is_empty() {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "Approval store_dir cannot be empty".to_string(),
            ));
        }

        if config.approvals.poll_interval.is_zero() {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "Approval poll_interval must be greater than zero".to_string(),
            ));
        }

        if config.evaluator.cache_capacity == 0 {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "Evaluator cache_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
