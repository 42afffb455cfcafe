//! Configuration loading.
//!
//! Hierarchical merge, lowest to highest precedence: programmatic
//! defaults, `.taskforge/config.yaml`, `.taskforge/local.yaml`, then
//! `TASKFORGE_`-prefixed environment variables.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::EngineConfig;

/// Configuration validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid log level: {0}, must be one of trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("invalid log format: {0}, must be json or pretty")]
    InvalidLogFormat(String),

    #[error("invalid max_depth: {0}, must be at least 1")]
    InvalidMaxDepth(u32),

    #[error("invalid parallel_limit: {0}, must be between 1 and 100")]
    InvalidParallelLimit(usize),

    #[error("invalid snapshot_interval: {0}, must be at least 1")]
    InvalidSnapshotInterval(u64),

    #[error("invalid max_history_per_task: {0}, must be at least 1")]
    InvalidHistoryBound(usize),

    #[error("invalid audit_retention_days: {0}, must be at least 1")]
    InvalidRetentionDays(u32),
}

/// Loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from the project-local `.taskforge/` directory
    /// and the environment.
    pub fn load() -> Result<EngineConfig> {
        let config: EngineConfig = Figment::new()
            .merge(Serialized::defaults(EngineConfig::default()))
            .merge(Yaml::file(".taskforge/config.yaml"))
            .merge(Yaml::file(".taskforge/local.yaml"))
            .merge(Env::prefixed("TASKFORGE_").split("__"))
            .extract()
            .context("failed to extract configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from one explicit file.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<EngineConfig> {
        let config: EngineConfig = Figment::new()
            .merge(Serialized::defaults(EngineConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| format!("failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate a loaded configuration.
    pub fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.context.max_depth == 0 {
            return Err(ConfigError::InvalidMaxDepth(config.context.max_depth));
        }

        if config.context.parallel_limit == 0 || config.context.parallel_limit > 100 {
            return Err(ConfigError::InvalidParallelLimit(
                config.context.parallel_limit,
            ));
        }

        if config.log.snapshot_interval == 0 {
            return Err(ConfigError::InvalidSnapshotInterval(
                config.log.snapshot_interval,
            ));
        }

        if config.history.max_history_per_task == 0 {
            return Err(ConfigError::InvalidHistoryBound(
                config.history.max_history_per_task,
            ));
        }

        if config.audit.audit_retention_days == 0 {
            return Err(ConfigError::InvalidRetentionDays(
                config.audit.audit_retention_days,
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ConfigLoader::validate(&EngineConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = EngineConfig::default();
        config.logging.level = "loud".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));

        let mut config = EngineConfig::default();
        config.context.parallel_limit = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidParallelLimit(0))
        ));

        let mut config = EngineConfig::default();
        config.log.snapshot_interval = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidSnapshotInterval(0))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "context:\n  max_depth: 7\nlogging:\n  format: json\n").unwrap();

        let config = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(config.context.max_depth, 7);
        assert_eq!(config.logging.format, "json");
        // Untouched sections keep defaults.
        assert_eq!(config.context.parallel_limit, 5);
    }
}
