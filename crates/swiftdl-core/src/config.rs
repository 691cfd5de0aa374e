//! Configuration loading for the engine
//!
//! Configs are JSON documents; every field is optional and falls back
//! to [`EngineConfig::default`].

use crate::error::ConfigError;
use std::path::{Path, PathBuf};
use swiftdl_types::{EngineConfig, MAX_CHUNK_SIZE};

/// File name looked up inside the platform config directory
pub const CONFIG_FILE: &str = "config.json";

/// Platform config location, e.g. `~/.config/swiftdl/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "swiftdl", "swiftdl")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

/// Load and validate a config file
pub async fn load(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
    parse(&content, path)
}

/// Load `path` if it exists, otherwise return defaults
pub async fn load_or_default(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    match path {
        Some(path) if path.exists() => load(path).await,
        Some(path) => {
            tracing::debug!("Config {:?} not found, using defaults", path);
            Ok(EngineConfig::default())
        }
        None => Ok(EngineConfig::default()),
    }
}

fn parse(content: &str, path: &Path) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig =
        serde_json::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
    validate(&config)?;
    Ok(config)
}

/// Reject configurations the engine cannot run with
pub fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.max_concurrent == 0 {
        return Err(ConfigError::Invalid("max_concurrent must be at least 1".into()));
    }
    if config.workers == 0 {
        return Err(ConfigError::Invalid("workers must be at least 1".into()));
    }
    if config.io_workers == 0 {
        return Err(ConfigError::Invalid("io_workers must be at least 1".into()));
    }
    if config.default_chunk_size == 0 {
        return Err(ConfigError::Invalid("default_chunk_size must be at least 1".into()));
    }
    if config.default_chunk_size > MAX_CHUNK_SIZE {
        return Err(ConfigError::Invalid(format!(
            "default_chunk_size must not exceed {} bytes",
            MAX_CHUNK_SIZE
        )));
    }
    if config.max_retry_delay_ms < config.initial_retry_delay_ms {
        return Err(ConfigError::Invalid(
            "max_retry_delay_ms must not be below initial_retry_delay_ms".into(),
        ));
    }
    if config.speed_limit == Some(0) {
        return Err(ConfigError::Invalid(
            "speed_limit must be positive; omit it for unlimited".into(),
        ));
    }
    Ok(())
}
