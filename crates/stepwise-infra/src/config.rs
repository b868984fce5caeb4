//! Engine configuration loader for Stepwise.
//!
//! Reads `config.toml` from the data directory (`~/.stepwise/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing, malformed or fails validation.

use std::path::Path;

use stepwise_types::config::EngineConfig;
use thiserror::Error;

use crate::filesystem::config_path;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Parse and validate engine configuration from TOML text.
pub fn parse_engine_config(content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(content)?;

    if config.worker_concurrency == 0 {
        return Err(ConfigError::Invalid("worker_concurrency must be at least 1".into()));
    }
    if config.lock_lease_secs == 0 {
        return Err(ConfigError::Invalid("lock_lease_secs must be positive".into()));
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        return Err(ConfigError::Invalid(format!(
            "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
            config.retry.base_delay_ms, config.retry.max_delay_ms
        )));
    }
    for (role, members) in &config.roles {
        if members.is_empty() {
            return Err(ConfigError::Invalid(format!("role '{role}' has no members")));
        }
    }
    if config.lock_lease_secs <= config.default_step_timeout_secs {
        // A lease shorter than a handler run can be stolen mid-step.
        tracing::warn!(
            lock_lease_secs = config.lock_lease_secs,
            default_step_timeout_secs = config.default_step_timeout_secs,
            "lock lease does not exceed the default step timeout"
        );
    }

    Ok(config)
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse or validate, logs a warning and returns the default.
/// - Otherwise returns the parsed config.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = config_path(data_dir);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match parse_engine_config(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to load {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}
