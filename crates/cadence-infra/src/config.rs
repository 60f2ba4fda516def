//! Engine configuration loader.
//!
//! Reads `cadence.toml` from the data directory (`~/.cadence/` unless
//! `CADENCE_DATA_DIR` is set) and deserializes it into [`EngineConfig`].
//! Every field is optional; missing ones take their defaults.

use std::path::Path;

use anyhow::Context;
use cadence_types::config::EngineConfig;

/// File name looked up inside the data directory.
pub const CONFIG_FILE_NAME: &str = "cadence.toml";

/// Load engine configuration from `{data_dir}/cadence.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or malformed file: logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE_NAME);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no engine config found, using defaults");
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read engine config, using defaults");
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse engine config, using defaults");
            EngineConfig::default()
        }
    }
}

/// Strict variant: any read or parse failure is an error.
pub async fn load_engine_config_from_path(path: &Path) -> anyhow::Result<EngineConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config = toml::from_str::<EngineConfig>(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(config)
}
