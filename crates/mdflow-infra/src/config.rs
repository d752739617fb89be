//! Engine configuration loader for mdflow.
//!
//! Reads `config.toml` from the data directory (`~/.mdflow/` by default) and
//! deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use mdflow_types::config::EngineConfig;

pub const CONFIG_FILE: &str = "config.toml";

/// Resolve the mdflow data directory.
///
/// `MDFLOW_DATA_DIR` wins, then `~/.mdflow`, then `.mdflow` in the current
/// directory.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MDFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".mdflow");
    }

    PathBuf::from(".mdflow")
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

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

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}
