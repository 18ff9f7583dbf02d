use std::path::Path;

use anyhow::{Context, Result};
use streamcore_protocol::CoreConfig;

/// Load configuration from a TOML file at the given path.
/// If the file doesn't exist, returns default configuration.
pub fn load_config(path: &Path) -> Result<CoreConfig> {
    if !path.exists() {
        tracing::warn!(
            "config file not found at {}, using defaults",
            path.display()
        );
        return Ok(toml::from_str("").expect("empty document parses to defaults"));
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: CoreConfig =
        toml::from_str(&contents).with_context(|| "failed to parse config TOML")?;

    tracing::info!("loaded config from {}", path.display());
    Ok(config)
}
