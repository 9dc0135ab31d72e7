// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load and validate the proxy configuration. JSON is accepted alongside
/// YAML, keyed off the file extension.
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config: Config = match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&contents).context("Failed to parse YAML config")?
        }
        Some("json") => serde_json::from_str(&contents).context("Failed to parse JSON config")?,
        _ => serde_yaml::from_str(&contents).context("Failed to parse config")?,
    };

    config.validate()?;
    Ok(config)
}
