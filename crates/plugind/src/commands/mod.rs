//! CLI command implementations.

use std::path::Path;

use anyhow::{Context, Result};

use plugind::config::Config;

pub mod check;
pub mod run;

/// Load and validate the config at `config_path`.
pub async fn load_config(config_path: &str) -> Result<Config> {
    let config = Config::load(Path::new(config_path))
        .await
        .with_context(|| format!("Failed to load config '{config_path}'"))?;
    config
        .validate()
        .with_context(|| format!("Invalid config '{config_path}'"))?;
    Ok(config)
}
