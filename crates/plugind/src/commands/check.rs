//! `plugind check`: validate the configuration without launching anything.

use std::path::Path;

use anyhow::Result;

use plugind::runtime::source::working_path;

pub async fn run(config_path: &str) -> Result<()> {
    let config = super::load_config(config_path).await?;
    let root = config.working_path(Path::new(config_path));

    println!("Config OK: {config_path}");
    println!("  working path: {}", root.display());
    println!(
        "  pool size: {}, max concurrent launches: {}",
        config.pool.size, config.launch.max_concurrent
    );
    if config.remote.enabled {
        println!("  remote: {}:{}", config.remote.host, config.remote.port);
    }

    if config.plugins.is_empty() {
        println!("No plugins declared.");
        return Ok(());
    }

    println!("Plugins:");
    for plugin in &config.plugins {
        let dir = working_path(&root, plugin)?;
        println!("  {}  {}", plugin.identity(), dir.display());
    }
    Ok(())
}
