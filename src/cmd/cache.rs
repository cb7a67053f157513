//! Build cache commands: `rees-build status` and `rees-build clean`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;

use rees_build::config::{ConfigOverrides, load_config};
use rees_build::source::SourceManager;
use rees_build::spawner::{ContainerRuntime, DockerRuntime, EnvironmentSpawner};
use rees_build::ui::icons;

pub fn cmd_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path, &ConfigOverrides::default())
        .context("Failed to load configuration")?;
    let sources = SourceManager::from_config(&config);
    let cache_root = sources
        .cache_root()
        .context("No build directory configured")?;

    println!();
    println!(
        "{}{}",
        icons::REPO,
        style(config.environment.repository.to_string()).bold()
    );
    println!("{}{}", icons::FOLDER, cache_root.display());
    println!();

    match sources.read_last_successful_hash() {
        Some(hash) => println!("Last successful build: {}", style(hash).green()),
        None => println!("No successful build recorded."),
    }

    let snapshots = sources.snapshots();
    if snapshots.is_empty() {
        println!("No snapshots stored.");
    } else {
        println!("Snapshots:");
        for snapshot in snapshots {
            println!("  {}{}", icons::COMMIT, snapshot);
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_clean(config_path: &Path, containers: bool) -> Result<()> {
    let config = load_config(config_path, &ConfigOverrides::default())
        .context("Failed to load configuration")?;
    let sources = SourceManager::from_config(&config);
    sources
        .clear_build_cache()
        .context("Failed to clear build cache")?;
    println!("{}Build cache cleared", icons::CHECK);

    if containers {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
        let spawner = EnvironmentSpawner::new(runtime, config.container.clone());
        let removed = spawner.prune_exited_containers().await?;
        println!("{}Removed {} exited container(s)", icons::CHECK, removed);
    }
    Ok(())
}
