//! Configuration view and validation commands for `rees-build config`.

use std::path::Path;

use anyhow::{Context, Result, bail};

use rees_build::config::{ConfigOverrides, ReesToml, load_config};

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("REES Build Configuration");
            println!("========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No rees.toml found at {}", config_path.display());
                println!("Run 'rees-build config init' to create one.");
            }
            println!();

            let toml = ReesToml::load_or_default(config_path)?;
            let rendered =
                toml::to_string_pretty(&toml).context("Failed to render configuration")?;
            println!("{}", rendered);

            println!("Effective values (with env overrides):");
            match load_config(config_path, &ConfigOverrides::default()) {
                Ok(config) => {
                    let env = &config.environment;
                    let c = &config.container;
                    println!("  registry_url = \"{}\"", env.registry_url);
                    println!("  repository = \"{}\"", env.repository);
                    println!("  commit = \"{}\"", env.commit_ref);
                    println!("  branch = \"{}\"", env.branch);
                    println!("  image_tag = \"{}\"", env.image_tag);
                    println!(
                        "  host_build_source_parent_dir = \"{}\"",
                        c.host_build_source_parent_dir.display()
                    );
                    println!(
                        "  host_data_parent_dir = \"{}\"",
                        c.host_data_parent_dir.display()
                    );
                    println!(
                        "  port_range = {}-{}",
                        c.port_range.start, c.port_range.end
                    );
                    println!("  enable_dind = {}", c.enable_dind);
                    println!("  preserve_cache = {}", config.source.preserve_cache);
                    println!("  tool = \"{}\"", config.build.tool);
                }
                Err(e) => println!("  (incomplete: {})", e),
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            match load_config(config_path, &ConfigOverrides::default()) {
                Ok(config) => {
                    println!(
                        "Configuration is valid: {} from {}",
                        config.environment.repository, config.environment.registry_url
                    );
                    println!();
                }
                Err(e) => bail!("Configuration is invalid: {}", e),
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("rees.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory {}", parent.display())
                })?;
            }

            ReesToml::default().save(config_path)?;

            println!("Created rees.toml at {}", config_path.display());
            println!();
            println!("Before building, set:");
            println!("  - [environment] registry_url, repository");
            println!("  - [container] host_build_source_parent_dir, host_data_parent_dir");
            println!();
        }
    }

    Ok(())
}
