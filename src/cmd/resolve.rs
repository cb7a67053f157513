//! Resolution preview for `rees-build resolve`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;

use rees_build::config::{ConfigOverrides, LATEST, load_config};
use rees_build::credentials::Credentials;
use rees_build::rees::Rees;
use rees_build::spawner::{ContainerRuntime, DockerRuntime};
use rees_build::ui::icons;

pub async fn cmd_resolve(
    config_path: &Path,
    overrides: &ConfigOverrides,
    credentials: Credentials,
    check_auth: bool,
) -> Result<()> {
    let config = load_config(config_path, overrides).context("Failed to load configuration")?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    let mut rees = Rees::new(config, credentials, runtime)?;

    if check_auth {
        let url = rees.environment().registry_url.clone();
        if !rees.registry().is_authenticated() {
            println!("{}No registry credentials configured", icons::WARN);
        }
        rees.registry()
            .ping()
            .await
            .with_context(|| format!("Registry {} rejected the request", url))?;
        println!("{}Registry {} is reachable", icons::CHECK, url);
    }

    let resolution = rees.resolve().await.context("Failed to resolve environment")?;
    let commit = if resolution.commit_ref == LATEST {
        style(format!("{} (branch tip, unresolved)", LATEST)).yellow()
    } else {
        style(resolution.commit_ref.clone()).green()
    };

    println!();
    println!("{}image   {}", icons::IMAGE, style(resolution.image.reference()).bold());
    println!("{}source  {}", icons::REPO, resolution.source_name);
    println!("{}commit  {}", icons::COMMIT, commit);
    println!();
    Ok(())
}
