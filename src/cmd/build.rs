//! Full build run for `rees-build build`.
//!
//! preflight → resolve → spawn → build → save on success → cleanup.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use console::style;
use tracing::{info, warn};

use rees_build::builder::DocumentBuilder;
use rees_build::config::{ConfigOverrides, load_config};
use rees_build::credentials::Credentials;
use rees_build::dataset::{DatasetFetcher, Repo2Data, SkipDataset};
use rees_build::errors::ReesError;
use rees_build::rees::Rees;
use rees_build::spawner::{
    ContainerRuntime, DockerRuntime, EnvironmentSpawner, RunningEnvironment, ServerMode,
};
use rees_build::ui::{self, icons};

#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub static_build: bool,
    pub fetch_dataset: bool,
    pub verbose: bool,
}

pub async fn cmd_build(
    config_path: &Path,
    overrides: &ConfigOverrides,
    credentials: Credentials,
    options: BuildOptions,
) -> Result<()> {
    let config = load_config(config_path, overrides).context("Failed to load configuration")?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    let mut rees = Rees::new(config.clone(), credentials.clone(), runtime.clone())?;

    rees.preflight().await?;
    let builder = DocumentBuilder::new(&config.build);
    if !options.static_build {
        builder.preflight().await?;
    }

    let resolution = rees.resolve().await.context("Failed to resolve environment")?;
    println!(
        "{}Building {} at {} in {}",
        icons::ROCKET,
        style(config.environment.repository.to_string()).bold(),
        style(&resolution.commit_ref).yellow(),
        style(resolution.image.reference()).cyan()
    );

    let build_dir = rees
        .sources()
        .build_dir()
        .context("No build directory configured")?;
    let dataset: Box<dyn DatasetFetcher> = if options.fetch_dataset {
        Box::new(Repo2Data::new(config.build.dataset_command.clone()))
    } else {
        Box::new(SkipDataset)
    };
    let mode = if options.static_build {
        ServerMode::StaticBuild {
            command: builder.command_line(),
        }
    } else {
        ServerMode::NotebookServer
    };

    let mut spawner = EnvironmentSpawner::new(runtime.clone(), config.container.clone());
    let success = spawner
        .scoped(
            &mut rees,
            &resolution.image,
            &mode,
            dataset.as_ref(),
            |env| run_in_environment(env, &builder, runtime.as_ref(), &build_dir, &credentials, options),
        )
        .await?;

    ui::print_summary(rees.environment(), &resolution, rees.sources().context());

    if !success {
        println!("{}{}", icons::CROSS, style("Build failed").red().bold());
        bail!(ReesError::Build(format!(
            "{} exited unsuccessfully",
            builder.tool()
        )));
    }

    match rees.save_successful_build() {
        Ok(true) => info!("saved successful build snapshot"),
        Ok(false) => warn!("no commit recorded for this build, snapshot skipped"),
        Err(e) => warn!("build succeeded but the snapshot could not be saved: {}", e),
    }
    println!("{}{}", icons::CHECK, style("Build succeeded").green().bold());
    Ok(())
}

async fn run_in_environment(
    env: RunningEnvironment,
    builder: &DocumentBuilder,
    runtime: &dyn ContainerRuntime,
    build_dir: &Path,
    credentials: &Credentials,
    options: BuildOptions,
) -> rees_build::errors::Result<bool> {
    if options.verbose {
        println!("{}", ui::debug_hint(&env));
    }
    if options.static_build {
        let code = runtime
            .wait_for_exit(&env.container_id)
            .await
            .map_err(|e| ReesError::container_with("failed to wait for build container", e))?;
        info!(exit_code = code, "build container exited");
        return Ok(code == 0);
    }
    let outcome = builder.run(build_dir, &env, credentials).await?;
    Ok(outcome.success)
}
