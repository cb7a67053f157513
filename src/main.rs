use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use rees_build::config::{BuildTool, ConfigOverrides, DEFAULT_CONFIG_FILE};
use rees_build::credentials::Credentials;

mod cmd;

#[derive(Parser)]
#[command(name = "rees-build")]
#[command(
    version,
    about = "Reproducible document builds in REES execution environments"
)]
pub struct Cli {
    /// Path to rees.toml
    #[arg(short, long, global = true, env = "REES_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Overrides for `[environment]` and `[container]` values.
#[derive(Args, Clone, Debug, Default)]
pub struct EnvironmentArgs {
    /// Registry URL (http:// or https://)
    #[arg(long)]
    pub registry_url: Option<String>,

    /// Source repository as owner/name
    #[arg(long)]
    pub repository: Option<String>,

    /// Commit to build, or "latest" for the branch tip
    #[arg(long)]
    pub commit: Option<String>,

    #[arg(long)]
    pub branch: Option<String>,

    /// Image tag, or "latest" for the newest tag
    #[arg(long)]
    pub image_tag: Option<String>,

    /// Host path that the container-side workspace is mounted from
    #[arg(long)]
    pub host_path_prefix: Option<String>,

    /// Run as a sibling container of the orchestrator (Docker-in-Docker)
    #[arg(long)]
    pub dind: bool,
}

impl EnvironmentArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            registry_url: self.registry_url.clone(),
            repository: self.repository.clone(),
            commit: self.commit.clone(),
            branch: self.branch.clone(),
            image_tag: self.image_tag.clone(),
            host_path_prefix: self.host_path_prefix.clone(),
            enable_dind: self.dind.then_some(true),
            ..ConfigOverrides::default()
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve the environment, spawn it, and run the document build
    Build {
        #[command(flatten)]
        env: EnvironmentArgs,

        /// Build tool to run
        #[arg(long, value_parser = parse_tool)]
        tool: Option<BuildTool>,

        /// Drop the build cache directory before checkout
        #[arg(long)]
        no_cache: bool,

        /// Run the build inside the container instead of against a notebook server
        #[arg(long = "static")]
        static_build: bool,

        /// Skip the dataset download
        #[arg(long)]
        no_dataset: bool,

        /// Arguments passed to the build tool
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Print the image and commit a build would use
    Resolve {
        #[command(flatten)]
        env: EnvironmentArgs,

        /// Also check that the registry accepts the configured credentials
        #[arg(long)]
        check_auth: bool,
    },
    /// Show the last successful build and stored snapshots
    Status,
    /// Clear the build cache
    Clean {
        /// Also remove exited containers
        #[arg(long)]
        containers: bool,
    },
    /// View, validate or create rees.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration
    Validate,
    /// Write a default rees.toml
    Init,
}

fn parse_tool(value: &str) -> std::result::Result<BuildTool, String> {
    value.parse::<BuildTool>().map_err(|e| e.to_string())
}

fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match &cli.log_file {
        Some(path) => {
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let file_name = path
                .file_name()
                .context("--log-file must name a file")?;
            let appender = tracing_appender::rolling::never(&dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    match cli.log_format {
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    }
    .context("Failed to initialise logging")?;

    Ok(guard)
}

fn bootstrap_credentials(config_path: &Path) -> Result<Credentials> {
    let dir = rees_build::config::credentials_dir(config_path)
        .context("Failed to locate credentials directory")?;
    // SAFETY: no other thread exists yet; logging and the runtime start afterwards.
    let credentials = unsafe { Credentials::bootstrap(&dir) }
        .context("Failed to load credentials")?;
    Ok(credentials)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    // Scrubbing the environment must finish before the log writer thread
    // starts, so a failure is held until it can be logged.
    let credentials = bootstrap_credentials(&cli.config);
    let _guard = init_logging(&cli)?;
    let credentials = credentials.inspect_err(|e| tracing::error!("{:#}", e))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async {
        match &cli.command {
            Commands::Build {
                env,
                tool,
                no_cache,
                static_build,
                no_dataset,
                args,
            } => {
                let mut overrides = env.overrides();
                overrides.tool = *tool;
                overrides.preserve_cache = no_cache.then_some(false);
                if !args.is_empty() {
                    overrides.build_args = Some(args.clone());
                }
                let options = cmd::BuildOptions {
                    static_build: *static_build,
                    fetch_dataset: !*no_dataset,
                    verbose: cli.verbose,
                };
                cmd::cmd_build(&cli.config, &overrides, credentials, options).await
            }
            Commands::Resolve { env, check_auth } => {
                cmd::cmd_resolve(&cli.config, &env.overrides(), credentials, *check_auth).await
            }
            Commands::Status => cmd::cmd_status(&cli.config),
            Commands::Clean { containers } => cmd::cmd_clean(&cli.config, *containers).await,
            Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone()),
        }
    })
}
