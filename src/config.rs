//! Configuration for a REES build.
//!
//! Settings are read from `rees.toml` and layered:
//! 1. `rees.toml` file (missing file means defaults)
//! 2. `REES_*` environment variables
//! 3. CLI arguments
//!
//! # Configuration File Format
//!
//! ```toml
//! [environment]
//! registry_url = "https://binder-registry.example.org"
//! repository = "owner/repo"
//! commit = "latest"
//! branch = "main"
//! image_tag = "latest"
//! image_prefix = "binder-"
//! project_namespace = "binder-registry.example.org"
//!
//! [source]
//! provider = "https://github.com"
//! preserve_cache = true
//! credentials_dir = "."
//!
//! [container]
//! host_build_source_parent_dir = "/workspace/builds"
//! container_build_source_mount_dir = "/home/jovyan"
//! host_data_parent_dir = "/workspace/DATA"
//! container_data_mount_dir = "/home/jovyan/data"
//! port_range = [8888, 10000]
//! host_path_prefix = "/home/user/workspace"
//! container_path_prefix = "/workspace"
//! enable_dind = true
//!
//! [build]
//! tool = "myst"
//! args = ["build", "--execute", "--html"]
//! ```
//!
//! `ReesToml::resolve` validates everything eagerly and produces a
//! [`ReesConfig`]; nothing downstream re-checks these fields.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{ConfigFileError, ReesError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "rees.toml";

/// Sentinel for "resolve to the newest value at run time".
pub const LATEST: &str = "latest";

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_IMAGE_PREFIX: &str = "binder-";
pub const DEFAULT_PORT_RANGE: (u16, u16) = (8888, 10000);
pub const DEFAULT_GIT_PROVIDER: &str = "https://github.com";
pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_RAW_URL: &str = "https://raw.githubusercontent.com";
pub const DEFAULT_CONTAINER_SOURCE_MOUNT: &str = "/home/jovyan";
pub const DEFAULT_CONTAINER_DATA_MOUNT: &str = "/home/jovyan/data";
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 30;

/// Lowest port accepted in a port range.
const MIN_PORT: u16 = 1024;

// =========================================
// Domain values
// =========================================

/// A source repository, parsed from `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryRef {
    owner: String,
    name: String,
}

impl RepositoryRef {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for RepositoryRef {
    type Err = ReesError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => Ok(Self {
                owner: owner.to_string(),
                name: name.to_string(),
            }),
            _ => Err(ReesError::configuration(format!(
                "repository must be in format 'owner/name', got: '{}'",
                s
            ))),
        }
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// What to build and which image to build it in.
///
/// `commit_ref` and `image_tag` may hold [`LATEST`] until the orchestrator
/// pins them; after that the spec is treated as fixed for the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSpec {
    pub registry_url: String,
    pub repository: RepositoryRef,
    pub commit_ref: String,
    pub branch: String,
    pub image_tag: String,
    pub image_name_override: Option<String>,
    pub image_prefix: String,
    pub project_namespace: Option<String>,
}

impl EnvironmentSpec {
    /// Registry URL without scheme or trailing slash, as used in image references.
    pub fn registry_host(&self) -> &str {
        self.registry_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
    }

    pub fn commit_is_latest(&self) -> bool {
        self.commit_ref == LATEST
    }

    pub fn image_tag_is_latest(&self) -> bool {
        self.image_tag == LATEST
    }
}

/// Inclusive port range scanned for a free notebook-server port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start >= end {
            return Err(ReesError::configuration(format!(
                "invalid port range {}-{}: start must be below end",
                start, end
            )));
        }
        if start < MIN_PORT {
            return Err(ReesError::configuration(format!(
                "port range must lie within {}-65535, got {}-{}",
                MIN_PORT, start, end
            )));
        }
        Ok(Self { start, end })
    }
}

/// Where sources and data live on the host and inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMountSpec {
    pub host_build_source_parent_dir: PathBuf,
    pub container_build_source_mount_dir: PathBuf,
    pub host_data_parent_dir: PathBuf,
    pub container_data_mount_dir: PathBuf,
    pub port_range: PortRange,
    /// Host path corresponding to `container_path_prefix` (Docker-in-Docker).
    pub host_path_prefix: Option<String>,
    pub container_path_prefix: PathBuf,
    pub enable_dind: bool,
    pub stop_timeout_secs: u64,
    pub readiness_timeout_secs: u64,
}

/// Source checkout settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub provider: String,
    pub api_url: String,
    pub raw_url: String,
    pub preserve_cache: bool,
    pub credentials_dir: PathBuf,
}

/// The document-build tool driven against the running environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildTool {
    #[default]
    Myst,
    Curvenote,
}

impl BuildTool {
    pub fn executable(&self) -> &'static str {
        match self {
            BuildTool::Myst => "myst",
            BuildTool::Curvenote => "curvenote",
        }
    }
}

impl fmt::Display for BuildTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.executable())
    }
}

impl FromStr for BuildTool {
    type Err = ReesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "myst" => Ok(BuildTool::Myst),
            "curvenote" => Ok(BuildTool::Curvenote),
            _ => Err(ReesError::configuration(format!(
                "invalid build tool '{}'. Valid values: myst, curvenote",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    pub tool: BuildTool,
    pub args: Vec<String>,
    pub dataset_command: String,
}

/// Fully validated configuration for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReesConfig {
    pub environment: EnvironmentSpec,
    pub source: SourceSettings,
    pub container: ContainerMountSpec,
    pub build: BuildSettings,
}

// =========================================
// File model
// =========================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentSection {
    #[serde(default)]
    pub registry_url: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub image_tag: Option<String>,
    #[serde(default)]
    pub image_name_override: Option<String>,
    #[serde(default)]
    pub image_prefix: Option<String>,
    #[serde(default)]
    pub project_namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_raw_url")]
    pub raw_url: String,
    #[serde(default = "default_true")]
    pub preserve_cache: bool,
    #[serde(default)]
    pub credentials_dir: Option<PathBuf>,
}

fn default_provider() -> String {
    DEFAULT_GIT_PROVIDER.to_string()
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_raw_url() -> String {
    DEFAULT_RAW_URL.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_url: default_api_url(),
            raw_url: default_raw_url(),
            preserve_cache: true,
            credentials_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSection {
    #[serde(default)]
    pub host_build_source_parent_dir: Option<PathBuf>,
    #[serde(default = "default_container_source_mount")]
    pub container_build_source_mount_dir: PathBuf,
    #[serde(default)]
    pub host_data_parent_dir: Option<PathBuf>,
    #[serde(default = "default_container_data_mount")]
    pub container_data_mount_dir: PathBuf,
    #[serde(default = "default_port_range")]
    pub port_range: (u16, u16),
    #[serde(default)]
    pub host_path_prefix: Option<String>,
    #[serde(default = "default_container_path_prefix")]
    pub container_path_prefix: PathBuf,
    #[serde(default)]
    pub enable_dind: bool,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,
}

fn default_container_source_mount() -> PathBuf {
    PathBuf::from(DEFAULT_CONTAINER_SOURCE_MOUNT)
}

fn default_container_data_mount() -> PathBuf {
    PathBuf::from(DEFAULT_CONTAINER_DATA_MOUNT)
}

fn default_port_range() -> (u16, u16) {
    DEFAULT_PORT_RANGE
}

fn default_container_path_prefix() -> PathBuf {
    PathBuf::from("/")
}

fn default_stop_timeout() -> u64 {
    DEFAULT_STOP_TIMEOUT_SECS
}

fn default_readiness_timeout() -> u64 {
    DEFAULT_READINESS_TIMEOUT_SECS
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            host_build_source_parent_dir: None,
            container_build_source_mount_dir: default_container_source_mount(),
            host_data_parent_dir: None,
            container_data_mount_dir: default_container_data_mount(),
            port_range: DEFAULT_PORT_RANGE,
            host_path_prefix: None,
            container_path_prefix: default_container_path_prefix(),
            enable_dind: false,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            readiness_timeout_secs: DEFAULT_READINESS_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSection {
    #[serde(default)]
    pub tool: BuildTool,
    #[serde(default = "default_build_args")]
    pub args: Vec<String>,
    #[serde(default = "default_dataset_command")]
    pub dataset_command: String,
}

fn default_build_args() -> Vec<String> {
    vec!["build".into(), "--execute".into(), "--html".into()]
}

fn default_dataset_command() -> String {
    "repo2data".to_string()
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            tool: BuildTool::default(),
            args: default_build_args(),
            dataset_command: default_dataset_command(),
        }
    }
}

/// The complete `rees.toml` structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReesToml {
    #[serde(default)]
    pub environment: EnvironmentSection,
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub container: ContainerSection,
    #[serde(default)]
    pub build: BuildSection,
}

/// CLI-level overrides, applied last.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub registry_url: Option<String>,
    pub repository: Option<String>,
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub image_tag: Option<String>,
    pub host_path_prefix: Option<String>,
    pub enable_dind: Option<bool>,
    pub preserve_cache: Option<bool>,
    pub tool: Option<BuildTool>,
    pub build_args: Option<Vec<String>>,
}

impl ReesToml {
    pub fn load(path: &Path) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigFileError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ReesError::configuration(format!("failed to parse rees.toml: {}", e)))
    }

    /// Load `path`, or defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigFileError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;
        let content = toml::to_string_pretty(self).context("Failed to serialize rees.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `REES_*` variables through `lookup` (the process environment in production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("REES_REGISTRY_URL") {
            self.environment.registry_url = Some(v);
        }
        if let Some(v) = lookup("REES_REPOSITORY") {
            self.environment.repository = Some(v);
        }
        if let Some(v) = lookup("REES_COMMIT") {
            self.environment.commit = Some(v);
        }
        if let Some(v) = lookup("REES_BRANCH") {
            self.environment.branch = Some(v);
        }
        if let Some(v) = lookup("REES_IMAGE_TAG") {
            self.environment.image_tag = Some(v);
        }
        if let Some(v) = lookup("REES_HOST_PATH_PREFIX") {
            self.container.host_path_prefix = Some(v);
        }
        if let Some(v) = lookup("REES_ENABLE_DIND") {
            self.container.enable_dind = parse_bool("REES_ENABLE_DIND", &v)?;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        let env = &mut self.environment;
        if let Some(v) = &overrides.registry_url {
            env.registry_url = Some(v.clone());
        }
        if let Some(v) = &overrides.repository {
            env.repository = Some(v.clone());
        }
        if let Some(v) = &overrides.commit {
            env.commit = Some(v.clone());
        }
        if let Some(v) = &overrides.branch {
            env.branch = Some(v.clone());
        }
        if let Some(v) = &overrides.image_tag {
            env.image_tag = Some(v.clone());
        }
        if let Some(v) = &overrides.host_path_prefix {
            self.container.host_path_prefix = Some(v.clone());
        }
        if let Some(v) = overrides.enable_dind {
            self.container.enable_dind = v;
        }
        if let Some(v) = overrides.preserve_cache {
            self.source.preserve_cache = v;
        }
        if let Some(v) = overrides.tool {
            self.build.tool = v;
        }
        if let Some(v) = &overrides.build_args {
            self.build.args = v.clone();
        }
    }

    /// Validate and produce the run configuration. Relative host paths are
    /// anchored at `base_dir`.
    pub fn resolve(&self, base_dir: &Path) -> Result<ReesConfig> {
        let env = &self.environment;

        let registry_url = required(&env.registry_url, "environment.registry_url")?;
        if !(registry_url.starts_with("http://") || registry_url.starts_with("https://")) {
            return Err(ReesError::configuration(format!(
                "registry_url must start with http:// or https://, got: {}",
                registry_url
            )));
        }
        let repository: RepositoryRef =
            required(&env.repository, "environment.repository")?.parse()?;

        let environment = EnvironmentSpec {
            registry_url: registry_url.trim_end_matches('/').to_string(),
            repository,
            commit_ref: non_blank(&env.commit).unwrap_or_else(|| LATEST.to_string()),
            branch: non_blank(&env.branch).unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            image_tag: non_blank(&env.image_tag).unwrap_or_else(|| LATEST.to_string()),
            image_name_override: non_blank(&env.image_name_override),
            image_prefix: env
                .image_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_IMAGE_PREFIX.to_string()),
            project_namespace: non_blank(&env.project_namespace),
        };

        let c = &self.container;
        if c.container_build_source_mount_dir.as_os_str().is_empty() {
            return Err(ReesError::configuration(
                "container.container_build_source_mount_dir must not be empty",
            ));
        }
        if c.container_data_mount_dir.as_os_str().is_empty() {
            return Err(ReesError::configuration(
                "container.container_data_mount_dir must not be empty",
            ));
        }
        let anchor = |p: &Option<PathBuf>, default: &str| -> PathBuf {
            let p = p.clone().unwrap_or_else(|| PathBuf::from(default));
            if p.is_absolute() { p } else { base_dir.join(p) }
        };
        let container = ContainerMountSpec {
            host_build_source_parent_dir: anchor(&c.host_build_source_parent_dir, "builds"),
            container_build_source_mount_dir: c.container_build_source_mount_dir.clone(),
            host_data_parent_dir: anchor(&c.host_data_parent_dir, "DATA"),
            container_data_mount_dir: c.container_data_mount_dir.clone(),
            port_range: PortRange::new(c.port_range.0, c.port_range.1)?,
            host_path_prefix: c
                .host_path_prefix
                .clone()
                .filter(|p| crate::paths::should_translate(Some(p))),
            container_path_prefix: c.container_path_prefix.clone(),
            enable_dind: c.enable_dind,
            stop_timeout_secs: c.stop_timeout_secs,
            readiness_timeout_secs: c.readiness_timeout_secs,
        };
        if container.readiness_timeout_secs == 0 {
            return Err(ReesError::configuration(
                "container.readiness_timeout_secs must be positive",
            ));
        }

        let s = &self.source;
        for (field, url) in [
            ("source.provider", &s.provider),
            ("source.api_url", &s.api_url),
            ("source.raw_url", &s.raw_url),
        ] {
            if url.trim().is_empty() {
                return Err(ReesError::configuration(format!("{} must not be empty", field)));
            }
        }
        let source = SourceSettings {
            provider: s.provider.trim_end_matches('/').to_string(),
            api_url: s.api_url.trim_end_matches('/').to_string(),
            raw_url: s.raw_url.trim_end_matches('/').to_string(),
            preserve_cache: s.preserve_cache,
            credentials_dir: anchor(&s.credentials_dir, "."),
        };

        if self.build.dataset_command.trim().is_empty() {
            return Err(ReesError::configuration(
                "build.dataset_command must not be empty",
            ));
        }
        let build = BuildSettings {
            tool: self.build.tool,
            args: self.build.args.clone(),
            dataset_command: self.build.dataset_command.clone(),
        };

        Ok(ReesConfig {
            environment,
            source,
            container,
            build,
        })
    }
}

/// Load `rees.toml`, layer env and CLI overrides, and validate.
pub fn load_config(path: &Path, overrides: &ConfigOverrides) -> Result<ReesConfig> {
    let mut toml = ReesToml::load_or_default(path)?;
    toml.apply_env(|key| std::env::var(key).ok())?;
    toml.apply_overrides(overrides);
    toml.resolve(&config_base_dir(path)?)
}

/// Directory relative paths in the config file at `path` are anchored at.
pub fn config_base_dir(path: &Path) -> Result<PathBuf> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent.to_path_buf()),
        _ => std::env::current_dir().map_err(|e| {
            ReesError::configuration(format!("failed to determine current directory: {}", e))
        }),
    }
}

/// Directory holding the `.env` credentials file for the config at `path`.
///
/// Read before environment overrides apply, since it decides where those
/// secrets come from.
pub fn credentials_dir(path: &Path) -> Result<PathBuf> {
    let toml = ReesToml::load_or_default(path)?;
    let base_dir = config_base_dir(path)?;
    Ok(match toml.source.credentials_dir {
        Some(dir) if dir.is_absolute() => dir,
        Some(dir) => base_dir.join(dir),
        None => base_dir,
    })
}

fn required(value: &Option<String>, field: &str) -> Result<String> {
    non_blank(value).ok_or_else(|| ReesError::configuration(format!("{} is required", field)))
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ReesError::configuration(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}
