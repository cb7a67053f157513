//! Typed error hierarchy for the REES build orchestrator.
//!
//! Two enums cover the library surface:
//! - `ReesError`: every failure an orchestration step can report
//! - `RegistryError`: container-registry discovery failures, nested in `ReesError`

use std::path::PathBuf;

use thiserror::Error;

/// Errors from container-registry discovery.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No registry image matches {search} (searched for pattern {pattern})")]
    ImageNotFound { search: String, pattern: String },

    #[error("Image {image} exists, but tag {tag} is missing")]
    TagNotFound { image: String, tag: String },

    #[error("No tag of {image} carries a readable creation date")]
    NoValidTags { image: String },

    #[error("Registry request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Registry request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Unexpected registry response from {url}: {message}")]
    InvalidResponse { url: String, message: String },
}

/// Errors from the build-environment lifecycle.
#[derive(Debug, Error)]
pub enum ReesError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Git operation failed: {message}: {source}")]
    GitOperation {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Container error: {message}")]
    Container {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("No free port in range {start}-{end}")]
    PortAllocation { start: u16, end: u16 },

    #[error("Container runtime is not available: {0}")]
    RuntimeUnavailable(String),

    #[error("Document build failed: {0}")]
    Build(String),

    #[error("Interrupted; the environment was torn down")]
    Interrupted,
}

impl ReesError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn git(message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::GitOperation {
            message: message.into(),
            source: source.into(),
        }
    }

    /// Wrap a filesystem error that happened at `path` as a git-state failure.
    pub fn git_io(action: &str, path: &std::path::Path, source: std::io::Error) -> Self {
        Self::GitOperation {
            message: format!("{} {}", action, path.display()),
            source: source.into(),
        }
    }

    pub fn container(message: impl Into<String>) -> Self {
        Self::Container {
            message: message.into(),
            source: None,
        }
    }

    pub fn container_with(message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Container {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Errors raised while reading the on-disk configuration file.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl From<ConfigFileError> for ReesError {
    fn from(err: ConfigFileError) -> Self {
        ReesError::Configuration(err.to_string())
    }
}

pub type Result<T, E = ReesError> = std::result::Result<T, E>;
