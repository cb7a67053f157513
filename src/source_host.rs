//! Source-host REST client.
//!
//! Two lookups are needed from the host that serves the source repository:
//! the tip commit of a branch (to pin a `latest` commit ref) and the
//! project config file on that branch (to find which repository the
//! runtime image was built from).

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{RepositoryRef, SourceSettings};
use crate::retry::{Backoff, retry_with_backoff};

/// Project config file read from the source repository.
pub const PROJECT_CONFIG_FILE: &str = "myst.yml";

/// A failed source-host request, classified for the retry policy.
#[derive(Debug, thiserror::Error)]
pub enum SourceHostError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("unexpected response from {url}: {message}")]
    InvalidResponse { url: String, message: String },
}

impl SourceHostError {
    /// Connection failures, timeouts, and 5xx responses are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceHostError::Transport { source, .. } => {
                source.is_connect() || source.is_timeout()
            }
            SourceHostError::Status { status, .. } => *status >= 500,
            SourceHostError::InvalidResponse { .. } => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    sha: String,
}

/// The `project` section of a remote `myst.yml`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub project: ProjectSection,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct ProjectSection {
    #[serde(default)]
    pub thebe: Option<ThebeSection>,
    #[serde(default)]
    pub github: Option<GithubField>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct ThebeSection {
    #[serde(default)]
    pub binder: Option<BinderSection>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct BinderSection {
    #[serde(default)]
    pub repo: Option<String>,
}

/// `project.github` is either a bare string or an object with `repo`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum GithubField {
    Repo(String),
    Object {
        #[serde(default)]
        repo: Option<String>,
    },
}

impl ProjectConfig {
    pub fn parse(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse project config")
    }

    /// `project.thebe.binder.repo`, normalized to `owner/repo`.
    pub fn binder_repo(&self) -> Option<String> {
        self.project
            .thebe
            .as_ref()
            .and_then(|t| t.binder.as_ref())
            .and_then(|b| b.repo.as_deref())
            .and_then(normalize_repo)
    }

    /// `project.github` in either form, normalized to `owner/repo`.
    pub fn github_repo(&self) -> Option<String> {
        let raw = match self.project.github.as_ref()? {
            GithubField::Repo(repo) => Some(repo.as_str()),
            GithubField::Object { repo } => repo.as_deref(),
        };
        raw.and_then(normalize_repo)
    }
}

/// Normalize `owner/repo` or `https://host/owner/repo(.git)` to `owner/repo`.
pub fn normalize_repo(value: &str) -> Option<String> {
    let value = value.trim().trim_end_matches('/');
    let path = match value.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, path)| path)?,
        None => value,
    };
    let path = path.strip_suffix(".git").unwrap_or(path);
    let parts: Vec<&str> = path.split('/').collect();
    match parts.as_slice() {
        [owner, repo] if !owner.is_empty() && !repo.is_empty() => {
            Some(format!("{}/{}", owner, repo))
        }
        _ => None,
    }
}

/// Client for the source host's commit API and raw-file server.
pub struct SourceHostClient {
    http: reqwest::Client,
    api_url: String,
    raw_url: String,
    backoff: Backoff,
}

impl SourceHostClient {
    pub fn new(settings: &SourceSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("rees-build/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            api_url: settings.api_url.clone(),
            raw_url: settings.raw_url.clone(),
            backoff: Backoff::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// SHA of the tip of `branch`, retried on transient failures.
    pub async fn branch_tip(
        &self,
        repo: &RepositoryRef,
        branch: &str,
    ) -> Result<String, SourceHostError> {
        let url = format!(
            "{}/repos/{}/{}/commits/{}",
            self.api_url,
            repo.owner(),
            repo.name(),
            branch
        );
        let url = url.as_str();
        let label = format!("commit lookup {}@{}", repo, branch);
        retry_with_backoff(&label, self.backoff, SourceHostError::is_transient, move || {
            self.fetch_sha(url)
        })
        .await
    }

    async fn fetch_sha(&self, url: &str) -> Result<String, SourceHostError> {
        debug!(%url, "fetching branch tip");
        let resp = self
            .http
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|source| SourceHostError::Transport {
                url: url.to_string(),
                source,
            })?;
        if !resp.status().is_success() {
            return Err(SourceHostError::Status {
                url: url.to_string(),
                status: resp.status().as_u16(),
            });
        }
        let body: CommitResponse =
            resp.json()
                .await
                .map_err(|e| SourceHostError::InvalidResponse {
                    url: url.to_string(),
                    message: e.to_string(),
                })?;
        Ok(body.sha)
    }

    /// Fetch and parse `myst.yml` from `branch`. Any failure is a warning
    /// and yields `None`.
    pub async fn project_config(&self, repo: &RepositoryRef, branch: &str) -> Option<ProjectConfig> {
        let url = format!(
            "{}/{}/{}/{}/{}",
            self.raw_url,
            repo.owner(),
            repo.name(),
            branch,
            PROJECT_CONFIG_FILE
        );
        debug!(%url, "fetching project config");
        let resp = match self.http.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(%url, "could not fetch project config: {}", e);
                return None;
            }
        };
        if !resp.status().is_success() {
            warn!(%url, status = resp.status().as_u16(), "project config not available");
            return None;
        }
        let text = match resp.text().await {
            Ok(text) => text,
            Err(e) => {
                warn!(%url, "could not read project config: {}", e);
                return None;
            }
        };
        match ProjectConfig::parse(&text) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(%url, "{:#}", e);
                None
            }
        }
    }
}
