//! The REES orchestrator.
//!
//! `Rees` owns the registry and source-host clients, the Source Manager,
//! and a handle to the container runtime. It runs the preflight check,
//! pins `latest` commit refs and image tags to concrete values, and pulls
//! the resolved image for the spawner.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{EnvironmentSpec, LATEST, ReesConfig};
use crate::credentials::Credentials;
use crate::errors::{ReesError, Result};
use crate::registry::{self, RegistryClient, ResolvedImage};
use crate::source::{BuildContext, SourceManager};
use crate::source_host::SourceHostClient;
use crate::spawner::ContainerRuntime;

/// Outcome of resolution: the image to run and the commit to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub image: ResolvedImage,
    pub commit_ref: String,
    pub source_name: String,
}

pub struct Rees {
    config: ReesConfig,
    credentials: Credentials,
    registry: RegistryClient,
    source_host: SourceHostClient,
    runtime: Arc<dyn ContainerRuntime>,
    sources: SourceManager,
    resolution: Option<Resolution>,
    pulled_image: Option<String>,
}

impl Rees {
    pub fn new(
        config: ReesConfig,
        credentials: Credentials,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        let registry = RegistryClient::new(&config.environment.registry_url, &credentials)
            .map_err(|e| ReesError::configuration(format!("{:#}", e)))?;
        let source_host = SourceHostClient::new(&config.source)
            .map_err(|e| ReesError::configuration(format!("{:#}", e)))?;
        let sources = SourceManager::from_config(&config);

        Ok(Self {
            config,
            credentials,
            registry,
            source_host,
            runtime,
            sources,
            resolution: None,
            pulled_image: None,
        })
    }

    pub fn config(&self) -> &ReesConfig {
        &self.config
    }

    pub fn environment(&self) -> &EnvironmentSpec {
        &self.config.environment
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.runtime.clone()
    }

    pub fn sources(&self) -> &SourceManager {
        &self.sources
    }

    pub fn sources_mut(&mut self) -> &mut SourceManager {
        &mut self.sources
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolution.as_ref()
    }

    /// Full reference of the image that was pulled, once pulled.
    pub fn pulled_image(&self) -> Option<&str> {
        self.pulled_image.as_deref()
    }

    /// Check that the container runtime answers before any other work.
    pub async fn preflight(&self) -> Result<String> {
        match self.runtime.ping().await {
            Ok(version) => {
                info!(%version, "container runtime is available");
                Ok(version)
            }
            Err(e) => Err(ReesError::RuntimeUnavailable(format!(
                "{:#}. Is the Docker daemon running and accessible to this user?",
                e
            ))),
        }
    }

    /// Pin a `latest` commit ref to the branch tip. Lookup failures leave
    /// the sentinel in place with a warning.
    pub async fn resolve_commit(&mut self) -> String {
        let env = &self.config.environment;
        if !env.commit_is_latest() {
            return env.commit_ref.clone();
        }
        match self.source_host.branch_tip(&env.repository, &env.branch).await {
            Ok(sha) => {
                info!(repository = %env.repository, branch = %env.branch, %sha, "resolved latest commit");
                self.config.environment.commit_ref = sha.clone();
                sha
            }
            Err(e) => {
                warn!(
                    repository = %env.repository,
                    "could not resolve latest commit, continuing with '{}': {}",
                    LATEST,
                    e
                );
                LATEST.to_string()
            }
        }
    }

    /// Locate the image in the registry and pin a `latest` image tag.
    pub async fn resolve_image(&mut self) -> Result<ResolvedImage> {
        self.locate_image().await.map(|(image, _)| image)
    }

    async fn locate_image(&mut self) -> Result<(ResolvedImage, String)> {
        let env = &self.config.environment;
        let project = if env.image_name_override.is_some() {
            None
        } else {
            self.source_host
                .project_config(&env.repository, &env.branch)
                .await
        };
        let source_name = registry::source_name(env, project.as_ref());
        let image = self.registry.resolve_image(env, &source_name).await?;
        self.config.environment.image_tag = image.tag.clone();
        Ok((image, source_name))
    }

    /// Resolve commit and image once; later calls return the pinned result.
    pub async fn resolve(&mut self) -> Result<Resolution> {
        if let Some(resolution) = &self.resolution {
            return Ok(resolution.clone());
        }
        let commit_ref = self.resolve_commit().await;
        let (image, source_name) = self.locate_image().await?;
        let resolution = Resolution {
            image,
            commit_ref,
            source_name,
        };
        self.sources
            .pin(&resolution.commit_ref, &resolution.image.tag);
        self.resolution = Some(resolution.clone());
        Ok(resolution)
    }

    /// Clone or refresh `latest/` and check out the target commit.
    pub fn prepare_source_tree(&mut self) -> Result<BuildContext> {
        let parent = self.config.container.host_build_source_parent_dir.clone();
        self.sources.clone_or_reuse(&parent)?;
        self.sources.checkout_target()?;
        self.sources
            .context()
            .cloned()
            .ok_or_else(|| ReesError::git("prepare source tree", anyhow::anyhow!("no build context")))
    }

    /// Pull `image`, first qualified with the registry host and then, if
    /// that fails, by its bare catalog name. Returns the reference pulled.
    pub async fn pull_image(&mut self, image: &ResolvedImage) -> Result<String> {
        let host = self.config.environment.registry_host().to_string();
        let auth = self.credentials.registry.as_ref();

        let qualified = image.pull_repository(&host);
        let first = self
            .runtime
            .pull_image(&qualified, &image.tag, auth, &host)
            .await;
        let reference = match first {
            Ok(()) => format!("{}:{}", qualified, image.tag),
            Err(e) => {
                warn!(image = %qualified, "pull failed, retrying without registry host: {:#}", e);
                self.runtime
                    .pull_image(&image.name, &image.tag, auth, &host)
                    .await
                    .map_err(|e| {
                        ReesError::container_with(format!("failed to pull {}", image.reference()), e)
                    })?;
                image.reference()
            }
        };
        info!(image = %reference, "image ready");
        self.pulled_image = Some(reference.clone());
        Ok(reference)
    }

    pub fn save_successful_build(&self) -> Result<bool> {
        self.sources.save_successful_build()
    }
}
