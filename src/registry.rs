//! Registry Resolver over the Docker Registry V2 HTTP API.
//!
//! Resolution runs in two steps. The catalog is searched for the first
//! repository whose name starts with the BinderHub-encoded source name,
//! then the tag is either checked against the tag list or, for `latest`,
//! chosen by the newest image creation time found in each tag's config blob.

use anyhow::Context;
use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::EnvironmentSpec;
use crate::credentials::{Credentials, RegistryAuth};
use crate::errors::{RegistryError, ReesError, Result};
use crate::naming;
use crate::source_host::ProjectConfig;

const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// An image located in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub name: String,
    pub tag: String,
}

impl ResolvedImage {
    /// `name:tag`, as listed in the catalog.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    /// Repository qualified with the registry host, without the tag.
    pub fn pull_repository(&self, registry_host: &str) -> String {
        format!("{}/{}", registry_host, self.name)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    repositories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ManifestResponse {
    config: Descriptor,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct ImageConfig {
    created: Option<String>,
}

/// Pick the name to search the catalog for.
///
/// Priority: image-name override, `project.thebe.binder.repo` from the
/// remote project config, `project.github`, then the repository itself.
pub fn source_name(spec: &EnvironmentSpec, project: Option<&ProjectConfig>) -> String {
    if let Some(name) = &spec.image_name_override {
        return name.clone();
    }
    if let Some(project) = project {
        if let Some(repo) = project.binder_repo() {
            debug!(%repo, "using binder repository from project config");
            return repo;
        }
        if let Some(repo) = project.github_repo() {
            debug!(%repo, "using github repository from project config");
            return repo;
        }
    }
    spec.repository.to_string()
}

pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    auth: Option<RegistryAuth>,
}

impl RegistryClient {
    pub fn new(registry_url: &str, credentials: &Credentials) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("rees-build/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: registry_url.trim_end_matches('/').to_string(),
            auth: credentials.registry.clone(),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_some()
    }

    async fn get(&self, path: &str, accept: Option<&str>) -> Result<reqwest::Response, RegistryError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.get(&url);
        if let Some(accept) = accept {
            request = request.header("Accept", accept);
        }
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }
        let resp = request
            .send()
            .await
            .map_err(|source| RegistryError::Http {
                url: url.clone(),
                source,
            })?;
        if !resp.status().is_success() {
            return Err(RegistryError::Status {
                url,
                status: resp.status().as_u16(),
            });
        }
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        accept: Option<&str>,
    ) -> Result<T, RegistryError> {
        let resp = self.get(path, accept).await?;
        let url = resp.url().to_string();
        resp.json()
            .await
            .map_err(|e| RegistryError::InvalidResponse {
                url,
                message: e.to_string(),
            })
    }

    /// `GET /v2/`: checks reachability and credentials.
    pub async fn ping(&self) -> Result<(), RegistryError> {
        self.get("/v2/", None).await.map(|_| ())
    }

    pub async fn catalog(&self) -> Result<Vec<String>, RegistryError> {
        let catalog: CatalogResponse = self.get_json("/v2/_catalog", None).await?;
        debug!(count = catalog.repositories.len(), "fetched registry catalog");
        Ok(catalog.repositories)
    }

    pub async fn list_tags(&self, image: &str) -> Result<Vec<String>, RegistryError> {
        let tags: TagsResponse = self
            .get_json(&format!("/v2/{}/tags/list", image), None)
            .await?;
        Ok(tags.tags.unwrap_or_default())
    }

    /// Creation time recorded in the config blob behind `image:tag`.
    pub async fn tag_created(
        &self,
        image: &str,
        tag: &str,
    ) -> Result<DateTime<FixedOffset>, RegistryError> {
        let manifest: ManifestResponse = self
            .get_json(&format!("/v2/{}/manifests/{}", image, tag), Some(MANIFEST_V2))
            .await?;
        let blob_path = format!("/v2/{}/blobs/{}", image, manifest.config.digest);
        let config: ImageConfig = self.get_json(&blob_path, None).await?;
        let created = config.created.ok_or_else(|| RegistryError::InvalidResponse {
            url: format!("{}{}", self.base_url, blob_path),
            message: "image config has no 'created' field".to_string(),
        })?;
        DateTime::parse_from_rfc3339(&created).map_err(|e| RegistryError::InvalidResponse {
            url: format!("{}{}", self.base_url, blob_path),
            message: format!("invalid created timestamp '{}': {}", created, e),
        })
    }

    /// First catalog entry matching the encoded `source_name`.
    pub async fn find_image(
        &self,
        source_name: &str,
        prefix: &str,
        namespace: Option<&str>,
    ) -> Result<String> {
        let pattern = naming::build_search_pattern(source_name, prefix, namespace)
            .map_err(|e| ReesError::configuration(format!("invalid image search pattern: {}", e)))?;
        let catalog = self.catalog().await?;

        match catalog.into_iter().find(|entry| pattern.is_match(entry)) {
            Some(image) => {
                info!(%image, "found image in registry");
                Ok(image)
            }
            None => Err(RegistryError::ImageNotFound {
                search: source_name.to_string(),
                pattern: pattern.as_str().to_string(),
            }
            .into()),
        }
    }

    /// The tag of `image` whose config blob has the most recent creation
    /// time. Tags whose metadata cannot be read are skipped; on equal times
    /// the tag listed first wins.
    pub async fn newest_tag(&self, image: &str) -> Result<String, RegistryError> {
        let tags = self.list_tags(image).await?;
        let mut newest: Option<(String, DateTime<FixedOffset>)> = None;

        for tag in tags {
            match self.tag_created(image, &tag).await {
                Ok(created) => {
                    debug!(%image, %tag, %created, "tag creation time");
                    if newest.as_ref().is_none_or(|(_, best)| created > *best) {
                        newest = Some((tag, created));
                    }
                }
                Err(e) => warn!(%image, %tag, "skipping tag: {}", e),
            }
        }

        newest
            .map(|(tag, _)| tag)
            .ok_or_else(|| RegistryError::NoValidTags {
                image: image.to_string(),
            })
    }

    /// Resolve image name and tag for `spec`, searching for `source_name`.
    pub async fn resolve_image(
        &self,
        spec: &EnvironmentSpec,
        source_name: &str,
    ) -> Result<ResolvedImage> {
        let name = self
            .find_image(
                source_name,
                &spec.image_prefix,
                spec.project_namespace.as_deref(),
            )
            .await?;

        let tag = if spec.image_tag_is_latest() {
            let tag = self.newest_tag(&name).await?;
            info!(image = %name, %tag, "resolved latest image tag");
            tag
        } else {
            let tags = self.list_tags(&name).await?;
            if !tags.iter().any(|t| t == &spec.image_tag) {
                return Err(RegistryError::TagNotFound {
                    image: name,
                    tag: spec.image_tag.clone(),
                }
                .into());
            }
            spec.image_tag.clone()
        };

        Ok(ResolvedImage { name, tag })
    }
}
