//! `ContainerRuntime` backed by the local Docker daemon through bollard.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptionsBuilder, InspectContainerOptions,
    ListContainersOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder, WaitContainerOptions,
};
use futures_util::StreamExt;
use tracing::{debug, info};

use super::runtime::{ContainerRuntime, ContainerSpec, ContainerStatus};
use crate::credentials::RegistryAuth;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform default socket.
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn container_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let port_key = format!("{}/tcp", spec.port);
    let mut port_bindings = HashMap::new();
    port_bindings.insert(
        port_key,
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(spec.port.to_string()),
        }]),
    );

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        entrypoint: Some(spec.entrypoint.clone()),
        env: Some(
            spec.env
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect(),
        ),
        user: Some(spec.user.clone()),
        working_dir: Some(spec.working_dir.display().to_string()),
        host_config: Some(HostConfig {
            binds: Some(spec.mounts.iter().map(|m| m.bind_spec()).collect()),
            port_bindings: Some(port_bindings),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<String> {
        let version = self
            .docker
            .version()
            .await
            .context("Docker daemon is not reachable")?;
        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }

    async fn pull_image(
        &self,
        repository: &str,
        tag: &str,
        auth: Option<&RegistryAuth>,
        server: &str,
    ) -> Result<()> {
        let options = CreateImageOptionsBuilder::default()
            .from_image(repository)
            .tag(tag)
            .build();
        let credentials = auth.map(|auth| DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            serveraddress: Some(server.to_string()),
            ..Default::default()
        });

        info!(image = %format!("{}:{}", repository, tag), "pulling image");
        let mut stream = std::pin::pin!(self.docker.create_image(Some(options), None, credentials));
        while let Some(progress) = stream.next().await {
            let progress =
                progress.with_context(|| format!("Failed to pull {}:{}", repository, tag))?;
            if let Some(status) = progress.status {
                debug!(image = %repository, "{}", status);
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let created = self
            .docker
            .create_container(None::<CreateContainerOptions>, container_body(spec))
            .await
            .with_context(|| format!("Failed to create container from {}", spec.image))?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .with_context(|| format!("Failed to start container {}", id))
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerStatus>> {
        let inspected = match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspected) => inspected,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to inspect container {}", id)),
        };

        let state = inspected.state.unwrap_or_default();
        let ip_address = inspected
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|networks| {
                networks
                    .into_values()
                    .filter_map(|endpoint| endpoint.ip_address)
                    .find(|ip| !ip.is_empty())
            });

        Ok(Some(ContainerStatus {
            running: state.running.unwrap_or(false),
            status: state
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            ip_address,
        }))
    }

    async fn wait_for_exit(&self, id: &str) -> Result<i64> {
        let mut stream = std::pin::pin!(
            self.docker
                .wait_container(id, None::<WaitContainerOptions>)
        );
        let mut exit_code = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(response) => exit_code = response.status_code,
                // bollard reports a non-zero exit as an error carrying the code
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    return Ok(code);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to wait for container {}", id));
                }
            }
        }
        Ok(exit_code)
    }

    async fn stop(&self, id: &str, timeout_secs: u64) -> Result<()> {
        let options = StopContainerOptionsBuilder::default()
            .t(i32::try_from(timeout_secs).unwrap_or(i32::MAX))
            .build();
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to stop container {}", id)),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove container {}", id)),
        }
    }

    async fn remove_exited(&self) -> Result<usize> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("status".to_string(), vec!["exited".to_string()]);
        let options = ListContainersOptionsBuilder::default()
            .all(true)
            .filters(&filters)
            .build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        let mut removed = 0;
        for id in containers.into_iter().filter_map(|c| c.id) {
            self.remove(&id).await?;
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawner::runtime::VolumeMount;
    use std::path::PathBuf;

    #[test]
    fn test_container_body_publishes_port_and_binds() {
        let spec = ContainerSpec {
            image: "registry.example.org/binder-user-2drepo:v2".into(),
            entrypoint: vec!["jupyter".into(), "server".into()],
            env: vec![("JUPYTER_TOKEN".into(), "abc".into())],
            mounts: vec![VolumeMount::read_write("/h/src", "/home/jovyan")],
            port: 9001,
            user: "1000:1000".into(),
            working_dir: PathBuf::from("/home/jovyan"),
        };
        let body = container_body(&spec);

        assert_eq!(body.user.as_deref(), Some("1000:1000"));
        assert_eq!(body.env.unwrap(), vec!["JUPYTER_TOKEN=abc".to_string()]);
        let host = body.host_config.unwrap();
        assert_eq!(host.binds.unwrap(), vec!["/h/src:/home/jovyan:rw".to_string()]);
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["9001/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("9001"));
    }
}
