//! Container runtime seam.
//!
//! The spawner only needs a handful of daemon operations. They live behind
//! [`ContainerRuntime`] so the lifecycle can be driven against a fake in
//! tests. The production implementation is `DockerRuntime`.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::credentials::RegistryAuth;

/// A bind mount from a host path into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host: PathBuf,
    pub container: PathBuf,
    pub read_only: bool,
}

impl VolumeMount {
    pub fn read_write(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    /// `host:container:mode` as accepted by the daemon's bind list.
    pub fn bind_spec(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host.display(),
            self.container.display(),
            if self.read_only { "ro" } else { "rw" }
        )
    }
}

/// Everything needed to start the environment container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub entrypoint: Vec<String>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<VolumeMount>,
    /// Published on the same port number on the host.
    pub port: u16,
    /// `uid:gid` the container process runs as.
    pub user: String,
    pub working_dir: PathBuf,
}

/// Inspected container state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerStatus {
    pub running: bool,
    pub status: String,
    pub ip_address: Option<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Daemon version string; errors when the daemon is unreachable.
    async fn ping(&self) -> Result<String>;

    /// Pull `repository:tag`, authenticating against `server` when `auth` is set.
    async fn pull_image(
        &self,
        repository: &str,
        tag: &str,
        auth: Option<&RegistryAuth>,
        server: &str,
    ) -> Result<()>;

    /// Create a detached container without starting it; returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Current state, or `None` when the container does not exist.
    async fn inspect(&self, id: &str) -> Result<Option<ContainerStatus>>;

    /// Block until the container exits; returns its exit code.
    async fn wait_for_exit(&self, id: &str) -> Result<i64>;

    async fn stop(&self, id: &str, timeout_secs: u64) -> Result<()>;

    /// Force-remove the container.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Remove every exited container; returns how many were removed.
    async fn remove_exited(&self) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_spec_modes() {
        let rw = VolumeMount::read_write("/host/src", "/home/jovyan");
        let ro = VolumeMount::read_only("/host/DATA/ds", "/home/jovyan/data/ds");
        assert_eq!(rw.bind_spec(), "/host/src:/home/jovyan:rw");
        assert_eq!(ro.bind_spec(), "/host/DATA/ds:/home/jovyan/data/ds:ro");
    }
}
