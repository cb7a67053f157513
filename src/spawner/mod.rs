//! Environment Spawner.
//!
//! Drives one environment container through
//! `Idle -> PortAllocated -> Spawning -> Running -> ReadinessConfirmed -> Terminated`.
//! Every failure after the port is allocated goes through [`EnvironmentSpawner::cleanup`]
//! before the error reaches the caller.

pub mod docker;
pub mod port;
pub mod readiness;
pub mod runtime;
pub mod token;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

pub use docker::DockerRuntime;
pub use readiness::ReadinessPolicy;
pub use runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, VolumeMount};

use crate::config::ContainerMountSpec;
use crate::dataset::DatasetFetcher;
use crate::errors::{ReesError, Result};
use crate::paths::translate_if_configured;
use crate::rees::Rees;
use crate::registry::ResolvedImage;
use crate::source::exclude::DATA_DIR;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnState {
    Idle,
    PortAllocated,
    Spawning,
    Running,
    ReadinessConfirmed,
    Terminated,
}

/// What the container runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMode {
    /// Long-running Jupyter server bound to `0.0.0.0:<port>`.
    NotebookServer,
    /// One-shot command, typically a static-site build.
    StaticBuild { command: Vec<String> },
}

impl ServerMode {
    fn entrypoint(&self, port: u16, token: &str) -> Vec<String> {
        match self {
            ServerMode::NotebookServer => vec![
                "jupyter".to_string(),
                "server".to_string(),
                "--allow-root".to_string(),
                "--ip".to_string(),
                "0.0.0.0".to_string(),
                "--log-level=DEBUG".to_string(),
                format!("--IdentityProvider.token={}", token),
                format!("--ServerApp.port={}", port),
            ],
            ServerMode::StaticBuild { command } => command.clone(),
        }
    }
}

/// Handle to a spawned container.
#[derive(Clone, PartialEq, Eq)]
pub struct RunningEnvironment {
    pub container_id: String,
    pub port: u16,
    pub token: String,
    pub base_url: String,
}

impl std::fmt::Debug for RunningEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningEnvironment")
            .field("container_id", &self.container_id)
            .field("port", &self.port)
            .field("token", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

pub struct EnvironmentSpawner {
    runtime: Arc<dyn ContainerRuntime>,
    mounts: ContainerMountSpec,
    readiness: ReadinessPolicy,
    state: SpawnState,
    port: Option<u16>,
    container_id: Option<String>,
}

impl EnvironmentSpawner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, mounts: ContainerMountSpec) -> Self {
        let readiness =
            ReadinessPolicy::with_timeout(Duration::from_secs(mounts.readiness_timeout_secs));
        Self {
            runtime,
            mounts,
            readiness,
            state: SpawnState::Idle,
            port: None,
            container_id: None,
        }
    }

    pub fn with_readiness(mut self, policy: ReadinessPolicy) -> Self {
        self.readiness = policy;
        self
    }

    pub fn state(&self) -> SpawnState {
        self.state
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Start the environment container for `image`.
    ///
    /// Prepares the source tree, fetches the dataset, pulls the image and
    /// runs the container. For a notebook server in Docker-in-Docker mode
    /// the base URL points at the container IP and the server must answer
    /// its status endpoint before this returns. Static builds never serve
    /// that endpoint and are left to the caller to wait on.
    pub async fn spawn(
        &mut self,
        rees: &mut Rees,
        image: &ResolvedImage,
        mode: &ServerMode,
        dataset: &dyn DatasetFetcher,
    ) -> Result<RunningEnvironment> {
        if self.container_id.is_some() {
            return Err(ReesError::container(
                "an environment is already running; clean it up first",
            ));
        }

        let port = port::find_open_port(self.mounts.port_range).await?;
        self.port = Some(port);
        self.state = SpawnState::PortAllocated;

        let token = token::generate_token();
        let base_url = format!("http://localhost:{}", port);

        self.state = SpawnState::Spawning;
        match self
            .launch(rees, image, mode, dataset, port, &token, base_url)
            .await
        {
            Ok(env) => Ok(env),
            Err(e) => {
                warn!(port, "spawn failed, tearing down: {}", e);
                self.cleanup().await;
                Err(match e {
                    ReesError::Container { .. } => e,
                    other => ReesError::container_with("failed to spawn environment", other),
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn launch(
        &mut self,
        rees: &mut Rees,
        image: &ResolvedImage,
        mode: &ServerMode,
        dataset: &dyn DatasetFetcher,
        port: u16,
        token: &str,
        mut base_url: String,
    ) -> Result<RunningEnvironment> {
        let context = rees.prepare_source_tree()?;

        let data_dir = context.build_dir.join(DATA_DIR);
        tokio::fs::create_dir_all(&data_dir).await.map_err(|e| {
            ReesError::container_with(format!("failed to create {}", data_dir.display()), e)
        })?;

        if let Some(name) = &context.dataset_name
            && let Some(manifest) = rees.sources().data_requirement_path()
        {
            info!(dataset = %name, "fetching dataset");
            dataset
                .fetch(&manifest, &self.mounts.host_data_parent_dir)
                .await
                .map_err(|e| ReesError::container_with(format!("dataset {} failed", name), e))?;
        }

        let volumes = self.volumes(&context.build_dir, context.dataset_name.as_deref());
        let reference = rees.pull_image(image).await?;

        let spec = ContainerSpec {
            image: reference,
            entrypoint: mode.entrypoint(port, token),
            env: vec![
                ("JUPYTER_TOKEN".to_string(), token.to_string()),
                ("port".to_string(), port.to_string()),
                ("JUPYTER_BASE_URL".to_string(), base_url.clone()),
            ],
            mounts: volumes,
            port,
            user: host_user(),
            working_dir: self.mounts.container_build_source_mount_dir.clone(),
        };
        debug!(image = %spec.image, port, user = %spec.user, "creating container");
        let id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| ReesError::container_with(format!("failed to create {}", spec.image), e))?;
        // Tracked before start so a failed start is still removed by cleanup.
        self.container_id = Some(id.clone());
        self.runtime
            .start_container(&id)
            .await
            .map_err(|e| ReesError::container_with(format!("failed to start {}", spec.image), e))?;
        self.state = SpawnState::Running;
        info!(container = %id, port, "container started");

        if self.mounts.enable_dind && *mode == ServerMode::NotebookServer {
            let status = self
                .runtime
                .inspect(&id)
                .await
                .map_err(|e| ReesError::container_with("failed to inspect container", e))?;
            let ip = status.and_then(|s| s.ip_address).ok_or_else(|| {
                ReesError::container(format!("container {} has no network address", id))
            })?;
            base_url = format!("http://{}:{}", ip, port);
            readiness::wait_until_ready(&base_url, token, self.readiness).await?;
            self.state = SpawnState::ReadinessConfirmed;
            info!(%base_url, "notebook server is ready");
        }

        Ok(RunningEnvironment {
            container_id: id,
            port,
            token: token.to_string(),
            base_url,
        })
    }

    /// Source tree read-write, dataset read-only, both translated to host
    /// paths when a host prefix is configured.
    fn volumes(&self, build_dir: &std::path::Path, dataset: Option<&str>) -> Vec<VolumeMount> {
        let prefix = self.mounts.host_path_prefix.as_deref();
        let container_prefix = &self.mounts.container_path_prefix;

        let mut volumes = vec![VolumeMount::read_write(
            translate_if_configured(build_dir, prefix, container_prefix),
            self.mounts.container_build_source_mount_dir.clone(),
        )];
        if let Some(name) = dataset {
            let host: PathBuf = self.mounts.host_data_parent_dir.join(name);
            volumes.push(VolumeMount::read_only(
                translate_if_configured(&host, prefix, container_prefix),
                self.mounts.container_data_mount_dir.join(name),
            ));
        }
        volumes
    }

    /// Stop and remove the container, then forget it and the port.
    ///
    /// Returns `true` when the container is confirmed gone. The handle is
    /// cleared even when the runtime calls fail.
    pub async fn cleanup(&mut self) -> bool {
        let mut removed = true;
        if let Some(id) = self.container_id.take() {
            if let Err(e) = self.runtime.stop(&id, self.mounts.stop_timeout_secs).await {
                warn!(container = %id, "stop failed: {:#}", e);
            }
            if let Err(e) = self.runtime.remove(&id).await {
                warn!(container = %id, "remove failed: {:#}", e);
            }
            removed = match self.runtime.inspect(&id).await {
                Ok(None) => true,
                Ok(Some(status)) => {
                    warn!(container = %id, status = %status.status, "container still present after removal");
                    false
                }
                Err(e) => {
                    warn!(container = %id, "could not verify removal: {:#}", e);
                    false
                }
            };
            if removed {
                info!(container = %id, "container removed");
            }
        }
        self.port = None;
        self.state = SpawnState::Terminated;
        removed
    }

    /// Whether the container exists and is running. Inspect errors count as not running.
    pub async fn is_running(&self) -> bool {
        let Some(id) = &self.container_id else {
            return false;
        };
        match self.runtime.inspect(id).await {
            Ok(Some(status)) => status.running,
            Ok(None) => false,
            Err(e) => {
                debug!(container = %id, "inspect failed: {:#}", e);
                false
            }
        }
    }

    /// Block until the container exits and return its exit code.
    pub async fn wait_for_exit(&self) -> Result<i64> {
        let id = self
            .container_id
            .as_deref()
            .ok_or_else(|| ReesError::container("no container to wait for"))?;
        self.runtime
            .wait_for_exit(id)
            .await
            .map_err(|e| ReesError::container_with(format!("failed to wait for {}", id), e))
    }

    /// Remove every exited container known to the runtime.
    pub async fn prune_exited_containers(&self) -> Result<usize> {
        let removed = self
            .runtime
            .remove_exited()
            .await
            .map_err(|e| ReesError::container_with("failed to prune exited containers", e))?;
        info!(removed, "pruned exited containers");
        Ok(removed)
    }

    /// Spawn, run `body` against the environment, and always clean up.
    ///
    /// Ctrl-C while `body` runs tears the container down and yields
    /// [`ReesError::Interrupted`].
    pub async fn scoped<F, Fut, T>(
        &mut self,
        rees: &mut Rees,
        image: &ResolvedImage,
        mode: &ServerMode,
        dataset: &dyn DatasetFetcher,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(RunningEnvironment) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.scoped_until(rees, image, mode, dataset, interrupt_signal(), body)
            .await
    }

    /// [`scoped`](Self::scoped) with an explicit shutdown trigger.
    pub async fn scoped_until<F, Fut, S, T>(
        &mut self,
        rees: &mut Rees,
        image: &ResolvedImage,
        mode: &ServerMode,
        dataset: &dyn DatasetFetcher,
        shutdown: S,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(RunningEnvironment) -> Fut,
        Fut: Future<Output = Result<T>>,
        S: Future<Output = ()>,
    {
        let env = self.spawn(rees, image, mode, dataset).await?;
        let outcome = tokio::select! {
            outcome = body(env) => outcome,
            () = shutdown => {
                warn!("interrupted, tearing down environment");
                Err(ReesError::Interrupted)
            }
        };
        self.cleanup().await;
        outcome
    }
}

/// Resolves on Ctrl-C. If the handler cannot be installed it never resolves.
async fn interrupt_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to install Ctrl-C handler: {}", e);
        std::future::pending::<()>().await;
    }
}

/// `uid:gid` of the invoking user.
fn host_user() -> String {
    // SAFETY: getuid and getgid have no preconditions and cannot fail.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    format!("{}:{}", uid, gid)
}
