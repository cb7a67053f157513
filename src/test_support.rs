//! Shared fixtures for unit tests: a fake HTTP server and a local git origin.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::http::{HeaderMap, StatusCode, Uri};
use git2::{Repository, Signature};
use tempfile::TempDir;

type Handler = dyn Fn(&str, &HeaderMap) -> (u16, String) + Send + Sync;

/// An HTTP server on `127.0.0.1:0` answering every request through one
/// closure keyed by request path. Hits are counted per path.
pub struct FakeHttp {
    addr: SocketAddr,
    hits: Arc<Mutex<HashMap<String, u32>>>,
    task: tokio::task::JoinHandle<()>,
}

impl FakeHttp {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, &HeaderMap) -> (u16, String) + Send + Sync + 'static,
    {
        let handler: Arc<Handler> = Arc::new(handler);
        let hits: Arc<Mutex<HashMap<String, u32>>> = Arc::default();
        let counter = hits.clone();

        let app = axum::Router::new().fallback(move |uri: Uri, headers: HeaderMap| {
            let handler = handler.clone();
            let counter = counter.clone();
            async move {
                let path = uri.path().to_string();
                *counter.lock().unwrap().entry(path.clone()).or_default() += 1;
                let (status, body) = handler(&path, &headers);
                (
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    body,
                )
            }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, hits, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn hits(&self, path: &str) -> u32 {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

impl Drop for FakeHttp {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A working repository at `<root>/remotes/<owner>/<repo>` reachable through
/// a `file://` provider URL.
pub struct GitOrigin {
    pub root: TempDir,
    pub owner: String,
    pub name: String,
    repo: Repository,
}

impl GitOrigin {
    pub fn new(owner: &str, name: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("remotes").join(owner).join(name);
        std::fs::create_dir_all(&path).unwrap();
        let repo = Repository::init(&path).unwrap();
        let origin = Self {
            root,
            owner: owner.to_string(),
            name: name.to_string(),
            repo,
        };
        origin.commit_file("README.md", "# fixture\n", "Initial commit");
        origin
    }

    /// Provider base URL; the clone URL is `<provider>/<owner>/<name>`.
    pub fn provider(&self) -> String {
        format!("file://{}", self.root.path().join("remotes").display())
    }

    pub fn workdir(&self) -> PathBuf {
        self.root
            .path()
            .join("remotes")
            .join(&self.owner)
            .join(&self.name)
    }

    /// Write `rel` and commit it on the current branch; returns the new SHA.
    pub fn commit_file(&self, rel: &str, contents: &str, message: &str) -> String {
        let full = self.workdir().join(rel);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&full, contents).unwrap();

        let mut index = self.repo.index().unwrap();
        index.add_path(Path::new(rel)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = self.repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("fixture", "fixture@localhost").unwrap();
        let parent = self
            .repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap();
        oid.to_string()
    }

    /// Name of the branch HEAD points at (`master` or `main` depending on git config).
    pub fn head_branch(&self) -> String {
        self.repo
            .head()
            .unwrap()
            .shorthand()
            .unwrap_or("master")
            .to_string()
    }
}

/// In-memory `ContainerRuntime` that records every call.
#[derive(Default)]
pub struct FakeRuntime {
    calls: Mutex<Vec<String>>,
    live: Mutex<HashMap<String, bool>>,
    unreachable: bool,
    failing_pull: Option<String>,
    failing_start: bool,
    ip_address: Option<String>,
    exit_code: i64,
}

impl FakeRuntime {
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub fn failing_pulls_containing(mut self, needle: &str) -> Self {
        self.failing_pull = Some(needle.to_string());
        self
    }

    /// Containers are created but refuse to start, like a lost port race.
    pub fn failing_starts(mut self) -> Self {
        self.failing_start = true;
        self
    }

    pub fn with_ip(mut self, ip: &str) -> Self {
        self.ip_address = Some(ip.to_string());
        self
    }

    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn live_containers(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl crate::spawner::ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> anyhow::Result<String> {
        if self.unreachable {
            anyhow::bail!("connection refused");
        }
        Ok("fake-1.0".to_string())
    }

    async fn pull_image(
        &self,
        repository: &str,
        tag: &str,
        _auth: Option<&crate::credentials::RegistryAuth>,
        _server: &str,
    ) -> anyhow::Result<()> {
        self.record(format!("pull {}:{}", repository, tag));
        match &self.failing_pull {
            Some(needle) if repository.contains(needle.as_str()) => {
                anyhow::bail!("manifest unknown")
            }
            _ => Ok(()),
        }
    }

    async fn create_container(
        &self,
        spec: &crate::spawner::ContainerSpec,
    ) -> anyhow::Result<String> {
        self.record(format!("create {}", spec.image));
        let id = format!("container-{}", spec.port);
        self.live.lock().unwrap().insert(id.clone(), false);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> anyhow::Result<()> {
        self.record(format!("start {}", id));
        if self.failing_start {
            anyhow::bail!("port is already allocated");
        }
        if let Some(running) = self.live.lock().unwrap().get_mut(id) {
            *running = true;
        }
        Ok(())
    }

    async fn inspect(&self, id: &str) -> anyhow::Result<Option<crate::spawner::ContainerStatus>> {
        self.record(format!("inspect {}", id));
        Ok(self
            .live
            .lock()
            .unwrap()
            .get(id)
            .map(|running| crate::spawner::ContainerStatus {
                running: *running,
                status: if *running { "running" } else { "exited" }.to_string(),
                ip_address: self.ip_address.clone(),
            }))
    }

    async fn wait_for_exit(&self, id: &str) -> anyhow::Result<i64> {
        self.record(format!("wait {}", id));
        if let Some(running) = self.live.lock().unwrap().get_mut(id) {
            *running = false;
        }
        Ok(self.exit_code)
    }

    async fn stop(&self, id: &str, timeout_secs: u64) -> anyhow::Result<()> {
        self.record(format!("stop {} {}", id, timeout_secs));
        if let Some(running) = self.live.lock().unwrap().get_mut(id) {
            *running = false;
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        self.record(format!("remove {}", id));
        self.live.lock().unwrap().remove(id);
        Ok(())
    }

    async fn remove_exited(&self) -> anyhow::Result<usize> {
        self.record("remove-exited".to_string());
        let mut live = self.live.lock().unwrap();
        let before = live.len();
        live.retain(|_, running| *running);
        Ok(before - live.len())
    }
}
