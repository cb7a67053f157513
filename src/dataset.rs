//! Dataset download collaborator.
//!
//! Datasets are described by `binder/data_requirement.json` in the source
//! tree and materialised on the host by an external downloader before the
//! container starts.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

#[async_trait]
pub trait DatasetFetcher: Send + Sync {
    /// Materialise the dataset described by `manifest` under `destination`.
    async fn fetch(&self, manifest: &Path, destination: &Path) -> Result<()>;
}

/// Runs `repo2data` (or a compatible command) as a subprocess.
pub struct Repo2Data {
    command: String,
}

impl Repo2Data {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn args(manifest: &Path, destination: &Path) -> Vec<String> {
        vec![
            "--server".to_string(),
            "-r".to_string(),
            manifest.display().to_string(),
            "--server_dst_folder".to_string(),
            destination.display().to_string(),
        ]
    }
}

#[async_trait]
impl DatasetFetcher for Repo2Data {
    async fn fetch(&self, manifest: &Path, destination: &Path) -> Result<()> {
        if !manifest.is_file() {
            warn!(path = %manifest.display(), "no data requirement file, skipping dataset download");
            return Ok(());
        }
        tokio::fs::create_dir_all(destination)
            .await
            .with_context(|| format!("Failed to create {}", destination.display()))?;

        info!(command = %self.command, manifest = %manifest.display(), "starting dataset download");
        let mut child = Command::new(&self.command)
            .args(Self::args(manifest, destination))
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.command))?;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                debug!(target: "rees_build::dataset", "{}", line);
            }
        }

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for {}", self.command))?;
        if !status.success() {
            bail!("{} exited with {}", self.command, status);
        }
        info!("dataset download finished");
        Ok(())
    }
}

/// A fetcher that never downloads anything.
pub struct SkipDataset;

#[async_trait]
impl DatasetFetcher for SkipDataset {
    async fn fetch(&self, manifest: &Path, _destination: &Path) -> Result<()> {
        debug!(manifest = %manifest.display(), "dataset download disabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_args_carry_manifest_and_destination() {
        let args = Repo2Data::args(Path::new("/b/binder/data_requirement.json"), Path::new("/DATA"));
        assert_eq!(
            args,
            vec![
                "--server",
                "-r",
                "/b/binder/data_requirement.json",
                "--server_dst_folder",
                "/DATA"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_manifest_is_skipped() {
        let dir = tempdir().unwrap();
        let fetcher = Repo2Data::new("definitely-not-a-real-command");
        fetcher
            .fetch(&dir.path().join("missing.json"), &dir.path().join("DATA"))
            .await
            .unwrap();
        assert!(!dir.path().join("DATA").exists());
    }

    #[tokio::test]
    async fn test_failing_command_is_an_error() {
        let dir = tempdir().unwrap();
        let manifest = dir.path().join("data_requirement.json");
        std::fs::write(&manifest, "{}").unwrap();
        let fetcher = Repo2Data::new("false");
        assert!(fetcher.fetch(&manifest, &dir.path().join("DATA")).await.is_err());
    }
}
