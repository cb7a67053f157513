//! Document-build collaborator.
//!
//! Runs `myst` or `curvenote` in the build directory against a running
//! environment. The process exit status decides success; error-looking
//! lines in the output are only reported.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{BuildSettings, BuildTool};
use crate::credentials::{CURVENOTE_TOKEN_VAR, Credentials};
use crate::errors::{ReesError, Result};
use crate::spawner::RunningEnvironment;

static ERROR_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\berror\b").expect("error marker regex is valid"));

/// Result of one build run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr lines in arrival order.
    pub output: Vec<String>,
    /// Number of output lines that look like errors.
    pub error_markers: usize,
}

impl BuildOutcome {
    pub fn log(&self) -> String {
        self.output.join("\n")
    }
}

pub struct DocumentBuilder {
    tool: BuildTool,
    executable: String,
    args: Vec<String>,
}

impl DocumentBuilder {
    pub fn new(settings: &BuildSettings) -> Self {
        Self {
            tool: settings.tool,
            executable: settings.tool.executable().to_string(),
            args: settings.args.clone(),
        }
    }

    /// Run a different program in place of the tool's executable.
    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn tool(&self) -> BuildTool {
        self.tool
    }

    /// Command line as it will be run.
    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.executable.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Check that `node` and the build tool are installed.
    pub async fn preflight(&self) -> Result<()> {
        for program in ["node", self.executable.as_str()] {
            let output = Command::new(program)
                .arg("--version")
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| ReesError::Build(format!("{} is not available: {}", program, e)))?;
            if !output.status.success() {
                return Err(ReesError::Build(format!(
                    "{} --version exited with {}",
                    program, output.status
                )));
            }
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            info!(%program, %version, "build prerequisite found");
        }
        Ok(())
    }

    /// Run the build in `build_dir` against `env`.
    pub async fn run(
        &self,
        build_dir: &Path,
        env: &RunningEnvironment,
        credentials: &Credentials,
    ) -> Result<BuildOutcome> {
        let mut command = Command::new(&self.executable);
        command
            .args(&self.args)
            .current_dir(build_dir)
            .env("JUPYTER_BASE_URL", &env.base_url)
            .env("JUPYTER_TOKEN", &env.token)
            .env("port", env.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        match (&self.tool, &credentials.curvenote_token) {
            (BuildTool::Curvenote, Some(token)) => {
                command.env(CURVENOTE_TOKEN_VAR, token);
            }
            _ => {
                command.env_remove(CURVENOTE_TOKEN_VAR);
            }
        }

        info!(command = %self.command_line().join(" "), dir = %build_dir.display(), "starting document build");
        let mut child = command
            .spawn()
            .map_err(|e| ReesError::Build(format!("failed to start {}: {}", self.executable, e)))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let mut output = Vec::new();
        while let Some(line) = rx.recv().await {
            info!(target: "rees_build::builder", "{}", line);
            output.push(line);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ReesError::Build(format!("failed to wait for {}: {}", self.executable, e)))?;
        let error_markers = count_error_markers(&output);
        let outcome = BuildOutcome {
            success: status.success(),
            exit_code: status.code(),
            output,
            error_markers,
        };

        if outcome.success {
            if error_markers > 0 {
                warn!(error_markers, "build succeeded but its log mentions errors");
            }
            info!("document build finished");
        } else {
            warn!(exit_code = ?outcome.exit_code, "document build failed");
        }
        Ok(outcome)
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}

fn count_error_markers(lines: &[String]) -> usize {
    lines.iter().filter(|line| ERROR_MARKER.is_match(line)).count()
}
