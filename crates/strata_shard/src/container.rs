//! Container runtime contract.
//!
//! Map and reduce jobs talk to long-lived containers over HTTP; pipelines
//! execute their `run` lines as one-shot tasks against a staged workspace
//! that exposes `/in` (inputs) and `/out` (outputs). The production binding
//! (Docker or any OCI runtime) lives outside this repo; what ships here is
//! the contract, a readiness helper, and [`ShellRuntime`], which runs
//! pipeline tasks directly on the host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

/// Staged filesystem view handed to one pipeline task run.
///
/// Inputs are laid out under `in_dir()` before the run; whatever the task
/// leaves under `out_dir()` is harvested afterwards.
pub struct TaskWorkspace {
    root: TempDir,
}

impl TaskWorkspace {
    pub fn new() -> anyhow::Result<Self> {
        let root = TempDir::new()?;
        std::fs::create_dir_all(root.path().join("in"))?;
        std::fs::create_dir_all(root.path().join("out"))?;
        Ok(Self { root })
    }

    pub fn in_dir(&self) -> PathBuf {
        self.root.path().join("in")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root.path().join("out")
    }

    /// Write one input file at `rel` under `/in`, creating parents.
    pub fn stage_input(&self, rel: &str, data: &[u8]) -> anyhow::Result<()> {
        let path = self.in_dir().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Collect every file under `/out` as `(relative path, bytes)`, sorted.
    pub fn collect_outputs(&self) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        collect_files(&self.out_dir(), "", &mut out)?;
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

fn collect_files(
    dir: &Path,
    rel: &str,
    out: &mut Vec<(String, Vec<u8>)>,
) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let child_rel = if rel.is_empty() {
            name.to_string()
        } else {
            format!("{rel}/{name}")
        };
        if entry.file_type()?.is_dir() {
            collect_files(&entry.path(), &child_rel, out)?;
        } else {
            out.push((child_rel, std::fs::read(entry.path())?));
        }
    }
    Ok(())
}

/// Container runtime contract.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Make `image` available locally. Idempotent.
    async fn pull_image(&self, image: &str) -> anyhow::Result<()>;

    /// Start a service container and return its id once its HTTP server is
    /// reachable at [`ContainerRuntime::ip_addr`].
    async fn start_container(&self, image: &str, cmd: &[String]) -> anyhow::Result<String>;

    /// Host (with port where applicable) of the container's HTTP server.
    async fn ip_addr(&self, id: &str) -> anyhow::Result<String>;

    /// Stop a service container. Idempotent.
    async fn stop_container(&self, id: &str) -> anyhow::Result<()>;

    /// Run one pipeline command to completion against `workspace`.
    async fn run_task(
        &self,
        image: &str,
        command: &str,
        workspace: &TaskWorkspace,
    ) -> anyhow::Result<()>;
}

/// Poll a host until its HTTP server answers, with capped exponential
/// backoff. Runtime implementations use this to satisfy the
/// `start_container` readiness requirement.
pub async fn wait_until_reachable(
    http: &reqwest::Client,
    host: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut pause = Duration::from_millis(50);
    loop {
        if http.get(format!("http://{host}/")).send().await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("container at {host} did not become reachable within {timeout:?}");
        }
        tokio::time::sleep(pause).await;
        pause = (pause * 2).min(Duration::from_secs(2));
    }
}

/// Host-local runtime for pipeline tasks.
///
/// Rewrites the conventional `/in` and `/out` mount points to the staged
/// workspace and executes the command with `sh -c`. It cannot host service
/// containers; map/reduce jobs need a real container binding.
pub struct ShellRuntime;

#[async_trait]
impl ContainerRuntime for ShellRuntime {
    async fn pull_image(&self, image: &str) -> anyhow::Result<()> {
        tracing::debug!(image, "shell runtime skips image pull");
        Ok(())
    }

    async fn start_container(&self, image: &str, _cmd: &[String]) -> anyhow::Result<String> {
        anyhow::bail!("shell runtime cannot host a service container for image {image}")
    }

    async fn ip_addr(&self, id: &str) -> anyhow::Result<String> {
        anyhow::bail!("shell runtime has no container {id}")
    }

    async fn stop_container(&self, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run_task(
        &self,
        image: &str,
        command: &str,
        workspace: &TaskWorkspace,
    ) -> anyhow::Result<()> {
        let rewritten = rewrite_mounts(command, workspace);
        tracing::debug!(image, command = %rewritten, "running pipeline task");
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&rewritten)
            .status()
            .await?;
        anyhow::ensure!(status.success(), "task {command:?} exited with {status}");
        Ok(())
    }
}

/// Substitute the `/in` and `/out` mount points with workspace paths.
fn rewrite_mounts(command: &str, workspace: &TaskWorkspace) -> String {
    let in_dir = workspace.in_dir();
    let out_dir = workspace.out_dir();
    command
        .split_whitespace()
        .map(|word| {
            if let Some(rest) = word.strip_prefix("/in") {
                if rest.is_empty() || rest.starts_with('/') {
                    return format!("{}{rest}", in_dir.display());
                }
            }
            if let Some(rest) = word.strip_prefix("/out") {
                if rest.is_empty() || rest.starts_with('/') {
                    return format!("{}{rest}", out_dir.display());
                }
            }
            word.to_string()
        })
        .collect::<Vec<_>>()
        .join(" ")
}
