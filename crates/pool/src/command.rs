//! Render engine backed by a headless Chromium-compatible binary.
//!
//! Each worker owns a private profile directory. A render writes the page
//! (with the job's `@page` stylesheet injected) into that directory and runs
//! the browser once in `--print-to-pdf` mode. The child is spawned with
//! `kill_on_drop(true)`, so dropping the render future on timeout kills it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use folio_core::job::{RenderJob, RenderSource};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::engine::{EngineError, RenderEngine, WorkerProcess};
use crate::handle::WorkerId;

/// Longest stderr excerpt carried in a crash message.
const MAX_STDERR_EXCERPT: usize = 2048;

#[derive(Debug, Clone)]
pub struct CommandEngineConfig {
    /// Browser executable, resolved through `PATH` if relative.
    pub binary: PathBuf,
    /// Parent directory for worker profiles. Defaults to the system temp dir.
    pub scratch_dir: Option<PathBuf>,
    /// Bound on the `--version` probe run at launch.
    pub probe_timeout: Duration,
    /// Extra flags appended to every render invocation.
    pub extra_args: Vec<String>,
}

impl Default for CommandEngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("chromium"),
            scratch_dir: None,
            probe_timeout: Duration::from_secs(10),
            extra_args: Vec::new(),
        }
    }
}

pub struct CommandEngine {
    config: CommandEngineConfig,
}

impl CommandEngine {
    pub fn new(config: CommandEngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RenderEngine for CommandEngine {
    async fn launch(&self, id: WorkerId) -> Result<Box<dyn WorkerProcess>, EngineError> {
        let mut probe = Command::new(&self.config.binary);
        probe
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.probe_timeout, probe.output())
            .await
            .map_err(|_| EngineError::Timeout(self.config.probe_timeout))?
            .map_err(|e| {
                EngineError::Launch(format!("{}: {e}", self.config.binary.display()))
            })?;
        if !output.status.success() {
            return Err(EngineError::Launch(format!(
                "{} --version exited with {}",
                self.config.binary.display(),
                output.status
            )));
        }

        let prefix = format!("folio-{id}-");
        let profile = match &self.config.scratch_dir {
            Some(dir) => tempfile::Builder::new().prefix(&prefix).tempdir_in(dir),
            None => tempfile::Builder::new().prefix(&prefix).tempdir(),
        }
        .map_err(|e| EngineError::Launch(format!("profile directory: {e}")))?;

        tracing::debug!(
            worker_id = %id,
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            profile = %profile.path().display(),
            "Browser worker ready",
        );

        Ok(Box::new(CommandWorker {
            id,
            binary: self.config.binary.clone(),
            extra_args: self.config.extra_args.clone(),
            profile: Mutex::new(Some(profile)),
            sequence: AtomicU64::new(0),
        }))
    }
}

struct CommandWorker {
    id: WorkerId,
    binary: PathBuf,
    extra_args: Vec<String>,
    profile: Mutex<Option<TempDir>>,
    sequence: AtomicU64,
}

impl CommandWorker {
    fn profile_path(&self) -> Result<PathBuf, EngineError> {
        let profile = self
            .profile
            .lock()
            .map_err(|_| EngineError::Crashed("profile lock poisoned".into()))?;
        profile
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
            .ok_or_else(|| EngineError::Crashed(format!("worker {} is closed", self.id)))
    }
}

#[async_trait]
impl WorkerProcess for CommandWorker {
    async fn render(&self, job: &RenderJob) -> Result<Vec<u8>, EngineError> {
        let profile = self.profile_path()?;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let output_path = profile.join(format!("out-{seq}.pdf"));

        let (target, page_path) = match &job.source {
            RenderSource::Html(_) => {
                let page_path = profile.join(format!("page-{seq}.html"));
                let html = job.html_with_page_css().unwrap_or_default();
                tokio::fs::write(&page_path, html)
                    .await
                    .map_err(|e| EngineError::Crashed(format!("write page: {e}")))?;
                (format!("file://{}", page_path.display()), Some(page_path))
            }
            RenderSource::Url(url) => (url.clone(), None),
        };

        let mut cmd = Command::new(&self.binary);
        cmd.args(print_args(&profile, &output_path, &self.extra_args))
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let result = run_print(&mut cmd, &output_path).await;

        if let Some(page_path) = page_path {
            let _ = tokio::fs::remove_file(page_path).await;
        }
        let _ = tokio::fs::remove_file(&output_path).await;
        result
    }

    async fn close(&self) {
        let profile = match self.profile.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(dir) = profile {
            let id = self.id;
            let removed = tokio::task::spawn_blocking(move || dir.close()).await;
            if let Ok(Err(e)) = removed {
                tracing::warn!(worker_id = %id, error = %e, "Failed to remove worker profile");
            }
        }
    }
}

/// Flags for one print invocation, excluding the target.
fn print_args(profile: &Path, output: &Path, extra: &[String]) -> Vec<String> {
    let mut args = vec![
        "--headless".to_string(),
        "--disable-gpu".to_string(),
        "--no-sandbox".to_string(),
        "--no-first-run".to_string(),
        "--no-pdf-header-footer".to_string(),
        format!("--user-data-dir={}", profile.join("chrome").display()),
        format!("--print-to-pdf={}", output.display()),
    ];
    args.extend(extra.iter().cloned());
    args
}

async fn run_print(cmd: &mut Command, output_path: &Path) -> Result<Vec<u8>, EngineError> {
    let mut child = cmd
        .spawn()
        .map_err(|e| EngineError::Crashed(format!("spawn: {e}")))?;

    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = (&mut stderr)
                .take(64 * 1024)
                .read_to_end(&mut buf)
                .await;
        }
        buf
    });

    let status = child
        .wait()
        .await
        .map_err(|e| EngineError::Crashed(format!("wait: {e}")))?;
    let stderr = stderr_task.await.unwrap_or_default();

    if !status.success() {
        return Err(EngineError::Crashed(format!(
            "browser exited with {status}: {}",
            excerpt(&stderr)
        )));
    }

    match tokio::fs::read(output_path).await {
        Ok(bytes) if !bytes.is_empty() => Ok(bytes),
        Ok(_) => Err(EngineError::Crashed("browser produced an empty PDF".into())),
        Err(e) => Err(EngineError::Crashed(format!(
            "no PDF produced ({e}): {}",
            excerpt(&stderr)
        ))),
    }
}

fn excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= MAX_STDERR_EXCERPT {
        return text.to_string();
    }
    let mut start = text.len() - MAX_STDERR_EXCERPT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
