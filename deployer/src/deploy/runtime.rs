//! Per-environment language runtime

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::deploy::command::{run, run_checked};
use crate::errors::DeployerError;

/// What [`RuntimeManager::ensure`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeSetup {
    /// A runtime was already present and has been reused
    Existing,
    /// A runtime was created with the named interpreter
    Created { interpreter: String },
}

/// Isolated runtime shared by every release of one environment
#[async_trait]
pub trait RuntimeManager: Send + Sync {
    /// Create the runtime at `dir` unless one is already there
    async fn ensure(&self, dir: &Path, version: &str) -> Result<RuntimeSetup, DeployerError>;

    /// Install the dependencies listed in `manifest` into the runtime
    async fn install(&self, dir: &Path, manifest: &Path) -> Result<(), DeployerError>;
}

/// Directory holding the runtime's executables
pub fn bin_dir(runtime: &Path) -> PathBuf {
    runtime.join("bin")
}

/// Interpreters tried in order for `version`: exact, major, then default
pub fn interpreter_candidates(version: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    let version = version.trim();
    if !version.is_empty() {
        candidates.push(format!("python{}", version));
        if let Some(major) = version.split('.').next() {
            candidates.push(format!("python{}", major));
        }
    }
    candidates.push("python3".to_string());
    candidates.dedup();
    candidates
}

/// [`RuntimeManager`] backed by `python -m venv` and pip
#[derive(Debug, Clone)]
pub struct PythonVenv {
    timeout: Duration,
}

impl PythonVenv {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn interpreter_available(&self, exe: &str) -> bool {
        let mut cmd = Command::new(exe);
        cmd.arg("--version");
        matches!(run(cmd, exe, Duration::from_secs(10)).await, Ok(out) if out.success())
    }

    async fn pip(&self, dir: &Path, args: &[&str]) -> Result<String, DeployerError> {
        let pip = bin_dir(dir).join("pip");
        if !tokio::fs::try_exists(&pip).await.unwrap_or(false) {
            return Err(DeployerError::command(
                "pip",
                format!("pip not found in runtime {}", dir.display()),
            ));
        }
        let mut cmd = Command::new(&pip);
        cmd.args(args);
        let output = run_checked(cmd, &format!("pip {}", args.join(" ")), self.timeout).await?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl RuntimeManager for PythonVenv {
    async fn ensure(&self, dir: &Path, version: &str) -> Result<RuntimeSetup, DeployerError> {
        if tokio::fs::try_exists(bin_dir(dir).join("python"))
            .await
            .unwrap_or(false)
        {
            debug!("Reusing runtime at {}", dir.display());
            return Ok(RuntimeSetup::Existing);
        }
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let candidates = interpreter_candidates(version);
        let mut chosen = None;
        for exe in &candidates {
            if self.interpreter_available(exe).await {
                chosen = Some(exe.clone());
                break;
            }
            warn!("Interpreter {} not available", exe);
        }
        let Some(interpreter) = chosen else {
            return Err(DeployerError::command(
                "python -m venv",
                format!("no interpreter found (tried {})", candidates.join(", ")),
            ));
        };

        let mut cmd = Command::new(&interpreter);
        cmd.args(["-m", "venv"]).arg(dir);
        run_checked(cmd, &format!("{} -m venv", interpreter), self.timeout).await?;
        self.pip(dir, &["install", "--upgrade", "pip"]).await?;

        info!("Created runtime at {} with {}", dir.display(), interpreter);
        Ok(RuntimeSetup::Created { interpreter })
    }

    async fn install(&self, dir: &Path, manifest: &Path) -> Result<(), DeployerError> {
        let manifest = manifest.display().to_string();
        info!("Installing dependencies from {}", manifest);
        let output = self.pip(dir, &["install", "-r", &manifest]).await?;
        debug!("pip output: {}", crate::utils::tail(&output, 2000));
        Ok(())
    }
}
