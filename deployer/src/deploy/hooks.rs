//! Lifecycle hooks run around a release switch

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::deploy::command::run_checked;
use crate::deploy::env::{rewrite_executables, EnvMap, Placeholders};
use crate::deploy::runtime::bin_dir;
use crate::errors::DeployerError;

const SRC_DIR: &str = "src";
const CD_SRC: &str = "cd src && ";

/// Everything a hook needs besides its command line
#[derive(Debug, Clone)]
pub struct HookContext<'a> {
    pub release: &'a Path,
    pub runtime: &'a Path,
    pub env: &'a EnvMap,
    pub placeholders: Placeholders<'a>,
    pub timeout: Duration,
}

/// A hook command resolved against a release
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedHook {
    pub command: String,
    pub workdir: PathBuf,
}

/// Working directory of a release: its `src/` subdirectory when present
pub fn release_workdir(release: &Path, has_src: bool) -> PathBuf {
    if has_src {
        release.join(SRC_DIR)
    } else {
        release.to_path_buf()
    }
}

/// Resolve the working directory and rewrite the command line.
///
/// When the release has a `src/` directory hooks run inside it; a leading
/// `cd src && ` is dropped since it would then fail, and any other explicit
/// `cd` keeps the release root as its starting point.
pub fn prepare(
    command: &str,
    release: &Path,
    has_src: bool,
    runtime: &Path,
    placeholders: &Placeholders<'_>,
) -> PreparedHook {
    let command = command.trim();
    let (command, workdir) = match command.strip_prefix(CD_SRC) {
        Some(rest) if has_src => (rest, release.join(SRC_DIR)),
        _ if has_src && !command.starts_with("cd ") => (command, release.join(SRC_DIR)),
        _ => (command, release.to_path_buf()),
    };

    let command = placeholders.apply(command);
    PreparedHook {
        command: rewrite_executables(&command, &bin_dir(runtime)),
        workdir,
    }
}

/// Run one hook through bash, returning its stdout
pub async fn run_hook(ctx: &HookContext<'_>, command: &str) -> Result<(PreparedHook, String), DeployerError> {
    let has_src = tokio::fs::metadata(ctx.release.join(SRC_DIR))
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    let hook = prepare(command, ctx.release, has_src, ctx.runtime, &ctx.placeholders);

    let path = match std::env::var("PATH") {
        Ok(path) if !path.is_empty() => format!("{}:{}", bin_dir(ctx.runtime).display(), path),
        _ => bin_dir(ctx.runtime).display().to_string(),
    };

    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(&hook.command)
        .current_dir(&hook.workdir)
        .envs(ctx.env)
        .env("PATH", path);

    let output = run_checked(cmd, &format!("hook `{}`", command.trim()), ctx.timeout).await?;
    Ok((hook, output.stdout))
}
