//! Release pointer management

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::errors::DeployerError;

/// Point `link` at `target`.
///
/// A uniquely named sibling link is created first and renamed over `link`,
/// so readers resolve either the previous or the new target, never nothing.
pub async fn switch_symlink(target: &Path, link: &Path) -> Result<(), DeployerError> {
    let target = target.to_path_buf();
    let link = link.to_path_buf();
    tokio::task::spawn_blocking(move || replace_link(&target, &link)).await??;
    Ok(())
}

/// Resolve the target of `link`, `None` if it is missing or not a link
pub async fn read_symlink(link: &Path) -> Option<PathBuf> {
    tokio::fs::read_link(link).await.ok()
}

fn replace_link(target: &Path, link: &Path) -> anyhow::Result<()> {
    let tmp = unique_temp_path(link)?;
    create_dir_symlink(target, &tmp)
        .with_context(|| format!("Failed to create symlink {}", tmp.display()))?;

    if let Err(err) = std::fs::rename(&tmp, link) {
        // A real directory cannot be atomically replaced by a link.
        let is_dir = std::fs::symlink_metadata(link)
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            let _ = std::fs::remove_file(&tmp);
            return Err(anyhow::Error::new(err).context(format!(
                "Failed to move {} into {}",
                tmp.display(),
                link.display()
            )));
        }
        std::fs::remove_dir_all(link)
            .with_context(|| format!("Failed to remove directory {}", link.display()))?;
        std::fs::rename(&tmp, link)
            .with_context(|| format!("Failed to move {} into {}", tmp.display(), link.display()))?;
    }
    Ok(())
}

fn unique_temp_path(link: &Path) -> anyhow::Result<PathBuf> {
    let parent = link
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Link path has no parent: {}", link.display()))?;
    let base = link
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Link path has no filename: {}", link.display()))?;

    Ok(parent.join(format!(
        ".{}.tmp.{}",
        base.to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    )))
}

#[cfg(unix)]
fn create_dir_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_dir_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}
