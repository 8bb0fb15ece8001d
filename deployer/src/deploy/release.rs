//! Release directories and the current-release pointer

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::DeployerError;
use crate::filesys::dir::Dir;
use crate::filesys::link::{read_symlink, switch_symlink};

/// Working-copy entries never copied into a release
const EXCLUDED: [&str; 1] = [".git"];

/// Copy the checked-out working copy into a fresh release directory
pub async fn materialize(repo: &Dir, release: &Dir) -> Result<(), DeployerError> {
    if release.exists().await {
        return Err(DeployerError::StorageError(format!(
            "Release directory {} already exists",
            release.path().display()
        )));
    }
    if let Some(parent) = release.path().parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    release.copy_from(repo.path(), &EXCLUDED).await
}

/// Atomically point `current` at `release`
pub async fn switch(release: &Path, current: &Path) -> Result<(), DeployerError> {
    switch_symlink(release, current).await?;
    debug!("{} -> {}", current.display(), release.display());
    Ok(())
}

/// Outcome of a prune pass
#[derive(Debug, Default)]
pub struct PruneReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Remove all but the newest `keep` releases.
///
/// Age is creation time (modification time where the filesystem has no
/// birth time). The target of `current` and everything in `protect` are
/// never removed. Removal errors are collected, not returned.
pub async fn prune(
    releases: &Dir,
    current: &Path,
    keep: usize,
    protect: &[&Path],
) -> Result<PruneReport, DeployerError> {
    let mut dirs = releases.list_dirs().await?;
    dirs.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.path.cmp(&a.path)));

    let live = read_symlink(current).await;
    let mut report = PruneReport::default();
    for entry in dirs.into_iter().skip(keep) {
        let protected = live.as_deref() == Some(entry.path.as_path())
            || protect.iter().any(|p| *p == entry.path.as_path());
        if protected {
            continue;
        }
        match Dir::new(&entry.path).delete().await {
            Ok(()) => report.removed.push(entry.path),
            Err(e) => {
                warn!("Failed to remove release {}: {}", entry.path.display(), e);
                report.failed.push((entry.path, e.to_string()));
            }
        }
    }
    Ok(report)
}
