//! Directory operations

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use tokio::fs;

use crate::errors::DeployerError;
use crate::filesys::file::File;

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

/// A child directory with the timestamp used to order releases
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub path: PathBuf,
    pub created: SystemTime,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Delete the directory and all contents
    pub async fn delete(&self) -> Result<(), DeployerError> {
        if self.exists().await {
            fs::remove_dir_all(&self.path).await?;
        }
        Ok(())
    }

    /// List real subdirectories, skipping symlinks, with their creation
    /// time (modification time where the platform has no birth time).
    pub async fn list_dirs(&self) -> Result<Vec<DirEntryInfo>, DeployerError> {
        let mut dirs = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let meta = fs::symlink_metadata(entry.path()).await?;
            if !meta.is_dir() {
                continue;
            }
            let created = meta
                .created()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            dirs.push(DirEntryInfo {
                path: entry.path(),
                created,
            });
        }

        Ok(dirs)
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Get a subdirectory
    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }

    /// Copy the contents of `src` into this directory, which must not exist
    /// yet. Entries named in `exclude` are skipped at the top level.
    pub async fn copy_from(&self, src: &Path, exclude: &[&str]) -> Result<(), DeployerError> {
        let src = src.to_path_buf();
        let dst = self.path.clone();
        let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            std::fs::create_dir(&dst)
                .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
            copy_tree(&src, &dst, &exclude)
        })
        .await??;
        Ok(())
    }
}

fn copy_tree(src: &Path, dst: &Path, exclude: &[String]) -> anyhow::Result<()> {
    for entry in
        std::fs::read_dir(src).with_context(|| format!("Failed to read dir: {}", src.display()))?
    {
        let entry =
            entry.with_context(|| format!("Failed to read dir entry: {}", src.display()))?;
        let name = entry.file_name();
        if exclude.iter().any(|e| name.to_string_lossy() == e.as_str()) {
            continue;
        }
        let ty = entry
            .file_type()
            .with_context(|| format!("Failed to stat dir entry: {}", entry.path().display()))?;
        let from = entry.path();
        let to = dst.join(&name);

        if ty.is_dir() {
            std::fs::create_dir_all(&to)
                .with_context(|| format!("Failed to create directory: {}", to.display()))?;
            copy_tree(&from, &to, &[])?;
        } else if ty.is_file() {
            std::fs::copy(&from, &to).with_context(|| {
                format!(
                    "Failed to copy file from {} to {}",
                    from.display(),
                    to.display()
                )
            })?;
        } else if ty.is_symlink() {
            let target = std::fs::read_link(&from)
                .with_context(|| format!("Failed to read link: {}", from.display()))?;
            copy_symlink(&target, &to)
                .with_context(|| format!("Failed to recreate link: {}", to.display()))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn copy_symlink(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_from_skips_excluded() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join(".git/objects")).unwrap();
        std::fs::create_dir_all(src.path().join("app")).unwrap();
        std::fs::write(src.path().join("app/main.py"), "print(1)").unwrap();
        std::fs::write(src.path().join("deploy.yaml"), "name: x").unwrap();

        let out = tempfile::tempdir().unwrap();
        let dst = Dir::new(out.path().join("release"));
        dst.copy_from(src.path(), &[".git"]).await.unwrap();

        assert!(dst.path().join("app/main.py").is_file());
        assert!(dst.path().join("deploy.yaml").is_file());
        assert!(!dst.path().join(".git").exists());
    }

    #[tokio::test]
    async fn test_copy_from_refuses_existing_destination() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let dst = Dir::new(out.path());
        assert!(dst.copy_from(src.path(), &[]).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_dirs_skips_symlinks_and_files() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("v1")).unwrap();
        std::fs::write(root.path().join("notes.txt"), "x").unwrap();
        std::os::unix::fs::symlink(root.path().join("v1"), root.path().join("current")).unwrap();

        let dirs = Dir::new(root.path()).list_dirs().await.unwrap();
        assert_eq!(dirs.len(), 1);
        assert!(dirs[0].path.ends_with("v1"));
    }
}
