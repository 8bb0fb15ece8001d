//! Filesystem layout for repositories, releases and runtimes

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Where the deployer keeps working copies and per-project app trees
#[derive(Debug, Clone)]
pub struct DeployLayout {
    /// Root of the per-project git working copies
    pub repos_root: PathBuf,

    /// Root of the per-project application trees
    pub apps_root: PathBuf,
}

impl DeployLayout {
    /// Create a new layout
    pub fn new(repos_root: impl Into<PathBuf>, apps_root: impl Into<PathBuf>) -> Self {
        Self {
            repos_root: repos_root.into(),
            apps_root: apps_root.into(),
        }
    }

    /// Working copy of a project
    pub fn repo_dir(&self, project: &str) -> Dir {
        Dir::new(self.repos_root.join(project))
    }

    /// Application tree of a project
    pub fn project_dir(&self, project: &str) -> Dir {
        Dir::new(self.apps_root.join(project))
    }

    /// All releases of an environment
    pub fn releases_dir(&self, project: &str, environment: &str) -> Dir {
        Dir::new(
            self.apps_root
                .join(project)
                .join("releases")
                .join(environment),
        )
    }

    /// One materialized release
    pub fn release_dir(&self, project: &str, environment: &str, version: &str) -> Dir {
        self.releases_dir(project, environment).subdir(version)
    }

    /// The current-release link of an environment
    pub fn current_link(&self, project: &str, environment: &str) -> PathBuf {
        self.releases_dir(project, environment)
            .path()
            .join("current")
    }

    /// Shared runtime of an environment
    pub fn runtime_dir(&self, project: &str, environment: &str) -> Dir {
        Dir::new(self.apps_root.join(project).join("envs").join(environment))
    }

    /// Service log directory of an environment
    pub fn logs_dir(&self, project: &str, environment: &str) -> Dir {
        Dir::new(self.apps_root.join(project).join("logs").join(environment))
    }

    /// stdout log of a service
    pub fn stdout_log(&self, project: &str, environment: &str, service: &str) -> File {
        self.logs_dir(project, environment)
            .file(&format!("{}_stdout.log", service))
    }

    /// stderr log of a service
    pub fn stderr_log(&self, project: &str, environment: &str, service: &str) -> File {
        self.logs_dir(project, environment)
            .file(&format!("{}_stderr.log", service))
    }

    /// Uploaded media, shared across releases
    pub fn media_dir(&self, project: &str) -> Dir {
        self.project_dir(project).subdir("media")
    }

    /// Collected static files of the live release
    pub fn static_dir(&self, project: &str, environment: &str) -> PathBuf {
        self.current_link(project, environment).join("staticfiles")
    }
}

impl Default for DeployLayout {
    fn default() -> Self {
        Self::new("/srv/deployments/repos", "/srv/deployments/apps")
    }
}
