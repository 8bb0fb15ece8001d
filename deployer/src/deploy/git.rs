//! Source control client

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;
use tracing::{debug, info};

use crate::deploy::command::{run, run_checked};
use crate::errors::DeployerError;
use crate::filesys::file::File;
use crate::models::deployment::CommitInfo;

/// Working-copy operations the executor needs
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Clone `url` into `dir`, which must not exist
    async fn clone_repo(
        &self,
        url: &str,
        dir: &Path,
        deploy_key: Option<&SecretString>,
    ) -> Result<(), DeployerError>;

    /// Fetch all refs of `origin`
    async fn fetch(&self, dir: &Path, deploy_key: Option<&SecretString>)
        -> Result<(), DeployerError>;

    async fn checkout(&self, dir: &Path, reference: &str) -> Result<(), DeployerError>;

    /// Tip of `branch`: `origin/<branch>` first, then the local branch
    async fn branch_tip(&self, dir: &Path, branch: &str) -> Result<String, DeployerError>;

    async fn commit_info(&self, dir: &Path, sha: &str) -> Result<CommitInfo, DeployerError>;
}

/// [`SourceControl`] backed by the `git` binary
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: String,
    timeout: Duration,
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            binary: "git".to_string(),
            timeout,
        }
    }

    fn git(&self, dir: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }

    async fn rev_parse(&self, dir: &Path, reference: &str) -> Result<Option<String>, DeployerError> {
        let mut cmd = self.git(Some(dir));
        cmd.args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("{}^{{commit}}", reference));
        let output = run(cmd, "git rev-parse", self.timeout).await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(Some(output.stdout.trim().to_string()))
    }
}

/// Deploy key written to a private temporary file for the lifetime of one
/// git invocation. The file is removed on drop, including on error paths.
struct DeployKeyFile {
    path: PathBuf,
}

impl DeployKeyFile {
    async fn write(key: &SecretString) -> Result<Self, DeployerError> {
        let path = std::env::temp_dir().join(format!("deploy-key-{}", uuid::Uuid::new_v4()));
        let mut contents = key.expose_secret().to_string();
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        File::new(&path).write_private(contents.as_bytes()).await?;
        Ok(Self { path })
    }

    fn ssh_command(&self) -> String {
        format!(
            "ssh -i {} -o StrictHostKeyChecking=no",
            self.path.display()
        )
    }
}

impl Drop for DeployKeyFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait]
impl SourceControl for GitCli {
    async fn clone_repo(
        &self,
        url: &str,
        dir: &Path,
        deploy_key: Option<&SecretString>,
    ) -> Result<(), DeployerError> {
        info!("Cloning repository {} to {}", url, dir.display());
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let key = match deploy_key {
            Some(key) => Some(DeployKeyFile::write(key).await?),
            None => None,
        };
        let mut cmd = self.git(None);
        cmd.arg("clone").arg(url).arg(dir);
        if let Some(key) = &key {
            cmd.env("GIT_SSH_COMMAND", key.ssh_command());
        }
        run_checked(cmd, "git clone", self.timeout).await?;
        Ok(())
    }

    async fn fetch(
        &self,
        dir: &Path,
        deploy_key: Option<&SecretString>,
    ) -> Result<(), DeployerError> {
        debug!("Fetching {}", dir.display());
        let key = match deploy_key {
            Some(key) => Some(DeployKeyFile::write(key).await?),
            None => None,
        };
        let mut cmd = self.git(Some(dir));
        cmd.args(["fetch", "--prune", "origin"]);
        if let Some(key) = &key {
            cmd.env("GIT_SSH_COMMAND", key.ssh_command());
        }
        run_checked(cmd, "git fetch", self.timeout).await?;
        Ok(())
    }

    async fn checkout(&self, dir: &Path, reference: &str) -> Result<(), DeployerError> {
        let mut cmd = self.git(Some(dir));
        cmd.args(["checkout", "--force", "--detach", reference]);
        run_checked(cmd, "git checkout", self.timeout).await?;
        info!("Checked out {} in {}", reference, dir.display());
        Ok(())
    }

    async fn branch_tip(&self, dir: &Path, branch: &str) -> Result<String, DeployerError> {
        if let Some(sha) = self.rev_parse(dir, &format!("origin/{}", branch)).await? {
            return Ok(sha);
        }
        if let Some(sha) = self.rev_parse(dir, &format!("refs/heads/{}", branch)).await? {
            return Ok(sha);
        }
        Err(DeployerError::command(
            "git rev-parse",
            format!("branch {} not found", branch),
        ))
    }

    async fn commit_info(&self, dir: &Path, sha: &str) -> Result<CommitInfo, DeployerError> {
        let mut cmd = self.git(Some(dir));
        cmd.args(["show", "-s", "--format=%H%x00%an <%ae>%x00%ct%x00%B", sha]);
        let output = run_checked(cmd, "git show", self.timeout).await?;
        parse_commit_info(&output.stdout)
    }
}

fn parse_commit_info(text: &str) -> Result<CommitInfo, DeployerError> {
    let mut fields = text.splitn(4, '\0');
    let (Some(sha), Some(author), Some(timestamp), Some(message)) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(DeployerError::command("git show", "unexpected output format"));
    };

    let seconds: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| DeployerError::command("git show", format!("bad timestamp {}", timestamp)))?;
    let date = Utc
        .timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| DeployerError::command("git show", format!("bad timestamp {}", seconds)))?;

    Ok(CommitInfo {
        sha: sha.trim().to_string(),
        message: message.trim().to_string(),
        author: author.to_string(),
        date,
    })
}
