//! Process supervisor adapter.
//!
//! Each service gets one program file named after its supervisor name.
//! Writing a file does not start anything; `reload_config` asks the
//! supervisor to pick up added and changed programs, and `restart` bounces
//! one program.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::deploy::command::{run, run_checked};
use crate::deploy::env::EnvMap;
use crate::errors::DeployerError;
use crate::filesys::file::File;
use crate::storage::settings::SupervisorSettings;

/// Rendered inputs of one supervised program
#[derive(Debug, Clone)]
pub struct ProgramConfig {
    pub name: String,
    pub command: String,
    pub directory: PathBuf,
    pub user: String,
    pub environment: EnvMap,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
}

impl ProgramConfig {
    pub fn render(&self) -> String {
        format!(
            "[program:{name}]
command={command}
directory={directory}
user={user}
autostart=true
autorestart=true
startsecs=10
stopwaitsecs=30
killasgroup=true
stopasgroup=true
stdout_logfile={stdout}
stdout_logfile_maxbytes=10MB
stdout_logfile_backups=5
stderr_logfile={stderr}
stderr_logfile_maxbytes=10MB
stderr_logfile_backups=5
environment={environment}
",
            name = self.name,
            command = self.command,
            directory = self.directory.display(),
            user = self.user,
            stdout = self.stdout_log.display(),
            stderr = self.stderr_log.display(),
            environment = format_environment(&self.environment),
        )
    }
}

/// `KEY="value",...` with quotes and backslashes escaped
fn format_environment(env: &EnvMap) -> String {
    env.iter()
        .map(|(key, value)| {
            let value = value
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('%', "%%")
                .replace('\n', " ");
            format!("{}=\"{}\"", key, value)
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Write the program file, returning its path
    async fn write_config(&self, program: &ProgramConfig) -> Result<PathBuf, DeployerError>;

    /// Make the supervisor re-read its program files
    async fn reload_config(&self) -> Result<(), DeployerError>;

    /// Restart one program, falling back to stop then start
    async fn restart(&self, name: &str) -> Result<(), DeployerError>;

    /// Current pid of a program, `None` when it is not running
    async fn pid(&self, name: &str) -> Result<Option<u32>, DeployerError>;
}

/// [`ProcessSupervisor`] for supervisord through `supervisorctl`
#[derive(Debug, Clone)]
pub struct Supervisorctl {
    config_dir: PathBuf,
    ctl_command: String,
    timeout: Duration,
}

impl Supervisorctl {
    pub fn new(settings: &SupervisorSettings) -> Self {
        Self {
            config_dir: settings.config_dir.clone(),
            ctl_command: settings.ctl_command.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{}.conf", name))
    }

    fn ctl(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.ctl_command);
        cmd.args(args);
        cmd
    }

    fn label(&self, args: &[&str]) -> String {
        format!("{} {}", self.ctl_command, args.join(" "))
    }

    async fn ctl_checked(&self, args: &[&str]) -> Result<String, DeployerError> {
        let output = run_checked(self.ctl(args), &self.label(args), self.timeout).await?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl ProcessSupervisor for Supervisorctl {
    async fn write_config(&self, program: &ProgramConfig) -> Result<PathBuf, DeployerError> {
        for log in [&program.stdout_log, &program.stderr_log] {
            if let Some(dir) = log.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        let path = self.config_path(&program.name);
        File::new(&path)
            .write_atomic(program.render().as_bytes())
            .await?;
        info!("Wrote supervisor config for {}", program.name);
        Ok(path)
    }

    async fn reload_config(&self) -> Result<(), DeployerError> {
        self.ctl_checked(&["reread"]).await?;
        self.ctl_checked(&["update"]).await?;
        debug!("Supervisor configuration reloaded");
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<(), DeployerError> {
        let args = ["restart", name];
        let restart = run(self.ctl(&args), &self.label(&args), self.timeout).await;
        match restart {
            Ok(output) if output.success() => {
                info!("Restarted {}", name);
                return Ok(());
            }
            Ok(output) => warn!("Restart of {} failed: {}", name, output.failure_text()),
            Err(e) => warn!("Restart of {} failed: {}", name, e),
        }

        let stop = ["stop", name];
        if let Err(e) = run(self.ctl(&stop), &self.label(&stop), self.timeout).await {
            debug!("Stop of {} failed: {}", name, e);
        }
        self.ctl_checked(&["start", name]).await?;
        info!("Started {} after failed restart", name);
        Ok(())
    }

    async fn pid(&self, name: &str) -> Result<Option<u32>, DeployerError> {
        let args = ["pid", name];
        let output = run(self.ctl(&args), &self.label(&args), self.timeout).await?;
        Ok(parse_pid(&output.stdout))
    }
}

fn parse_pid(output: &str) -> Option<u32> {
    output.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}
