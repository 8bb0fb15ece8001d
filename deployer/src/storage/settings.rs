//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::DeployerError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::storage::layout::DeployLayout;

/// Deployer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Directory for rolling log files; stdout only when absent
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Emit JSON log lines
    #[serde(default)]
    pub json_logs: bool,

    /// SQLite database holding projects and deployments
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Root of the git working copies
    #[serde(default = "default_repos_root")]
    pub repos_root: PathBuf,

    /// Root of the per-project application trees
    #[serde(default = "default_apps_root")]
    pub apps_root: PathBuf,

    #[serde(default)]
    pub supervisor: SupervisorSettings,

    #[serde(default)]
    pub proxy: ProxySettings,

    #[serde(default)]
    pub executor: ExecutorSettings,

    #[serde(default)]
    pub reaper: ReaperSettings,

    #[serde(default)]
    pub monitor: MonitorSettings,

    #[serde(default)]
    pub secrets: SecretSettings,
}

fn default_true() -> bool {
    true
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/deployer/deployer.db")
}

fn default_repos_root() -> PathBuf {
    PathBuf::from("/srv/deployments/repos")
}

fn default_apps_root() -> PathBuf {
    PathBuf::from("/srv/deployments/apps")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: None,
            json_logs: false,
            database_path: default_database_path(),
            repos_root: default_repos_root(),
            apps_root: default_apps_root(),
            supervisor: SupervisorSettings::default(),
            proxy: ProxySettings::default(),
            executor: ExecutorSettings::default(),
            reaper: ReaperSettings::default(),
            monitor: MonitorSettings::default(),
            secrets: SecretSettings::default(),
        }
    }
}

impl Settings {
    /// Read settings from `file`, falling back to defaults when it is missing
    pub async fn load(file: &File) -> Result<Settings, DeployerError> {
        if !file.exists().await {
            warn!(
                "Settings file {} not found, using defaults",
                file.path().display()
            );
            return Ok(Settings::default());
        }
        file.read_json::<Settings>().await
    }

    pub fn layout(&self) -> DeployLayout {
        DeployLayout::new(self.repos_root.clone(), self.apps_root.clone())
    }
}

/// Process supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Directory holding one program file per service
    #[serde(default = "default_supervisor_config_dir")]
    pub config_dir: PathBuf,

    /// Control command
    #[serde(default = "default_supervisorctl")]
    pub ctl_command: String,

    /// User the services run as
    #[serde(default = "default_run_as_user")]
    pub run_as_user: String,

    /// Timeout of each control command in seconds
    #[serde(default = "default_supervisor_timeout")]
    pub timeout_secs: u64,
}

fn default_supervisor_config_dir() -> PathBuf {
    PathBuf::from("/etc/supervisor/conf.d")
}

fn default_supervisorctl() -> String {
    "supervisorctl".to_string()
}

fn default_run_as_user() -> String {
    "www-data".to_string()
}

fn default_supervisor_timeout() -> u64 {
    60
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            config_dir: default_supervisor_config_dir(),
            ctl_command: default_supervisorctl(),
            run_as_user: default_run_as_user(),
            timeout_secs: default_supervisor_timeout(),
        }
    }
}

/// Reverse proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Directory holding one server file per environment
    #[serde(default = "default_proxy_config_dir")]
    pub config_dir: PathBuf,

    /// Proxy binary
    #[serde(default = "default_proxy_binary")]
    pub binary: String,

    /// Run proxy commands through sudo
    #[serde(default = "default_true")]
    pub use_sudo: bool,

    /// Directory of TLS certificates
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,

    /// Directory of TLS private keys
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,

    /// Timeout of each proxy command in seconds
    #[serde(default = "default_proxy_timeout")]
    pub timeout_secs: u64,
}

fn default_proxy_config_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-enabled")
}

fn default_proxy_binary() -> String {
    "nginx".to_string()
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("/etc/ssl/certs")
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("/etc/ssl/private")
}

fn default_proxy_timeout() -> u64 {
    30
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            config_dir: default_proxy_config_dir(),
            binary: default_proxy_binary(),
            use_sudo: true,
            cert_dir: default_cert_dir(),
            key_dir: default_key_dir(),
            timeout_secs: default_proxy_timeout(),
        }
    }
}

/// Pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Timeout of clone and fetch in seconds
    #[serde(default = "default_git_timeout")]
    pub git_timeout_secs: u64,

    /// Timeout of runtime creation and dependency install in seconds
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,

    /// Timeout of each lifecycle hook in seconds
    #[serde(default = "default_hook_timeout")]
    pub hook_timeout_secs: u64,

    /// Timeout of each health probe in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Number of release directories kept per environment
    #[serde(default = "default_keep_releases")]
    pub keep_releases: usize,

    /// Interpreter version used when the deploy config names none
    #[serde(default = "default_runtime_version")]
    pub default_runtime_version: String,

    /// Dependency manifest used when the deploy config names none
    #[serde(default = "default_manifest")]
    pub default_manifest: String,
}

fn default_git_timeout() -> u64 {
    600
}

fn default_install_timeout() -> u64 {
    600
}

fn default_hook_timeout() -> u64 {
    300
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_keep_releases() -> usize {
    5
}

fn default_runtime_version() -> String {
    "3.11".to_string()
}

fn default_manifest() -> String {
    "requirements.txt".to_string()
}

impl ExecutorSettings {
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            git_timeout_secs: default_git_timeout(),
            install_timeout_secs: default_install_timeout(),
            hook_timeout_secs: default_hook_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            keep_releases: default_keep_releases(),
            default_runtime_version: default_runtime_version(),
            default_manifest: default_manifest(),
        }
    }
}

/// Stuck-deployment reaper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sweep interval in seconds
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,

    /// Age after which a non-terminal deployment is considered stuck
    #[serde(default = "default_stuck_after")]
    pub stuck_after_secs: u64,
}

fn default_reaper_interval() -> u64 {
    300
}

fn default_stuck_after() -> u64 {
    1800
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reaper_interval(),
            stuck_after_secs: default_stuck_after(),
        }
    }
}

/// Periodic health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Probe interval in seconds
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
}

fn default_monitor_interval() -> u64 {
    300
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_monitor_interval(),
        }
    }
}

/// Where the secret-store key comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretSettings {
    /// Environment variable holding the key material
    #[serde(default = "default_key_env")]
    pub key_env: String,

    /// File holding the key material, read when the variable is unset
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

fn default_key_env() -> String {
    "DEPLOYER_ENCRYPTION_KEY".to_string()
}

impl Default for SecretSettings {
    fn default() -> Self {
        Self {
            key_env: default_key_env(),
            key_file: None,
        }
    }
}
