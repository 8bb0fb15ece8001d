//! Fake adapters and a harness around an in-memory executor

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use tempfile::TempDir;

use deployer::deploy::executor::{Adapters, DeploymentExecutor, ExecutorOptions};
use deployer::deploy::git::SourceControl;
use deployer::deploy::health::HealthProber;
use deployer::deploy::proxy::{ReverseProxy, SiteConfig};
use deployer::deploy::runtime::{RuntimeManager, RuntimeSetup};
use deployer::deploy::supervisor::{ProcessSupervisor, ProgramConfig};
use deployer::errors::DeployerError;
use deployer::models::deployment::{CommitInfo, Deployment, DeploymentStatus};
use deployer::models::project::{EnvironmentName, NewProject};
use deployer::models::service::ProbeResult;
use deployer::secrets::SecretStore;
use deployer::storage::layout::DeployLayout;
use deployer::storage::settings::ExecutorSettings;
use deployer::store::Store;

pub const PROJECT: &str = "shop";
pub const ENV: &str = "qa";

pub const CONFIG: &str = r#"
name: shop
env_vars:
  DJANGO_SETTINGS_MODULE: shop.settings
  DATABASE_URL: ${SECRET_DATABASE_URL}
hooks:
  pre_deploy:
    - echo $DEPLOYMENT_VERSION > pre_deploy.txt
  post_deploy:
    - echo done > post_deploy.txt
services:
  - name: web
    type: django
    command: gunicorn --bind 127.0.0.1:${PORT} shop.wsgi
    health_check: /health/
  - name: worker
    type: celery
    command: celery -A shop worker -Q ${QUEUE_NAME}
"#;

/// Working copy that "receives" whatever files the test puts in it
#[derive(Default)]
pub struct FakeSource {
    files: Mutex<BTreeMap<String, String>>,
    commits: AtomicU32,
    pub fail_clone: AtomicBool,
}

impl FakeSource {
    pub fn set_file(&self, name: &str, contents: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), contents.to_string());
    }

    pub fn remove_file(&self, name: &str) {
        self.files.lock().unwrap().remove(name);
    }

    fn sync(&self, dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir.join(".git"))?;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name() != ".git" && entry.path().is_file() {
                std::fs::remove_file(entry.path())?;
            }
        }
        for (name, contents) in self.files.lock().unwrap().iter() {
            std::fs::write(dir.join(name), contents)?;
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SourceControl for FakeSource {
    async fn clone_repo(
        &self,
        _url: &str,
        dir: &Path,
        _deploy_key: Option<&SecretString>,
    ) -> Result<(), DeployerError> {
        if self.fail_clone.load(Ordering::SeqCst) {
            return Err(DeployerError::command("git clone", "Repository not found"));
        }
        Ok(self.sync(dir)?)
    }

    async fn fetch(&self, dir: &Path, _deploy_key: Option<&SecretString>) -> Result<(), DeployerError> {
        Ok(self.sync(dir)?)
    }

    async fn checkout(&self, _dir: &Path, _reference: &str) -> Result<(), DeployerError> {
        Ok(())
    }

    async fn branch_tip(&self, _dir: &Path, _branch: &str) -> Result<String, DeployerError> {
        Ok(format!("{:040x}", self.commits.load(Ordering::SeqCst)))
    }

    async fn commit_info(&self, _dir: &Path, sha: &str) -> Result<CommitInfo, DeployerError> {
        Ok(CommitInfo {
            sha: sha.to_string(),
            message: "Update shop".to_string(),
            author: "Dev <dev@example.com>".to_string(),
            date: Utc::now(),
        })
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    pub installs: Mutex<Vec<PathBuf>>,
    /// When set, installs fail every in-flight deployment in this store,
    /// the way the reaper does when a build overruns
    pub reap_during_install: Mutex<Option<Store>>,
}

#[async_trait]
impl RuntimeManager for FakeRuntime {
    async fn ensure(&self, dir: &Path, version: &str) -> Result<RuntimeSetup, DeployerError> {
        let bin = dir.join("bin");
        if bin.is_dir() {
            return Ok(RuntimeSetup::Existing);
        }
        std::fs::create_dir_all(&bin)?;
        Ok(RuntimeSetup::Created {
            interpreter: format!("python{}", version),
        })
    }

    async fn install(&self, _dir: &Path, manifest: &Path) -> Result<(), DeployerError> {
        self.installs.lock().unwrap().push(manifest.to_path_buf());
        let reaper_store = self.reap_during_install.lock().unwrap().clone();
        if let Some(store) = reaper_store {
            let cutoff = Utc::now() + chrono::Duration::seconds(1);
            for stuck in store.stuck_deployments(cutoff).await? {
                store.fail_deployment(stuck.id, "Deployment timed out").await?;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSupervisor {
    pub programs: Mutex<BTreeMap<String, ProgramConfig>>,
    pub restarts: Mutex<Vec<String>>,
    pub config_reloads: AtomicU32,
    pub broken: Mutex<Vec<String>>,
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn write_config(&self, program: &ProgramConfig) -> Result<PathBuf, DeployerError> {
        self.programs
            .lock()
            .unwrap()
            .insert(program.name.clone(), program.clone());
        Ok(PathBuf::from(format!("/fake/{}.conf", program.name)))
    }

    async fn reload_config(&self) -> Result<(), DeployerError> {
        self.config_reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<(), DeployerError> {
        if self.broken.lock().unwrap().iter().any(|b| b == name) {
            return Err(DeployerError::command(
                format!("supervisorctl start {}", name),
                "ERROR (spawn error)",
            ));
        }
        self.restarts.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn pid(&self, _name: &str) -> Result<Option<u32>, DeployerError> {
        Ok(None)
    }
}

#[derive(Default)]
pub struct FakeProxy {
    pub sites: Mutex<Vec<SiteConfig>>,
    pub reloads: AtomicU32,
}

#[async_trait]
impl ReverseProxy for FakeProxy {
    async fn write_config(&self, site: &SiteConfig) -> Result<PathBuf, DeployerError> {
        self.sites.lock().unwrap().push(site.clone());
        Ok(PathBuf::from(format!("/fake/{}.conf", site.config_name())))
    }

    async fn reload(&self) -> Result<(), DeployerError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeProber {
    pub healthy: AtomicBool,
    pub probes: Mutex<Vec<(u16, String)>>,
}

impl Default for FakeProber {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            probes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl HealthProber for FakeProber {
    async fn probe(&self, port: u16, endpoint: &str) -> ProbeResult {
        self.probes
            .lock()
            .unwrap()
            .push((port, endpoint.to_string()));
        if self.healthy.load(Ordering::SeqCst) {
            ProbeResult {
                is_healthy: true,
                response_time: Some(0.01),
                error_message: None,
            }
        } else {
            ProbeResult {
                is_healthy: false,
                response_time: Some(0.01),
                error_message: Some("Status code: 500".to_string()),
            }
        }
    }
}

pub struct Harness {
    _root: TempDir,
    pub layout: DeployLayout,
    pub store: Store,
    pub secrets: Arc<SecretStore>,
    pub source: Arc<FakeSource>,
    pub runtime: Arc<FakeRuntime>,
    pub supervisor: Arc<FakeSupervisor>,
    pub proxy: Arc<FakeProxy>,
    pub prober: Arc<FakeProber>,
    pub executor: Arc<DeploymentExecutor>,
    pub environment_id: i64,
}

impl Harness {
    /// Project `shop` with a `qa` environment and a valid deploy config
    pub async fn new() -> Self {
        Self::with_settings(ExecutorSettings::default()).await
    }

    pub async fn with_settings(settings: ExecutorSettings) -> Self {
        let root = tempfile::tempdir().unwrap();
        let layout = DeployLayout::new(root.path().join("repos"), root.path().join("apps"));
        let store = Store::open_in_memory().unwrap();
        let secrets = Arc::new(
            SecretStore::from_material(&SecretString::from("test-key".to_string())).unwrap(),
        );

        let (_, envs) = store
            .create_project(
                NewProject {
                    name: PROJECT.to_string(),
                    repo_url: "git@example.com:org/shop.git".to_string(),
                    branch: "main".to_string(),
                    start_port: 8000,
                    deploy_key: None,
                    webhook_secret: "hook".to_string(),
                    description: String::new(),
                },
                &[EnvironmentName::Qa],
            )
            .await
            .unwrap();

        let source = Arc::new(FakeSource::default());
        source.set_file("deploy.yaml", CONFIG);
        source.set_file("requirements.txt", "django\n");
        let runtime = Arc::new(FakeRuntime::default());
        let supervisor = Arc::new(FakeSupervisor::default());
        let proxy = Arc::new(FakeProxy::default());
        let prober = Arc::new(FakeProber::default());

        let executor = Arc::new(DeploymentExecutor::new(
            store.clone(),
            secrets.clone(),
            Adapters {
                source: source.clone(),
                runtime: runtime.clone(),
                supervisor: supervisor.clone(),
                proxy: proxy.clone(),
                prober: prober.clone(),
            },
            ExecutorOptions {
                layout: layout.clone(),
                settings,
                run_as_user: "deploy".to_string(),
            },
        ));

        Self {
            _root: root,
            layout,
            store,
            secrets,
            source,
            runtime,
            supervisor,
            proxy,
            prober,
            executor,
            environment_id: envs[0].id,
        }
    }

    pub async fn deploy(&self) -> Result<Deployment, DeployerError> {
        self.executor.deploy(PROJECT, ENV, None, "tester").await
    }

    pub async fn rollback(&self) -> Result<Deployment, DeployerError> {
        self.executor.rollback(PROJECT, ENV, "tester").await
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.prober.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Every deployment of the environment, oldest first
    pub async fn deployments(&self) -> Vec<Deployment> {
        let mut all = self
            .store
            .list_deployments(self.environment_id, 100)
            .await
            .unwrap();
        all.reverse();
        all
    }

    pub async fn count_with(&self, status: DeploymentStatus) -> usize {
        self.deployments()
            .await
            .iter()
            .filter(|d| d.status == status)
            .count()
    }

    pub fn current_target(&self) -> Option<PathBuf> {
        std::fs::read_link(self.layout.current_link(PROJECT, ENV)).ok()
    }

    pub async fn log_messages(&self, deployment_id: i64) -> Vec<String> {
        self.store
            .list_logs(deployment_id)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.message)
            .collect()
    }
}
