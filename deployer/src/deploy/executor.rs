//! Deployment executor.
//!
//! Drives one deployment through its stages, persisting and logging every
//! status change before the stage's work starts. A failed deployment is
//! marked failed first and then recovery is attempted separately, so a
//! recovery problem never hides the original error.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use futures::future::join_all;
use secrecy::SecretString;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::deploy::config::{self, DeployConfig};
use crate::deploy::env::{self, EnvMap, Placeholders};
use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm};
use crate::deploy::git::SourceControl;
use crate::deploy::health::HealthProber;
use crate::deploy::hooks::{self, HookContext};
use crate::deploy::proxy::{ReverseProxy, SiteConfig};
use crate::deploy::release;
use crate::deploy::runtime::{bin_dir, RuntimeManager, RuntimeSetup};
use crate::deploy::supervisor::{ProcessSupervisor, ProgramConfig};
use crate::errors::DeployerError;
use crate::filesys::dir::Dir;
use crate::models::deployment::{Deployment, DeploymentStatus, NewDeployment};
use crate::models::log::Severity;
use crate::models::project::{Environment, EnvironmentName, Project};
use crate::models::service::{HealthCheck, ProbeResult, Service, ServiceStatus};
use crate::secrets::SecretStore;
use crate::storage::layout::DeployLayout;
use crate::storage::settings::ExecutorSettings;
use crate::store::{ServiceScope, Store};
use crate::telemetry;
use crate::utils::{release_version, rollback_version, tail};

/// Characters of hook output copied into the deployment log
const HOOK_OUTPUT_LOG: usize = 500;

/// Initiator recorded on automatic recovery records
pub const RECOVERY_INITIATOR: &str = "auto-recovery";

/// External systems the executor drives
#[derive(Clone)]
pub struct Adapters {
    pub source: Arc<dyn SourceControl>,
    pub runtime: Arc<dyn RuntimeManager>,
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub proxy: Arc<dyn ReverseProxy>,
    pub prober: Arc<dyn HealthProber>,
}

/// Filesystem and pipeline settings of an executor
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub layout: DeployLayout,
    pub settings: ExecutorSettings,
    /// User the supervised services run as
    pub run_as_user: String,
}

/// A resolved project/environment pair
#[derive(Debug, Clone)]
pub struct Target {
    pub project: Project,
    pub environment: Environment,
}

impl Target {
    pub fn env_name(&self) -> &'static str {
        self.environment.name.as_str()
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.project.name, self.environment.name)
    }
}

/// State carried between the stages of one deploy
struct DeployRun {
    deployment_id: i64,
    version: String,
    fsm: DeploymentFsm,
}

pub struct DeploymentExecutor {
    store: Store,
    secrets: Arc<SecretStore>,
    adapters: Adapters,
    options: ExecutorOptions,
}

impl DeploymentExecutor {
    pub fn new(
        store: Store,
        secrets: Arc<SecretStore>,
        adapters: Adapters,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            store,
            secrets,
            adapters,
            options,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn layout(&self) -> &DeployLayout {
        &self.options.layout
    }

    /// Look up an active project and one of its active environments
    pub async fn resolve(&self, project: &str, environment: &str) -> Result<Target, DeployerError> {
        let env_name: EnvironmentName = environment
            .parse()
            .map_err(|_| DeployerError::NotFound(format!("environment {}", environment)))?;

        let project = self
            .store
            .find_project(project)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| DeployerError::NotFound(format!("project {}", project)))?;

        let environment = self
            .store
            .find_environment(project.id, env_name)
            .await?
            .filter(|e| e.is_active)
            .ok_or_else(|| {
                DeployerError::NotFound(format!("environment {}/{}", project.name, env_name))
            })?;

        Ok(Target {
            project,
            environment,
        })
    }

    // ---- deploy -----------------------------------------------------------

    /// Deploy `commit` (or the tip of the project's branch) to an environment.
    ///
    /// Returns the activated deployment. On failure the deployment is left
    /// `failed`, recovery to the last good release is attempted, and the
    /// original error is returned.
    pub async fn deploy(
        &self,
        project: &str,
        environment: &str,
        commit: Option<&str>,
        initiator: &str,
    ) -> Result<Deployment, DeployerError> {
        let target = self.resolve(project, environment).await?;
        let admitted = self
            .store
            .admit_deployment(NewDeployment::pending(
                target.environment.id,
                release_version(Local::now()),
                initiator,
            ))
            .await?;

        info!(
            "Deployment #{} ({}) of {} admitted",
            admitted.id,
            admitted.version,
            target.label()
        );
        self.log(
            admitted.id,
            Severity::Info,
            &format!("Starting deployment {} initiated by {}", admitted.version, initiator),
        )
        .await;

        let mut run = DeployRun {
            deployment_id: admitted.id,
            version: admitted.version.clone(),
            fsm: DeploymentFsm::at(admitted.status),
        };

        match self.run_pipeline(&target, &mut run, commit).await {
            Ok(()) => {
                let activated = self.finish(&target, &mut run).await;
                match activated {
                    Ok(deployment) => Ok(deployment),
                    Err(err) => Err(self.handle_failure(&target, &mut run, err).await),
                }
            }
            Err(err) => Err(self.handle_failure(&target, &mut run, err).await),
        }
    }

    async fn run_pipeline(
        &self,
        target: &Target,
        run: &mut DeployRun,
        commit: Option<&str>,
    ) -> Result<(), DeployerError> {
        let project = &target.project;
        let env_name = target.env_name();
        let layout = self.layout().clone();

        // cloning
        self.advance(run, DeploymentEvent::Clone, "Fetching source")
            .await?;
        let repo = layout.repo_dir(&project.name);
        self.checkout_source(project, &repo, run, commit).await?;

        // building
        self.advance(run, DeploymentEvent::Build, "Loading deployment configuration")
            .await?;
        let loaded = config::load(repo.path(), env_name).await?;
        self.log(
            run.deployment_id,
            Severity::Info,
            &format!("Loaded configuration from {}", loaded.file_name),
        )
        .await;
        self.store
            .save_environment_config(target.environment.id, &loaded.raw)
            .await?;
        let config = loaded.config;
        let specs = config.service_specs()?;

        let release_dir = layout.release_dir(&project.name, env_name, &run.version);
        self.log(
            run.deployment_id,
            Severity::Info,
            &format!("Creating release directory {}", release_dir.path().display()),
        )
        .await;
        release::materialize(&repo, &release_dir).await?;
        self.store
            .set_release_path(run.deployment_id, &release_dir.path().display().to_string())
            .await?;

        let runtime = layout.runtime_dir(&project.name, env_name);
        self.prepare_runtime(run, &config, runtime.path(), release_dir.path())
            .await?;

        let secrets = self
            .secrets
            .open_map(target.environment.secrets.as_deref())?;
        let env_vars = env::assemble(
            &project.name,
            env_name,
            &run.version,
            &config.env_vars,
            &secrets,
        );
        self.log(
            run.deployment_id,
            Severity::Info,
            &format!("Prepared {} environment variables", env_vars.len()),
        )
        .await;

        // deploying
        self.advance(run, DeploymentEvent::Deploy, "Deploying release")
            .await?;
        let hook_ctx = HookContext {
            release: release_dir.path(),
            runtime: runtime.path(),
            env: &env_vars,
            placeholders: Placeholders {
                project: &project.name,
                environment: env_name,
                port: None,
            },
            timeout: self.options.settings.hook_timeout(),
        };
        self.run_hooks(run.deployment_id, &hook_ctx, &config.hooks.pre_deploy, "pre-deploy")
            .await?;

        let services = self
            .store
            .reconcile_services(
                ServiceScope {
                    environment_id: target.environment.id,
                    project: &project.name,
                    environment: env_name,
                    start_port: project.start_port,
                },
                &specs,
            )
            .await?;
        self.write_programs(target, run.deployment_id, &services, release_dir.path(), runtime.path(), &env_vars)
            .await?;
        self.write_site(target, run.deployment_id).await?;

        let current = layout.current_link(&project.name, env_name);
        release::switch(release_dir.path(), &current).await?;
        self.log(
            run.deployment_id,
            Severity::Info,
            &format!("Switched current release to {}", run.version),
        )
        .await;

        self.reload_services(target, run.deployment_id).await?;

        // testing
        self.advance(run, DeploymentEvent::Test, "Running health checks")
            .await?;
        self.gate_on_health(target, run.deployment_id).await?;
        self.run_hooks(run.deployment_id, &hook_ctx, &config.hooks.post_deploy, "post-deploy")
            .await?;

        self.prune_releases(target, run.deployment_id, release_dir.path())
            .await?;
        Ok(())
    }

    async fn checkout_source(
        &self,
        project: &Project,
        repo: &Dir,
        run: &DeployRun,
        commit: Option<&str>,
    ) -> Result<(), DeployerError> {
        let deploy_key: Option<SecretString> = project
            .deploy_key
            .as_deref()
            .map(|sealed| self.secrets.open(sealed))
            .transpose()?;
        let source = &self.adapters.source;

        if repo.subdir(".git").exists().await {
            self.log(run.deployment_id, Severity::Info, "Fetching latest changes")
                .await;
            source.fetch(repo.path(), deploy_key.as_ref()).await?;
        } else {
            self.log(
                run.deployment_id,
                Severity::Info,
                &format!("Cloning {}", project.repo_url),
            )
            .await;
            source
                .clone_repo(&project.repo_url, repo.path(), deploy_key.as_ref())
                .await?;
        }

        let sha = match commit {
            Some(commit) => commit.to_string(),
            None => source.branch_tip(repo.path(), &project.branch).await?,
        };
        source.checkout(repo.path(), &sha).await?;
        let info = source.commit_info(repo.path(), &sha).await?;
        self.store
            .set_deployment_commit(run.deployment_id, &info)
            .await?;

        let short: String = info.sha.chars().take(8).collect();
        self.log_with(
            run.deployment_id,
            Severity::Info,
            &format!("Checked out commit {}", short),
            Some(json!({
                "sha": info.sha,
                "author": info.author,
                "message": info.message,
            })),
        )
        .await;
        Ok(())
    }

    async fn prepare_runtime(
        &self,
        run: &DeployRun,
        config: &DeployConfig,
        runtime: &Path,
        release_dir: &Path,
    ) -> Result<(), DeployerError> {
        let settings = &self.options.settings;
        let version = config
            .python_version
            .as_deref()
            .unwrap_or(&settings.default_runtime_version);

        match self.adapters.runtime.ensure(runtime, version).await? {
            RuntimeSetup::Existing => {
                self.log(run.deployment_id, Severity::Info, "Using existing runtime")
                    .await;
            }
            RuntimeSetup::Created { interpreter } => {
                self.log(
                    run.deployment_id,
                    Severity::Info,
                    &format!("Created runtime with {}", interpreter),
                )
                .await;
            }
        }

        let manifest_name = config
            .requirements
            .as_deref()
            .unwrap_or(&settings.default_manifest);
        let manifest = release_dir.join(manifest_name);
        if tokio::fs::try_exists(&manifest).await.unwrap_or(false) {
            self.log(
                run.deployment_id,
                Severity::Info,
                &format!("Installing dependencies from {}", manifest_name),
            )
            .await;
            self.adapters.runtime.install(runtime, &manifest).await?;
        } else {
            self.log(
                run.deployment_id,
                Severity::Warning,
                &format!("Requirements file {} not found, skipping install", manifest_name),
            )
            .await;
        }
        Ok(())
    }

    async fn run_hooks(
        &self,
        deployment_id: i64,
        ctx: &HookContext<'_>,
        commands: &[String],
        phase: &str,
    ) -> Result<(), DeployerError> {
        if commands.is_empty() {
            return Ok(());
        }
        self.log(
            deployment_id,
            Severity::Info,
            &format!("Running {} {} hooks", commands.len(), phase),
        )
        .await;

        for command in commands {
            self.log(deployment_id, Severity::Info, &format!("Running hook: {}", command))
                .await;
            let (_, stdout) = hooks::run_hook(ctx, command).await?;
            self.log(deployment_id, Severity::Info, "Hook completed successfully")
                .await;
            if !stdout.trim().is_empty() {
                let head: String = stdout.chars().take(HOOK_OUTPUT_LOG).collect();
                self.log(deployment_id, Severity::Debug, &format!("Hook output: {}", head))
                    .await;
            }
        }
        Ok(())
    }

    /// Write one supervisor program per reconciled service and have the
    /// supervisor pick them up. Programs run from the `current` link so a
    /// switch plus restart moves them to another release.
    async fn write_programs(
        &self,
        target: &Target,
        deployment_id: i64,
        services: &[Service],
        release_dir: &Path,
        runtime: &Path,
        env_vars: &EnvMap,
    ) -> Result<(), DeployerError> {
        if services.is_empty() {
            self.log(deployment_id, Severity::Warning, "No enabled services declared")
                .await;
            return Ok(());
        }
        let layout = self.layout();
        let project = &target.project.name;
        let env_name = target.env_name();
        let has_src = Dir::new(release_dir.join("src")).exists().await;
        let directory = hooks::release_workdir(&layout.current_link(project, env_name), has_src);

        for service in services {
            let placeholders = Placeholders {
                project,
                environment: env_name,
                port: service.port,
            };
            let command =
                env::rewrite_executables(&placeholders.apply(&service.command), &bin_dir(runtime));
            let mut environment = env_vars.clone();
            if let Some(port) = service.port {
                environment.insert("PORT".to_string(), port.to_string());
            }

            let program = ProgramConfig {
                name: service.supervisor_name.clone(),
                command,
                directory: directory.clone(),
                user: self.options.run_as_user.clone(),
                environment,
                stdout_log: layout
                    .stdout_log(project, env_name, &service.name)
                    .path()
                    .to_path_buf(),
                stderr_log: layout
                    .stderr_log(project, env_name, &service.name)
                    .path()
                    .to_path_buf(),
            };
            self.adapters.supervisor.write_config(&program).await?;
        }

        self.adapters.supervisor.reload_config().await?;
        self.log(
            deployment_id,
            Severity::Info,
            &format!("Updated {} supervisor configurations", services.len()),
        )
        .await;
        Ok(())
    }

    /// Enabled web services of an environment that have a port
    async fn web_services(&self, environment_id: i64) -> Result<Vec<Service>, DeployerError> {
        Ok(self
            .store
            .list_services(environment_id)
            .await?
            .into_iter()
            .filter(|s| s.enabled && s.service_type.is_web() && s.port.is_some())
            .collect())
    }

    async fn write_site(&self, target: &Target, deployment_id: i64) -> Result<(), DeployerError> {
        let web = self.web_services(target.environment.id).await?;
        if web.is_empty() {
            debug!("No web services in {}, proxy untouched", target.label());
            return Ok(());
        }
        let layout = self.layout();
        let site = SiteConfig {
            project: target.project.name.clone(),
            environment: target.env_name().to_string(),
            ports: web.iter().filter_map(|s| s.port).collect(),
            domain: target.environment.domain.clone(),
            ssl_enabled: target.environment.ssl_enabled,
            static_root: layout.static_dir(&target.project.name, target.env_name()),
            media_root: layout.media_dir(&target.project.name).path().to_path_buf(),
        };
        let path = self.adapters.proxy.write_config(&site).await?;
        self.log(
            deployment_id,
            Severity::Info,
            &format!("Proxy configuration written to {}", path.display()),
        )
        .await;
        Ok(())
    }

    /// Restart every enabled service of the environment. A service that
    /// fails to restart is marked failed and logged; it does not abort the
    /// caller. The proxy is reloaded when web services exist.
    async fn reload_services(&self, target: &Target, deployment_id: i64) -> Result<(), DeployerError> {
        let services = self.store.list_services(target.environment.id).await?;
        let supervisor = &self.adapters.supervisor;

        for service in services.iter().filter(|s| s.enabled) {
            match supervisor.restart(&service.supervisor_name).await {
                Ok(()) => {
                    let pid = supervisor
                        .pid(&service.supervisor_name)
                        .await
                        .unwrap_or_else(|e| {
                            warn!("Could not read pid of {}: {}", service.supervisor_name, e);
                            None
                        });
                    let sample = match pid {
                        Some(pid) => telemetry::sample_process(pid).await,
                        None => None,
                    };
                    self.store
                        .record_restart(
                            service.id,
                            pid,
                            sample.map(|s| s.memory_mb),
                            sample.map(|s| s.cpu_percent),
                        )
                        .await?;
                    self.log(
                        deployment_id,
                        Severity::Info,
                        &format!("Restarted service {}", service.name),
                    )
                    .await;
                }
                Err(e) => {
                    self.store
                        .set_service_status(service.id, ServiceStatus::Failed)
                        .await?;
                    self.log(
                        deployment_id,
                        Severity::Error,
                        &format!("Failed to restart service {}: {}", service.name, e),
                    )
                    .await;
                }
            }
        }

        if services.iter().any(|s| s.enabled && s.service_type.is_web()) {
            match self.adapters.proxy.reload().await {
                Ok(()) => self.log(deployment_id, Severity::Info, "Proxy reloaded").await,
                Err(e) => {
                    self.log(
                        deployment_id,
                        Severity::Error,
                        &format!("Failed to reload proxy: {}", e),
                    )
                    .await
                }
            }
        }
        Ok(())
    }

    /// Probe all probe-able services concurrently and record every result
    async fn probe_services(
        &self,
        services: &[Service],
    ) -> Result<Vec<(Service, HealthCheck)>, DeployerError> {
        let targets: Vec<(&Service, u16, &str)> = services
            .iter()
            .filter_map(|s| s.probe_target().map(|(port, endpoint)| (s, port, endpoint)))
            .collect();

        let prober = &self.adapters.prober;
        let results: Vec<ProbeResult> = join_all(
            targets
                .iter()
                .map(|(_, port, endpoint)| prober.probe(*port, endpoint)),
        )
        .await;

        let mut checks = Vec::with_capacity(results.len());
        for ((service, _, _), result) in targets.into_iter().zip(results) {
            let check = self.store.record_health_check(service.id, &result).await?;
            checks.push((service.clone(), check));
        }
        Ok(checks)
    }

    async fn gate_on_health(&self, target: &Target, deployment_id: i64) -> Result<(), DeployerError> {
        let services = self.store.list_services(target.environment.id).await?;
        let checks = self.probe_services(&services).await?;
        if checks.is_empty() {
            self.log(deployment_id, Severity::Info, "No health checks configured")
                .await;
            return Ok(());
        }

        let failing: Vec<String> = checks
            .iter()
            .filter(|(_, check)| !check.is_healthy)
            .map(|(service, check)| {
                format!(
                    "{}: {}",
                    service.name,
                    check.error_message.as_deref().unwrap_or("unhealthy")
                )
            })
            .collect();

        if !failing.is_empty() {
            return Err(DeployerError::HealthCheckFailure(failing.join("; ")));
        }
        self.log(
            deployment_id,
            Severity::Info,
            &format!("{} health checks passed", checks.len()),
        )
        .await;
        Ok(())
    }

    async fn prune_releases(
        &self,
        target: &Target,
        deployment_id: i64,
        keep_release: &Path,
    ) -> Result<(), DeployerError> {
        let layout = self.layout();
        let project = &target.project.name;
        let env_name = target.env_name();
        let report = release::prune(
            &layout.releases_dir(project, env_name),
            &layout.current_link(project, env_name),
            self.options.settings.keep_releases,
            &[keep_release],
        )
        .await;

        match report {
            Ok(report) => {
                for (path, err) in &report.failed {
                    self.log(
                        deployment_id,
                        Severity::Warning,
                        &format!("Failed to remove release {}: {}", path.display(), err),
                    )
                    .await;
                }
                if !report.removed.is_empty() {
                    self.log(
                        deployment_id,
                        Severity::Info,
                        &format!("Removed {} old releases", report.removed.len()),
                    )
                    .await;
                }
            }
            Err(e) => {
                self.log(
                    deployment_id,
                    Severity::Warning,
                    &format!("Failed to prune releases: {}", e),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn finish(&self, target: &Target, run: &mut DeployRun) -> Result<Deployment, DeployerError> {
        run.fsm
            .process(DeploymentEvent::Activate)
            .map_err(DeployerError::InvalidTransition)?;
        let deployment = self.store.activate_deployment(run.deployment_id).await?;
        self.log(
            run.deployment_id,
            Severity::Info,
            "Deployment completed successfully",
        )
        .await;
        info!("Deployment {} of {} is active", deployment.version, target.label());
        Ok(deployment)
    }

    /// Validate and persist a stage transition, then log it
    async fn advance(
        &self,
        run: &mut DeployRun,
        event: DeploymentEvent,
        message: &str,
    ) -> Result<(), DeployerError> {
        run.fsm
            .process(event)
            .map_err(DeployerError::InvalidTransition)?;
        self.store
            .set_deployment_status(run.deployment_id, run.fsm.state())
            .await?;
        self.log(
            run.deployment_id,
            Severity::Info,
            &format!("[{}] {}", run.fsm.state(), message),
        )
        .await;
        Ok(())
    }

    /// Mark the run failed and attempt recovery. Returns the original error.
    async fn handle_failure(
        &self,
        target: &Target,
        run: &mut DeployRun,
        err: DeployerError,
    ) -> DeployerError {
        let message = err.to_string();
        error!("Deployment #{} of {} failed: {}", run.deployment_id, target.label(), message);

        if let Err(e) = run.fsm.process(DeploymentEvent::Fail(message.clone())) {
            warn!("Deployment #{}: {}", run.deployment_id, e);
        }
        if let Err(e) = self.store.fail_deployment(run.deployment_id, &message).await {
            error!("Could not mark deployment #{} failed: {}", run.deployment_id, e);
        }
        self.log(
            run.deployment_id,
            Severity::Error,
            &format!("Deployment failed: {}", message),
        )
        .await;

        match self.recover(target, run.deployment_id).await {
            Ok(Some(record)) => {
                self.log(
                    run.deployment_id,
                    Severity::Info,
                    &format!("Recovered with rollback record {}", record.version),
                )
                .await;
            }
            Ok(None) => {
                self.log(
                    run.deployment_id,
                    Severity::Warning,
                    "No previous release to recover to",
                )
                .await;
            }
            Err(e) => {
                self.log(
                    run.deployment_id,
                    Severity::Error,
                    &format!("Automatic rollback failed: {}", e),
                )
                .await;
            }
        }
        err
    }

    // ---- rollback ---------------------------------------------------------

    /// Bring an environment back to its last good release after the failed
    /// deployment `failed_id`.
    ///
    /// The target is the environment's active deployment when there is one,
    /// since the failed run may already have switched the link and restarted
    /// services; otherwise the newest rollback candidate. `Ok(None)` means
    /// there was nothing to recover to.
    pub async fn recover(
        &self,
        target: &Target,
        failed_id: i64,
    ) -> Result<Option<Deployment>, DeployerError> {
        let active = self.store.active_deployment(target.environment.id).await?;
        let previous_active = active.as_ref().map(|d| d.id);
        let to = match active {
            Some(active) => Some(active),
            None => self.rollback_target(target).await?,
        };
        let Some(to) = to else {
            return Ok(None);
        };

        info!(
            "Recovering {} to {} after deployment #{}",
            target.label(),
            to.version,
            failed_id
        );
        self.restore(target, &to, previous_active, failed_id, RECOVERY_INITIATOR)
            .await
            .map(Some)
    }

    /// Roll an environment back to its previous release
    pub async fn rollback(
        &self,
        project: &str,
        environment: &str,
        initiator: &str,
    ) -> Result<Deployment, DeployerError> {
        let target = self.resolve(project, environment).await?;
        let current = self
            .store
            .active_deployment(target.environment.id)
            .await?
            .ok_or_else(|| DeployerError::NoActiveDeployment(target.label()))?;
        let to = self
            .rollback_target(&target)
            .await?
            .ok_or_else(|| DeployerError::NothingToRollBack(target.label()))?;

        info!(
            "Rolling back {} from {} to {}",
            target.label(),
            current.version,
            to.version
        );
        self.restore(&target, &to, Some(current.id), current.id, initiator)
            .await
    }

    /// Newest inactive, non-rollback deployment whose release still exists
    async fn rollback_target(&self, target: &Target) -> Result<Option<Deployment>, DeployerError> {
        for candidate in self.store.rollback_candidates(target.environment.id).await? {
            let Some(path) = candidate.release_path.as_deref() else {
                continue;
            };
            if Dir::new(path).exists().await {
                return Ok(Some(candidate));
            }
            debug!("Skipping {}: release {} is gone", candidate.version, path);
        }
        Ok(None)
    }

    /// Shared body of rollback and recovery: record, re-point, reload, settle
    async fn restore(
        &self,
        target: &Target,
        to: &Deployment,
        previous_active: Option<i64>,
        rollback_from: i64,
        initiator: &str,
    ) -> Result<Deployment, DeployerError> {
        let release_path = to
            .release_path
            .clone()
            .ok_or_else(|| DeployerError::NothingToRollBack(target.label()))?;

        let record = self
            .store
            .admit_deployment(NewDeployment {
                environment_id: target.environment.id,
                version: rollback_version(Local::now()),
                status: DeploymentStatus::Deploying,
                initiated_by: initiator.to_string(),
                rollback_from: Some(rollback_from),
                commit_sha: to.commit_sha.clone(),
                commit_message: to.commit_message.clone(),
                commit_author: to.commit_author.clone(),
                commit_date: to.commit_date,
                release_path: Some(release_path.clone()),
            })
            .await?;
        self.log(
            record.id,
            Severity::Info,
            &format!("Rolling back to {}", to.version),
        )
        .await;

        match self
            .restore_release(target, record.id, to, previous_active, &release_path)
            .await
        {
            Ok(settled) => Ok(settled),
            Err(err) => {
                let message = err.to_string();
                if let Err(e) = self.store.fail_deployment(record.id, &message).await {
                    error!("Could not mark rollback #{} failed: {}", record.id, e);
                }
                self.log(
                    record.id,
                    Severity::Error,
                    &format!("Rollback failed: {}", message),
                )
                .await;
                Err(err)
            }
        }
    }

    async fn restore_release(
        &self,
        target: &Target,
        record_id: i64,
        to: &Deployment,
        previous_active: Option<i64>,
        release_path: &str,
    ) -> Result<Deployment, DeployerError> {
        // Validate every status change before touching anything.
        let mut record_fsm = DeploymentFsm::at(DeploymentStatus::Deploying);
        record_fsm
            .process(DeploymentEvent::Settle)
            .map_err(DeployerError::InvalidTransition)?;
        if to.status != DeploymentStatus::Active {
            DeploymentFsm::at(to.status)
                .process(DeploymentEvent::Restore)
                .map_err(DeployerError::InvalidTransition)?;
        }

        let current = self
            .layout()
            .current_link(&target.project.name, target.env_name());
        release::switch(Path::new(release_path), &current).await?;
        self.log(
            record_id,
            Severity::Info,
            &format!("Switched current release to {}", to.version),
        )
        .await;

        self.reload_services(target, record_id).await?;

        let record = self
            .store
            .complete_rollback(record_id, previous_active, to.id)
            .await?;
        self.log(
            record_id,
            Severity::Info,
            &format!("Rollback to {} completed", to.version),
        )
        .await;
        Ok(record)
    }

    // ---- maintenance ------------------------------------------------------

    /// Probe the web services of an environment and record the results.
    /// Deployment state is not touched.
    pub async fn check_health(
        &self,
        project: &str,
        environment: &str,
    ) -> Result<Vec<(Service, HealthCheck)>, DeployerError> {
        let target = self.resolve(project, environment).await?;
        let services = self.store.list_services(target.environment.id).await?;
        let checks = self.probe_services(&services).await?;
        for (service, check) in checks.iter().filter(|(_, c)| !c.is_healthy) {
            warn!(
                "{} service {} unhealthy: {}",
                target.label(),
                service.name,
                check.error_message.as_deref().unwrap_or("unknown")
            );
        }
        Ok(checks)
    }

    /// Fail every deployment that has been in flight longer than `max_age`
    pub async fn reap_stuck(&self, max_age: Duration) -> Result<Vec<Deployment>, DeployerError> {
        let age = chrono::Duration::from_std(max_age)
            .map_err(|e| DeployerError::Internal(e.to_string()))?;
        let stuck = self.store.stuck_deployments(Utc::now() - age).await?;
        let message = format!("Deployment timed out after {} minutes", max_age.as_secs() / 60);

        let mut reaped = Vec::with_capacity(stuck.len());
        for deployment in stuck {
            match self.store.fail_deployment(deployment.id, &message).await {
                Ok(()) => {}
                Err(DeployerError::Conflict(reason)) => {
                    debug!("Not reaping #{}: {}", deployment.id, reason);
                    continue;
                }
                Err(e) => return Err(e),
            }
            warn!(
                "Reaped deployment #{} ({}) stuck in {}",
                deployment.id, deployment.version, deployment.status
            );
            self.log(deployment.id, Severity::Error, &message).await;
            reaped.push(self.store.get_deployment(deployment.id).await?);
        }
        Ok(reaped)
    }

    /// Mark the in-flight deployment of an environment failed by hand
    pub async fn cleanup_in_flight(
        &self,
        project: &str,
        environment: &str,
    ) -> Result<Deployment, DeployerError> {
        let target = self.resolve(project, environment).await?;
        let deployment = self
            .store
            .in_flight_deployment(target.environment.id)
            .await?
            .ok_or_else(|| {
                DeployerError::NotFound(format!("deployment in progress for {}", target.label()))
            })?;

        const MESSAGE: &str = "Manually cleaned up";
        self.store.fail_deployment(deployment.id, MESSAGE).await?;
        self.log(deployment.id, Severity::Warning, MESSAGE).await;
        self.store.get_deployment(deployment.id).await
    }

    // ---- log sink ---------------------------------------------------------

    async fn log(&self, deployment_id: i64, level: Severity, message: &str) {
        self.log_with(deployment_id, level, message, None).await
    }

    /// Append to the deployment's log stream and mirror it to tracing.
    /// A failing sink is reported but never fails the caller.
    async fn log_with(
        &self,
        deployment_id: i64,
        level: Severity,
        message: &str,
        details: Option<serde_json::Value>,
    ) {
        match level {
            Severity::Debug => debug!(deployment = deployment_id, "{}", message),
            Severity::Info => info!(deployment = deployment_id, "{}", message),
            Severity::Warning => warn!(deployment = deployment_id, "{}", message),
            Severity::Error => error!(deployment = deployment_id, "{}", message),
        }
        if let Err(e) = self
            .store
            .append_log(deployment_id, level, message, details.as_ref())
            .await
        {
            warn!(
                "Could not write log of deployment #{}: {}",
                deployment_id,
                tail(&e.to_string(), 200)
            );
        }
    }
}
