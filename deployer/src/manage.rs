//! Operator commands on projects and environments

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::DeployerError;
use crate::models::deployment::Deployment;
use crate::models::log::DeploymentLog;
use crate::models::project::{Environment, EnvironmentName, NewProject, Project};
use crate::models::service::Service;
use crate::secrets::SecretStore;
use crate::store::Store;
use crate::utils::generate_secret;

/// Input of `register-project`
#[derive(Debug, Clone)]
pub struct Registration {
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub start_port: u16,
    /// Private key contents, sealed before storing
    pub deploy_key: Option<SecretString>,
    pub description: String,
    /// Requested environment names; unknown names are skipped
    pub environments: Vec<String>,
}

/// Keep the recognised environment names, in order and without repeats
pub fn parse_environments(names: &[String]) -> Vec<EnvironmentName> {
    let mut out = Vec::new();
    for name in names {
        match name.trim().parse::<EnvironmentName>() {
            Ok(env) if !out.contains(&env) => out.push(env),
            Ok(_) => {}
            Err(_) => warn!("Skipping unknown environment '{}' (expected qa, stage or prod)", name),
        }
    }
    out
}

pub async fn register_project(
    store: &Store,
    secrets: &SecretStore,
    registration: Registration,
) -> Result<(Project, Vec<Environment>), DeployerError> {
    let environments = parse_environments(&registration.environments);
    if environments.is_empty() {
        return Err(DeployerError::ConfigError(
            "No valid environments given (expected qa, stage or prod)".to_string(),
        ));
    }

    let deploy_key = registration
        .deploy_key
        .as_ref()
        .map(|key| secrets.seal(key.expose_secret()))
        .transpose()?;

    let (project, envs) = store
        .create_project(
            NewProject {
                name: registration.name,
                repo_url: registration.repo_url,
                branch: registration.branch,
                start_port: registration.start_port,
                deploy_key,
                webhook_secret: generate_secret(),
                description: registration.description,
            },
            &environments,
        )
        .await?;
    info!(
        "Registered project {} with {} environments",
        project.name,
        envs.len()
    );
    Ok((project, envs))
}

/// Soft-disable a project; its history is kept
pub async fn deregister_project(store: &Store, name: &str) -> Result<Project, DeployerError> {
    let project = find_project(store, name).await?;
    store.set_project_active(project.id, false).await?;
    info!("Deregistered project {}", project.name);
    store.get_project(project.id).await
}

async fn find_project(store: &Store, name: &str) -> Result<Project, DeployerError> {
    store
        .find_project(name)
        .await?
        .ok_or_else(|| DeployerError::NotFound(format!("project {}", name)))
}

async fn find_environment(
    store: &Store,
    project: &str,
    environment: &str,
) -> Result<(Project, Environment), DeployerError> {
    let project = find_project(store, project).await?;
    let name: EnvironmentName = environment
        .parse()
        .map_err(|_| DeployerError::NotFound(format!("environment {}", environment)))?;
    let env = store
        .find_environment(project.id, name)
        .await?
        .ok_or_else(|| DeployerError::NotFound(format!("environment {}/{}", project.name, name)))?;
    Ok((project, env))
}

pub async fn set_secret(
    store: &Store,
    secrets: &SecretStore,
    project: &str,
    environment: &str,
    key: &str,
    value: SecretString,
) -> Result<(), DeployerError> {
    let (_, env) = find_environment(store, project, environment).await?;
    let mut map = secrets.open_map(env.secrets.as_deref())?;
    map.insert(key.to_string(), value);
    let sealed = secrets.seal_map(&map)?;
    store.save_environment_secrets(env.id, Some(&sealed)).await
}

/// Remove a secret; returns whether it existed
pub async fn unset_secret(
    store: &Store,
    secrets: &SecretStore,
    project: &str,
    environment: &str,
    key: &str,
) -> Result<bool, DeployerError> {
    let (_, env) = find_environment(store, project, environment).await?;
    let mut map = secrets.open_map(env.secrets.as_deref())?;
    if map.remove(key).is_none() {
        return Ok(false);
    }
    let sealed = if map.is_empty() {
        None
    } else {
        Some(secrets.seal_map(&map)?)
    };
    store.save_environment_secrets(env.id, sealed.as_deref()).await?;
    Ok(true)
}

/// Names of the secrets of an environment; values are never listed
pub async fn secret_names(
    store: &Store,
    secrets: &SecretStore,
    project: &str,
    environment: &str,
) -> Result<Vec<String>, DeployerError> {
    let (_, env) = find_environment(store, project, environment).await?;
    Ok(secrets
        .open_map(env.secrets.as_deref())?
        .into_keys()
        .collect())
}

pub async fn set_domain(
    store: &Store,
    project: &str,
    environment: &str,
    domain: Option<&str>,
    ssl_enabled: bool,
) -> Result<Environment, DeployerError> {
    let (_, env) = find_environment(store, project, environment).await?;
    store.set_environment_domain(env.id, domain, ssl_enabled).await?;
    store.get_environment(env.id).await
}

/// Snapshot printed by `status`
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentStatus {
    pub project: Project,
    pub environment: Environment,
    pub deployments: Vec<Deployment>,
    pub services: Vec<Service>,
}

pub async fn status(
    store: &Store,
    project: &str,
    environment: &str,
    limit: usize,
) -> Result<EnvironmentStatus, DeployerError> {
    let (project, environment) = find_environment(store, project, environment).await?;
    let deployments = store.list_deployments(environment.id, limit).await?;
    let services = store.list_services(environment.id).await?;
    Ok(EnvironmentStatus {
        project,
        environment,
        deployments,
        services,
    })
}

/// A deployment with its log stream and the names it belongs to
#[derive(Debug, Clone)]
pub struct DeploymentLogs {
    pub project: String,
    pub environment: String,
    pub deployment: Deployment,
    pub entries: Vec<DeploymentLog>,
}

pub async fn deployment_logs(store: &Store, id: i64) -> Result<DeploymentLogs, DeployerError> {
    let deployment = store.get_deployment(id).await?;
    let environment = store.get_environment(deployment.environment_id).await?;
    let project = store.get_project(environment.project_id).await?;
    let entries = store.list_logs(id).await?;
    Ok(DeploymentLogs {
        project: project.name,
        environment: environment.name.to_string(),
        deployment,
        entries,
    })
}
