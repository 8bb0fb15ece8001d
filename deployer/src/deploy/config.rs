//! Deploy config discovery and parsing.
//!
//! A repository describes its services, hooks and variables in
//! `deploy-<env>.yaml` (or `.yml`), falling back to `deploy.yaml` /
//! `deploy.yml`. The parsed document is kept verbatim as JSON so it can be
//! stored on the environment, and also decoded into [`DeployConfig`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::DeployerError;
use crate::models::service::{ServiceSpec, ServiceType};

const DEFAULT_MAX_MEMORY: u32 = 2048;
const DEFAULT_MAX_CPU: f64 = 1.0;
const REQUIRED_KEYS: [&str; 2] = ["name", "services"];

/// File names searched for an environment, in order
pub fn candidate_files(environment: &str) -> [String; 4] {
    [
        format!("deploy-{}.yaml", environment),
        format!("deploy-{}.yml", environment),
        "deploy.yaml".to_string(),
        "deploy.yml".to_string(),
    ]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub pre_deploy: Vec<String>,

    #[serde(default)]
    pub post_deploy: Vec<String>,
}

/// Health check declaration, either a bare path or a table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthCheckDecl {
    Endpoint(String),
    Detailed {
        endpoint: String,
        #[serde(default)]
        interval: Option<u64>,
    },
}

impl HealthCheckDecl {
    pub fn endpoint(&self) -> &str {
        match self {
            HealthCheckDecl::Endpoint(endpoint) => endpoint,
            HealthCheckDecl::Detailed { endpoint, .. } => endpoint,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub max_memory: Option<u32>,

    #[serde(default)]
    pub max_cpu: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDecl {
    pub name: String,

    #[serde(rename = "type")]
    pub service_type: String,

    pub command: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub health_check: Option<HealthCheckDecl>,

    #[serde(default)]
    pub resources: Resources,
}

fn default_enabled() -> bool {
    true
}

impl ServiceDecl {
    pub fn to_spec(&self) -> Result<ServiceSpec, DeployerError> {
        let service_type: ServiceType = self.service_type.parse().map_err(|e: String| {
            DeployerError::ConfigError(format!("Service {}: {}", self.name, e))
        })?;
        Ok(ServiceSpec {
            name: self.name.clone(),
            service_type,
            command: self.command.clone(),
            port: self.port,
            health_check_endpoint: self
                .health_check
                .as_ref()
                .map(|h| h.endpoint().to_string())
                .filter(|e| !e.is_empty()),
            max_memory: self.resources.max_memory.unwrap_or(DEFAULT_MAX_MEMORY),
            max_cpu: self.resources.max_cpu.unwrap_or(DEFAULT_MAX_CPU),
        })
    }
}

/// Typed view of a deploy config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    pub name: String,

    pub services: Vec<ServiceDecl>,

    #[serde(default, alias = "runtime_version")]
    pub python_version: Option<String>,

    #[serde(default)]
    pub requirements: Option<String>,

    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,

    #[serde(default)]
    pub hooks: Hooks,
}

impl DeployConfig {
    /// Enabled services as reconciliation input
    pub fn service_specs(&self) -> Result<Vec<ServiceSpec>, DeployerError> {
        self.services
            .iter()
            .filter(|s| s.enabled)
            .map(ServiceDecl::to_spec)
            .collect()
    }
}

/// A parsed config together with where it came from
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub file_name: String,
    pub raw: serde_json::Value,
    pub config: DeployConfig,
}

/// Parse config text; checks required keys before decoding
pub fn parse(text: &str) -> Result<(serde_json::Value, DeployConfig), DeployerError> {
    let raw: serde_json::Value = serde_yaml::from_str(text)
        .map_err(|e| DeployerError::ConfigError(format!("Invalid deploy config: {}", e)))?;

    let Some(table) = raw.as_object() else {
        return Err(DeployerError::ConfigError(
            "Deploy config must be a mapping".to_string(),
        ));
    };
    for key in REQUIRED_KEYS {
        if !table.contains_key(key) {
            return Err(DeployerError::ConfigError(format!(
                "Missing required field in config: {}",
                key
            )));
        }
    }

    let config: DeployConfig = serde_json::from_value(raw.clone())
        .map_err(|e| DeployerError::ConfigError(format!("Invalid deploy config: {}", e)))?;
    Ok((raw, config))
}

/// Find and parse the config for `environment` in `repo_dir`
pub async fn load(repo_dir: &Path, environment: &str) -> Result<LoadedConfig, DeployerError> {
    let candidates = candidate_files(environment);
    for file_name in &candidates {
        let path = repo_dir.join(file_name);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        let (raw, config) = parse(&text)?;
        return Ok(LoadedConfig {
            file_name: file_name.clone(),
            raw,
            config,
        });
    }

    Err(DeployerError::ConfigError(format!(
        "No deployment configuration found (looked for {})",
        candidates.join(", ")
    )))
}
