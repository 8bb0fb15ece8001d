//! Service and health-check models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Serves HTTP behind the reverse proxy
    Web,
    Worker,
    Scheduler,
    Custom,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Web => "web",
            ServiceType::Worker => "worker",
            ServiceType::Scheduler => "scheduler",
            ServiceType::Custom => "custom",
        }
    }

    pub fn is_web(&self) -> bool {
        matches!(self, ServiceType::Web)
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "web" | "django" => Ok(ServiceType::Web),
            "worker" | "celery" => Ok(ServiceType::Worker),
            "scheduler" | "celery-beat" | "beat" => Ok(ServiceType::Scheduler),
            "custom" => Ok(ServiceType::Custom),
            _ => Err(format!("Invalid service type: {}", s)),
        }
    }
}

/// Last observed state of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Failed,
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Failed => "failed",
            ServiceStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(ServiceStatus::Stopped),
            "starting" => Ok(ServiceStatus::Starting),
            "running" => Ok(ServiceStatus::Running),
            "failed" => Ok(ServiceStatus::Failed),
            "unknown" => Ok(ServiceStatus::Unknown),
            _ => Err(format!("Invalid service status: {}", s)),
        }
    }
}

/// A supervised process of an environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: i64,
    pub environment_id: i64,
    pub name: String,
    pub service_type: ServiceType,
    pub command: String,
    pub port: Option<u16>,
    pub health_check_endpoint: Option<String>,
    /// Memory ceiling in MB
    pub max_memory: u32,
    pub max_cpu: f64,
    pub enabled: bool,
    pub supervisor_name: String,

    pub status: ServiceStatus,
    pub pid: Option<u32>,
    /// Resident memory in MB
    pub memory_usage: Option<f64>,
    pub cpu_usage: Option<f64>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_restart: Option<DateTime<Utc>>,
}

impl Service {
    /// Web services that can be probed over HTTP
    pub fn probe_target(&self) -> Option<(u16, &str)> {
        if !self.enabled || !self.service_type.is_web() {
            return None;
        }
        match (self.port, self.health_check_endpoint.as_deref()) {
            (Some(port), Some(endpoint)) if !endpoint.is_empty() => Some((port, endpoint)),
            _ => None,
        }
    }
}

/// Supervisor program name, unique across the host
pub fn supervisor_name(project: &str, environment: &str, service: &str) -> String {
    format!("{}-{}-{}", project, environment, service).replace('_', "-")
}

/// Declared state of a service, applied by reconciliation
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    pub service_type: ServiceType,
    pub command: String,
    pub port: Option<u16>,
    pub health_check_endpoint: Option<String>,
    pub max_memory: u32,
    pub max_cpu: f64,
}

/// Point-in-time liveness probe of a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub id: i64,
    pub service_id: i64,
    pub is_healthy: bool,
    /// Seconds
    pub response_time: Option<f64>,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Outcome of one probe, before it is recorded
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub is_healthy: bool,
    pub response_time: Option<f64>,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_aliases() {
        assert_eq!("django".parse::<ServiceType>().unwrap(), ServiceType::Web);
        assert_eq!("celery".parse::<ServiceType>().unwrap(), ServiceType::Worker);
        assert_eq!(
            "celery-beat".parse::<ServiceType>().unwrap(),
            ServiceType::Scheduler
        );
        assert!("cron".parse::<ServiceType>().is_err());
    }

    #[test]
    fn test_supervisor_name() {
        assert_eq!(supervisor_name("my_app", "prod", "celery_worker"), "my-app-prod-celery-worker");
    }
}
