//! Deployment models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use deploy_api::DeploymentView;

/// Stage of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Cloning,
    Building,
    Deploying,
    Testing,
    Active,
    /// Was active and has been superseded
    Inactive,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    /// Statuses of a deployment still being worked on
    pub const IN_FLIGHT: [DeploymentStatus; 5] = [
        DeploymentStatus::Pending,
        DeploymentStatus::Cloning,
        DeploymentStatus::Building,
        DeploymentStatus::Deploying,
        DeploymentStatus::Testing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Cloning => "cloning",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Testing => "testing",
            DeploymentStatus::Active => "active",
            DeploymentStatus::Inactive => "inactive",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_in_flight(&self) -> bool {
        Self::IN_FLIGHT.contains(self)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeploymentStatus::Pending),
            "cloning" => Ok(DeploymentStatus::Cloning),
            "building" => Ok(DeploymentStatus::Building),
            "deploying" => Ok(DeploymentStatus::Deploying),
            "testing" => Ok(DeploymentStatus::Testing),
            "active" => Ok(DeploymentStatus::Active),
            "inactive" => Ok(DeploymentStatus::Inactive),
            "failed" => Ok(DeploymentStatus::Failed),
            "rolled_back" => Ok(DeploymentStatus::RolledBack),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

/// Commit a deployment was built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    /// `Name <email>`
    pub author: String,
    pub date: DateTime<Utc>,
}

/// One attempt to bring an environment to a new version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub environment_id: i64,
    pub version: String,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub commit_date: Option<DateTime<Utc>>,
    pub status: DeploymentStatus,
    pub release_path: Option<String>,
    pub initiated_by: String,
    pub rollback_from: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When the status last changed
    pub stage_changed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn is_rollback(&self) -> bool {
        self.rollback_from.is_some()
    }

    pub fn to_view(&self, project: &str, environment: &str) -> DeploymentView {
        DeploymentView {
            id: self.id,
            project: project.to_string(),
            environment: environment.to_string(),
            version: self.version.clone(),
            status: self.status.to_string(),
            commit_sha: self.commit_sha.clone(),
            commit_message: self.commit_message.clone(),
            commit_author: self.commit_author.clone(),
            release_path: self.release_path.clone(),
            initiated_by: self.initiated_by.clone(),
            rollback_from: self.rollback_from,
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Input for a new deployment row
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub environment_id: i64,
    pub version: String,
    pub status: DeploymentStatus,
    pub initiated_by: String,
    pub rollback_from: Option<i64>,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub commit_date: Option<DateTime<Utc>>,
    pub release_path: Option<String>,
}

impl NewDeployment {
    pub fn pending(environment_id: i64, version: String, initiated_by: &str) -> Self {
        Self {
            environment_id,
            version,
            status: DeploymentStatus::Pending,
            initiated_by: initiated_by.to_string(),
            rollback_from: None,
            commit_sha: None,
            commit_message: None,
            commit_author: None,
            commit_date: None,
            release_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_and_flight() {
        for status in [
            DeploymentStatus::Pending,
            DeploymentStatus::Testing,
            DeploymentStatus::RolledBack,
            DeploymentStatus::Inactive,
        ] {
            assert_eq!(status.as_str().parse::<DeploymentStatus>().unwrap(), status);
        }
        assert!(DeploymentStatus::Building.is_in_flight());
        assert!(!DeploymentStatus::Active.is_in_flight());
        assert!(!DeploymentStatus::Inactive.is_in_flight());
        assert_eq!(
            serde_json::to_string(&DeploymentStatus::RolledBack).unwrap(),
            "\"rolled_back\""
        );
    }
}
