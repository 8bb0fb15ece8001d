//! Project and environment models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,

    /// Unique project name, used in paths and supervisor names
    pub name: String,

    pub repo_url: String,

    /// Default branch
    pub branch: String,

    /// First port handed out to web services
    pub start_port: u16,

    /// Sealed deploy key, if the repository is private
    #[serde(skip_serializing)]
    pub deploy_key: Option<String>,

    /// Secret callers present to trigger deploys
    #[serde(skip_serializing)]
    pub webhook_secret: String,

    pub is_active: bool,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration input
#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub start_port: u16,
    pub deploy_key: Option<String>,
    pub webhook_secret: String,
    pub description: String,
}

/// The fixed set of deployment targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentName {
    Qa,
    Stage,
    Prod,
}

impl EnvironmentName {
    pub const ALL: [EnvironmentName; 3] =
        [EnvironmentName::Qa, EnvironmentName::Stage, EnvironmentName::Prod];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentName::Qa => "qa",
            EnvironmentName::Stage => "stage",
            EnvironmentName::Prod => "prod",
        }
    }
}

impl std::fmt::Display for EnvironmentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnvironmentName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qa" => Ok(EnvironmentName::Qa),
            "stage" | "staging" => Ok(EnvironmentName::Stage),
            "prod" | "production" => Ok(EnvironmentName::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

/// One deployment target of a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: i64,
    pub project_id: i64,
    pub name: EnvironmentName,

    /// Parsed deploy config of the last deployment that loaded one
    pub config: serde_json::Value,

    /// Sealed secret map
    #[serde(skip_serializing)]
    pub secrets: Option<String>,

    pub is_active: bool,
    pub domain: Option<String>,
    pub ssl_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_name_parsing() {
        assert_eq!("QA".parse::<EnvironmentName>().unwrap(), EnvironmentName::Qa);
        assert_eq!(
            "production".parse::<EnvironmentName>().unwrap(),
            EnvironmentName::Prod
        );
        assert!("dev".parse::<EnvironmentName>().is_err());
        assert_eq!(EnvironmentName::Stage.to_string(), "stage");
    }
}
