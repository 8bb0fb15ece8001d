//! API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deploy trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub project: String,
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub initiator: String,
}

/// Rollback trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub project: String,
    pub environment: String,
    pub initiator: String,
}

/// Any inbound trigger. CLI invocations, webhooks and scheduled jobs all
/// reduce to one of these two calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum TriggerRequest {
    Deploy(DeployRequest),
    Rollback(RollbackRequest),
}

impl TriggerRequest {
    pub fn project(&self) -> &str {
        match self {
            TriggerRequest::Deploy(req) => &req.project,
            TriggerRequest::Rollback(req) => &req.project,
        }
    }

    pub fn environment(&self) -> &str {
        match self {
            TriggerRequest::Deploy(req) => &req.environment,
            TriggerRequest::Rollback(req) => &req.environment,
        }
    }
}

/// Deployment as reported to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentView {
    pub id: i64,
    pub project: String,
    pub environment: String,
    pub version: String,
    pub status: String,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub release_path: Option<String>,
    pub initiated_by: String,
    pub rollback_from: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Deployment log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntryView {
    pub level: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}
