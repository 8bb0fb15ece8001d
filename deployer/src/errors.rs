//! Error types for the deployer

use thiserror::Error;

/// Main error type for the deployer
#[derive(Error, Debug)]
pub enum DeployerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Command `{command}` failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("Health check failed: {0}")]
    HealthCheckFailure(String),

    #[error("No active deployment for {0}")]
    NoActiveDeployment(String),

    #[error("Nothing to roll back to for {0}")]
    NothingToRollBack(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Secret error: {0}")]
    SecretError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployerError {
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        DeployerError::ExternalCommand {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Stable snake_case code for API responses and exit reporting
    pub fn kind(&self) -> &'static str {
        match self {
            DeployerError::IoError(_) => "io_error",
            DeployerError::JsonError(_) => "json_error",
            DeployerError::YamlError(_) => "config_error",
            DeployerError::HttpError(_) => "http_error",
            DeployerError::DatabaseError(_) => "storage_error",
            DeployerError::NotFound(_) => "not_found",
            DeployerError::Conflict(_) => "conflict",
            DeployerError::ConfigError(_) => "config_error",
            DeployerError::ExternalCommand { .. } => "external_command_error",
            DeployerError::HealthCheckFailure(_) => "health_check_failure",
            DeployerError::NoActiveDeployment(_) => "no_active_deployment",
            DeployerError::NothingToRollBack(_) => "nothing_to_roll_back",
            DeployerError::InvalidTransition(_) => "invalid_transition",
            DeployerError::SecretError(_) => "secret_error",
            DeployerError::StorageError(_) => "storage_error",
            DeployerError::ShutdownError(_) => "shutdown_error",
            DeployerError::Internal(_) => "internal_error",
        }
    }

    /// Errors raised before any deployment record exists.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            DeployerError::NotFound(_)
                | DeployerError::Conflict(_)
                | DeployerError::NoActiveDeployment(_)
                | DeployerError::NothingToRollBack(_)
        )
    }
}

impl From<anyhow::Error> for DeployerError {
    fn from(err: anyhow::Error) -> Self {
        DeployerError::Internal(err.to_string())
    }
}

impl From<tokio::task::JoinError> for DeployerError {
    fn from(err: tokio::task::JoinError) -> Self {
        DeployerError::Internal(err.to_string())
    }
}

impl From<DeployerError> for deploy_api::ErrorResponse {
    fn from(err: DeployerError) -> Self {
        deploy_api::ErrorResponse {
            error: err.kind().to_string(),
            message: err.to_string(),
            details: None,
        }
    }
}
