//! SQLite persistence for projects, environments, deployments and services.
//!
//! The deployment invariants live in the schema: a partial unique index
//! admits at most one in-flight deployment per environment and another at
//! most one active deployment, so concurrent writers (CLI and daemon) are
//! serialized by SQLite rather than by read-then-write checks.

mod deployments;
mod logs;
mod projects;
mod services;

pub use services::ServiceScope;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, ErrorCode};
use tokio::sync::Mutex;
use tracing::info;

use crate::errors::DeployerError;
use crate::filesys::file::File;
use crate::models::deployment::DeploymentStatus;
use crate::models::log::Severity;
use crate::models::project::EnvironmentName;
use crate::models::service::{ServiceStatus, ServiceType};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    repo_url TEXT NOT NULL,
    branch TEXT NOT NULL DEFAULT 'main',
    start_port INTEGER NOT NULL,
    deploy_key TEXT,
    webhook_secret TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    description TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS environments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    config TEXT NOT NULL DEFAULT '{}',
    secrets TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    domain TEXT,
    ssl_enabled INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(project_id, name)
);

CREATE TABLE IF NOT EXISTS deployments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    environment_id INTEGER NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
    version TEXT NOT NULL,
    commit_sha TEXT,
    commit_message TEXT,
    commit_author TEXT,
    commit_date TEXT,
    status TEXT NOT NULL,
    release_path TEXT,
    initiated_by TEXT NOT NULL,
    rollback_from INTEGER REFERENCES deployments(id),
    error_message TEXT,
    created_at TEXT NOT NULL,
    stage_changed_at TEXT NOT NULL,
    completed_at TEXT,
    UNIQUE(environment_id, version)
);

CREATE UNIQUE INDEX IF NOT EXISTS deployments_one_in_flight
    ON deployments(environment_id)
    WHERE status IN ('pending', 'cloning', 'building', 'deploying', 'testing');

CREATE UNIQUE INDEX IF NOT EXISTS deployments_one_active
    ON deployments(environment_id)
    WHERE status = 'active';

CREATE TABLE IF NOT EXISTS services (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    environment_id INTEGER NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    service_type TEXT NOT NULL,
    command TEXT NOT NULL,
    port INTEGER,
    health_check_endpoint TEXT,
    max_memory INTEGER NOT NULL DEFAULT 2048,
    max_cpu REAL NOT NULL DEFAULT 1.0,
    enabled INTEGER NOT NULL DEFAULT 1,
    supervisor_name TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'stopped',
    pid INTEGER,
    memory_usage REAL,
    cpu_usage REAL,
    last_health_check TEXT,
    restart_count INTEGER NOT NULL DEFAULT 0,
    last_restart TEXT,
    UNIQUE(environment_id, name)
);

CREATE TABLE IF NOT EXISTS deployment_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    deployment_id INTEGER NOT NULL REFERENCES deployments(id) ON DELETE CASCADE,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS health_checks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service_id INTEGER NOT NULL REFERENCES services(id) ON DELETE CASCADE,
    is_healthy INTEGER NOT NULL,
    response_time REAL,
    error_message TEXT,
    checked_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS deployment_logs_by_deployment ON deployment_logs(deployment_id, id);
CREATE INDEX IF NOT EXISTS health_checks_by_service ON health_checks(service_id, checked_at);
";

/// Handle to the deployer database
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Store")
    }
}

impl Store {
    /// Open (and create if needed) the database file
    pub async fn open(path: &Path) -> Result<Self, DeployerError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        File::new(path).set_permissions_600().await?;

        info!("Opened database at {}", path.display());
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self, DeployerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DeployerError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }
}

/// True when `err` is a UNIQUE/CHECK/FK violation
fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

macro_rules! text_enum_sql {
    ($($t:ty),* $(,)?) => {
        $(
            impl ToSql for $t {
                fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                    Ok(ToSqlOutput::from(self.as_str()))
                }
            }

            impl FromSql for $t {
                fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                    value
                        .as_str()?
                        .parse()
                        .map_err(|e: String| FromSqlError::Other(e.into()))
                }
            }
        )*
    };
}

text_enum_sql!(
    DeploymentStatus,
    EnvironmentName,
    ServiceType,
    ServiceStatus,
    Severity,
);

/// Column value for an optional JSON document
fn json_column(value: Option<&serde_json::Value>) -> Result<Option<String>, DeployerError> {
    value.map(serde_json::to_string).transpose().map_err(Into::into)
}

fn parse_json_column(text: Option<String>) -> rusqlite::Result<Option<serde_json::Value>> {
    text.map(|t| {
        serde_json::from_str(&t).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_file_database_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("deployer.db");
        Store::open(&path).await.unwrap();
        // Schema creation is idempotent.
        Store::open(&path).await.unwrap();
        assert!(path.is_file());
    }
}
