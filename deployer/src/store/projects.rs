use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::{is_constraint_violation, Store};
use crate::errors::DeployerError;
use crate::models::project::{Environment, EnvironmentName, NewProject, Project};

const PROJECT_COLUMNS: &str = "id, name, repo_url, branch, start_port, deploy_key, webhook_secret, \
     is_active, description, created_at, updated_at";

const ENVIRONMENT_COLUMNS: &str = "id, project_id, name, config, secrets, is_active, domain, \
     ssl_enabled, created_at, updated_at";

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get("id")?,
        name: row.get("name")?,
        repo_url: row.get("repo_url")?,
        branch: row.get("branch")?,
        start_port: row.get("start_port")?,
        deploy_key: row.get("deploy_key")?,
        webhook_secret: row.get("webhook_secret")?,
        is_active: row.get("is_active")?,
        description: row.get("description")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn environment_from_row(row: &Row<'_>) -> rusqlite::Result<Environment> {
    let config: String = row.get("config")?;
    let config = serde_json::from_str(&config).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Environment {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        name: row.get("name")?,
        config,
        secrets: row.get("secrets")?,
        is_active: row.get("is_active")?,
        domain: row.get("domain")?,
        ssl_enabled: row.get("ssl_enabled")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    /// Register a project together with its environments
    pub async fn create_project(
        &self,
        project: NewProject,
        environments: &[EnvironmentName],
    ) -> Result<(Project, Vec<Environment>), DeployerError> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let now = Utc::now();

        let inserted = tx.execute(
            "INSERT INTO projects (name, repo_url, branch, start_port, deploy_key, webhook_secret,
                                   is_active, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?8)",
            params![
                project.name,
                project.repo_url,
                project.branch,
                project.start_port,
                project.deploy_key,
                project.webhook_secret,
                project.description,
                now,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(DeployerError::Conflict(format!(
                    "Project {} already exists",
                    project.name
                )));
            }
            Err(e) => return Err(e.into()),
        }
        let project_id = tx.last_insert_rowid();

        for name in environments {
            tx.execute(
                "INSERT INTO environments (project_id, name, config, is_active, ssl_enabled,
                                           created_at, updated_at)
                 VALUES (?1, ?2, '{}', 1, 0, ?3, ?3)",
                params![project_id, name, now],
            )?;
        }

        let created = tx.query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
            [project_id],
            project_from_row,
        )?;
        let envs = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {ENVIRONMENT_COLUMNS} FROM environments WHERE project_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt.query_map([project_id], environment_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.commit()?;
        Ok((created, envs))
    }

    pub async fn find_project(&self, name: &str) -> Result<Option<Project>, DeployerError> {
        let db = self.db.lock().await;
        let project = db
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE name = ?1"),
                [name],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    pub async fn get_project(&self, id: i64) -> Result<Project, DeployerError> {
        let db = self.db.lock().await;
        db.query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
            [id],
            project_from_row,
        )
        .optional()?
        .ok_or_else(|| DeployerError::NotFound(format!("project #{}", id)))
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, DeployerError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY name"
        ))?;
        let rows = stmt.query_map([], project_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Soft-enable or soft-disable a project
    pub async fn set_project_active(&self, id: i64, active: bool) -> Result<(), DeployerError> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE projects SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, active, Utc::now()],
        )?;
        Ok(())
    }

    pub async fn find_environment(
        &self,
        project_id: i64,
        name: EnvironmentName,
    ) -> Result<Option<Environment>, DeployerError> {
        let db = self.db.lock().await;
        let env = db
            .query_row(
                &format!(
                    "SELECT {ENVIRONMENT_COLUMNS} FROM environments
                     WHERE project_id = ?1 AND name = ?2"
                ),
                params![project_id, name],
                environment_from_row,
            )
            .optional()?;
        Ok(env)
    }

    pub async fn get_environment(&self, id: i64) -> Result<Environment, DeployerError> {
        let db = self.db.lock().await;
        db.query_row(
            &format!("SELECT {ENVIRONMENT_COLUMNS} FROM environments WHERE id = ?1"),
            [id],
            environment_from_row,
        )
        .optional()?
        .ok_or_else(|| DeployerError::NotFound(format!("environment #{}", id)))
    }

    pub async fn list_environments(
        &self,
        project_id: i64,
    ) -> Result<Vec<Environment>, DeployerError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {ENVIRONMENT_COLUMNS} FROM environments WHERE project_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([project_id], environment_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Persist the parsed deploy config; the last deploy to load one wins
    pub async fn save_environment_config(
        &self,
        environment_id: i64,
        config: &serde_json::Value,
    ) -> Result<(), DeployerError> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE environments SET config = ?2, updated_at = ?3 WHERE id = ?1",
            params![environment_id, serde_json::to_string(config)?, Utc::now()],
        )?;
        Ok(())
    }

    pub async fn save_environment_secrets(
        &self,
        environment_id: i64,
        sealed: Option<&str>,
    ) -> Result<(), DeployerError> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE environments SET secrets = ?2, updated_at = ?3 WHERE id = ?1",
            params![environment_id, sealed, Utc::now()],
        )?;
        Ok(())
    }

    pub async fn set_environment_domain(
        &self,
        environment_id: i64,
        domain: Option<&str>,
        ssl_enabled: bool,
    ) -> Result<(), DeployerError> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE environments SET domain = ?2, ssl_enabled = ?3, updated_at = ?4 WHERE id = ?1",
            params![environment_id, domain, ssl_enabled, Utc::now()],
        )?;
        Ok(())
    }

    pub async fn set_environment_active(
        &self,
        environment_id: i64,
        active: bool,
    ) -> Result<(), DeployerError> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE environments SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
            params![environment_id, active, Utc::now()],
        )?;
        Ok(())
    }

    /// Active environments of active projects that currently serve a release
    pub async fn list_live_environments(
        &self,
    ) -> Result<Vec<(Project, Environment)>, DeployerError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT e.id FROM environments e
             JOIN projects p ON p.id = e.project_id
             WHERE p.is_active = 1 AND e.is_active = 1
               AND EXISTS (SELECT 1 FROM deployments d
                           WHERE d.environment_id = e.id AND d.status = 'active')
             ORDER BY p.name, e.id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let env = db.query_row(
                &format!("SELECT {ENVIRONMENT_COLUMNS} FROM environments WHERE id = ?1"),
                [id],
                environment_from_row,
            )?;
            let project = db.query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                [env.project_id],
                project_from_row,
            )?;
            out.push((project, env));
        }
        Ok(out)
    }
}
