use chrono::Utc;
use rusqlite::params;

use super::{json_column, parse_json_column, Store};
use crate::errors::DeployerError;
use crate::models::log::{DeploymentLog, Severity};

impl Store {
    /// Append one entry to a deployment's log stream
    pub async fn append_log(
        &self,
        deployment_id: i64,
        level: Severity,
        message: &str,
        details: Option<&serde_json::Value>,
    ) -> Result<(), DeployerError> {
        let details = json_column(details)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO deployment_logs (deployment_id, level, message, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![deployment_id, level, message, details, Utc::now()],
        )?;
        Ok(())
    }

    /// Log stream of a deployment in write order
    pub async fn list_logs(&self, deployment_id: i64) -> Result<Vec<DeploymentLog>, DeployerError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, deployment_id, level, message, details, created_at
             FROM deployment_logs WHERE deployment_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([deployment_id], |row| {
            Ok(DeploymentLog {
                id: row.get(0)?,
                deployment_id: row.get(1)?,
                level: row.get(2)?,
                message: row.get(3)?,
                details: parse_json_column(row.get(4)?)?,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
