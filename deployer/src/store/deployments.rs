use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{is_constraint_violation, Store};
use crate::errors::DeployerError;
use crate::models::deployment::{CommitInfo, Deployment, DeploymentStatus, NewDeployment};

const DEPLOYMENT_COLUMNS: &str = "id, environment_id, version, commit_sha, commit_message, \
     commit_author, commit_date, status, release_path, initiated_by, rollback_from, \
     error_message, created_at, stage_changed_at, completed_at";

const IN_FLIGHT_SQL: &str = "('pending', 'cloning', 'building', 'deploying', 'testing')";

fn deployment_from_row(row: &Row<'_>) -> rusqlite::Result<Deployment> {
    Ok(Deployment {
        id: row.get("id")?,
        environment_id: row.get("environment_id")?,
        version: row.get("version")?,
        commit_sha: row.get("commit_sha")?,
        commit_message: row.get("commit_message")?,
        commit_author: row.get("commit_author")?,
        commit_date: row.get("commit_date")?,
        status: row.get("status")?,
        release_path: row.get("release_path")?,
        initiated_by: row.get("initiated_by")?,
        rollback_from: row.get("rollback_from")?,
        error_message: row.get("error_message")?,
        created_at: row.get("created_at")?,
        stage_changed_at: row.get("stage_changed_at")?,
        completed_at: row.get("completed_at")?,
    })
}

fn load(conn: &Connection, id: i64) -> Result<Deployment, DeployerError> {
    conn.query_row(
        &format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = ?1"),
        [id],
        deployment_from_row,
    )
    .optional()?
    .ok_or_else(|| DeployerError::NotFound(format!("deployment #{}", id)))
}

/// First of `base`, `base-2`, `base-3`, ... not yet used in the environment
fn unique_version(conn: &Connection, environment_id: i64, base: &str) -> rusqlite::Result<String> {
    let mut stmt = conn.prepare(
        "SELECT version FROM deployments
         WHERE environment_id = ?1 AND (version = ?2 OR version LIKE ?2 || '-%')",
    )?;
    let taken = stmt
        .query_map(params![environment_id, base], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<std::collections::HashSet<_>>>()?;

    if !taken.contains(base) {
        return Ok(base.to_string());
    }
    let mut suffix = 2u32;
    loop {
        let candidate = format!("{}-{}", base, suffix);
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
        suffix += 1;
    }
}

/// `Conflict` for a status write that matched no in-flight row
fn no_longer_in_flight(conn: &Connection, id: i64) -> DeployerError {
    match load(conn, id) {
        Ok(deployment) => DeployerError::Conflict(format!(
            "deployment #{} is no longer in progress ({})",
            id, deployment.status
        )),
        Err(e) => e,
    }
}

impl Store {
    /// Insert a deployment in an in-flight status.
    ///
    /// Fails with `Conflict` and writes nothing when the environment already
    /// has an in-flight deployment. The version is suffixed until unique.
    pub async fn admit_deployment(
        &self,
        new: NewDeployment,
    ) -> Result<Deployment, DeployerError> {
        let mut db = self.db.lock().await;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let version = unique_version(&tx, new.environment_id, &new.version)?;
        let inserted = tx.execute(
            "INSERT INTO deployments (environment_id, version, commit_sha, commit_message,
                                      commit_author, commit_date, status, release_path,
                                      initiated_by, rollback_from, created_at,
                                      stage_changed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                new.environment_id,
                version,
                new.commit_sha,
                new.commit_message,
                new.commit_author,
                new.commit_date,
                new.status,
                new.release_path,
                new.initiated_by,
                new.rollback_from,
                Utc::now(),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(DeployerError::Conflict(
                    "a deployment is already in progress".to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        }
        let deployment = load(&tx, tx.last_insert_rowid())?;
        tx.commit()?;
        Ok(deployment)
    }

    pub async fn get_deployment(&self, id: i64) -> Result<Deployment, DeployerError> {
        let db = self.db.lock().await;
        load(&db, id)
    }

    /// Persist a stage transition of an in-flight deployment.
    ///
    /// Fails with `Conflict` once the deployment has left flight, e.g. after
    /// the reaper failed it, so a stale pipeline stops at its next stage.
    pub async fn set_deployment_status(
        &self,
        id: i64,
        status: DeploymentStatus,
    ) -> Result<(), DeployerError> {
        let db = self.db.lock().await;
        let changed = db.execute(
            &format!(
                "UPDATE deployments SET status = ?2, stage_changed_at = ?3
                 WHERE id = ?1 AND status IN {IN_FLIGHT_SQL}"
            ),
            params![id, status, Utc::now()],
        )?;
        if changed == 0 {
            return Err(no_longer_in_flight(&db, id));
        }
        Ok(())
    }

    pub async fn set_deployment_commit(
        &self,
        id: i64,
        commit: &CommitInfo,
    ) -> Result<(), DeployerError> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE deployments
             SET commit_sha = ?2, commit_message = ?3, commit_author = ?4, commit_date = ?5
             WHERE id = ?1",
            params![id, commit.sha, commit.message, commit.author, commit.date],
        )?;
        Ok(())
    }

    pub async fn set_release_path(&self, id: i64, path: &str) -> Result<(), DeployerError> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE deployments SET release_path = ?2 WHERE id = ?1",
            params![id, path],
        )?;
        Ok(())
    }

    /// Mark an in-flight deployment failed with its error and completion
    /// time. A deployment that already settled is left alone and `Conflict`
    /// is returned.
    pub async fn fail_deployment(&self, id: i64, error: &str) -> Result<(), DeployerError> {
        let db = self.db.lock().await;
        let now = Utc::now();
        let changed = db.execute(
            &format!(
                "UPDATE deployments
                 SET status = 'failed', error_message = ?2, completed_at = ?3, stage_changed_at = ?3
                 WHERE id = ?1 AND status IN {IN_FLIGHT_SQL}"
            ),
            params![id, error, now],
        )?;
        if changed == 0 {
            return Err(no_longer_in_flight(&db, id));
        }
        Ok(())
    }

    /// Promote a deployment in `testing` to active, demoting the current
    /// active one of the same environment to inactive in the same
    /// transaction. Any other status is an `InvalidTransition` and nothing
    /// is written.
    pub async fn activate_deployment(&self, id: i64) -> Result<Deployment, DeployerError> {
        let mut db = self.db.lock().await;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let deployment = load(&tx, id)?;
        if deployment.status != DeploymentStatus::Testing {
            return Err(DeployerError::InvalidTransition(format!(
                "deployment #{} is {}, not testing",
                id, deployment.status
            )));
        }
        let now = Utc::now();

        tx.execute(
            "UPDATE deployments SET status = 'inactive', stage_changed_at = ?3
             WHERE environment_id = ?1 AND status = 'active' AND id != ?2",
            params![deployment.environment_id, id, now],
        )?;
        tx.execute(
            "UPDATE deployments
             SET status = 'active', completed_at = ?2, stage_changed_at = ?2, error_message = NULL
             WHERE id = ?1 AND status = 'testing'",
            params![id, now],
        )?;

        let activated = load(&tx, id)?;
        tx.commit()?;
        Ok(activated)
    }

    /// Settle a successful rollback in one transaction: the previously
    /// active deployment (if it differs from the target) becomes
    /// rolled_back, the target becomes active and the rollback record is
    /// completed as inactive.
    pub async fn complete_rollback(
        &self,
        record_id: i64,
        previous_active: Option<i64>,
        target_id: i64,
    ) -> Result<Deployment, DeployerError> {
        let mut db = self.db.lock().await;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        // The record must still be in flight; a reaped rollback settles nothing.
        let settled = tx.execute(
            "UPDATE deployments SET status = 'inactive', completed_at = ?2, stage_changed_at = ?2
             WHERE id = ?1 AND status = 'deploying'",
            params![record_id, now],
        )?;
        if settled == 0 {
            return Err(no_longer_in_flight(&tx, record_id));
        }
        if let Some(previous) = previous_active.filter(|p| *p != target_id) {
            tx.execute(
                "UPDATE deployments SET status = 'rolled_back', stage_changed_at = ?2
                 WHERE id = ?1 AND status = 'active'",
                params![previous, now],
            )?;
        }
        tx.execute(
            "UPDATE deployments SET status = 'active', stage_changed_at = ?2
             WHERE id = ?1 AND status IN ('active', 'inactive')",
            params![target_id, now],
        )?;

        let record = load(&tx, record_id)?;
        tx.commit()?;
        Ok(record)
    }

    pub async fn active_deployment(
        &self,
        environment_id: i64,
    ) -> Result<Option<Deployment>, DeployerError> {
        let db = self.db.lock().await;
        let deployment = db
            .query_row(
                &format!(
                    "SELECT {DEPLOYMENT_COLUMNS} FROM deployments
                     WHERE environment_id = ?1 AND status = 'active'"
                ),
                [environment_id],
                deployment_from_row,
            )
            .optional()?;
        Ok(deployment)
    }

    pub async fn in_flight_deployment(
        &self,
        environment_id: i64,
    ) -> Result<Option<Deployment>, DeployerError> {
        let db = self.db.lock().await;
        let deployment = db
            .query_row(
                &format!(
                    "SELECT {DEPLOYMENT_COLUMNS} FROM deployments
                     WHERE environment_id = ?1 AND status IN {IN_FLIGHT_SQL}"
                ),
                [environment_id],
                deployment_from_row,
            )
            .optional()?;
        Ok(deployment)
    }

    /// Superseded deployments that may be restored, most recently completed
    /// first. Rollback records and deployments without a release are skipped.
    pub async fn rollback_candidates(
        &self,
        environment_id: i64,
    ) -> Result<Vec<Deployment>, DeployerError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments
             WHERE environment_id = ?1 AND status = 'inactive'
               AND rollback_from IS NULL AND release_path IS NOT NULL
               AND completed_at IS NOT NULL
             ORDER BY completed_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map([environment_id], deployment_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Newest deployments of an environment
    pub async fn list_deployments(
        &self,
        environment_id: i64,
        limit: usize,
    ) -> Result<Vec<Deployment>, DeployerError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments
             WHERE environment_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![environment_id, limit as i64], deployment_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// In-flight deployments created before `cutoff`
    pub async fn stuck_deployments(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Deployment>, DeployerError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments
             WHERE status IN {IN_FLIGHT_SQL} ORDER BY id"
        ))?;
        let rows = stmt.query_map([], deployment_from_row)?;
        let all = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(all.into_iter().filter(|d| d.created_at < cutoff).collect())
    }
}
