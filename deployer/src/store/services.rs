use std::collections::{HashMap, HashSet};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::Store;
use crate::deploy::ports::next_free_port;
use crate::errors::DeployerError;
use crate::models::service::{
    supervisor_name, HealthCheck, ProbeResult, Service, ServiceSpec, ServiceStatus,
};

const SERVICE_COLUMNS: &str = "id, environment_id, name, service_type, command, port, \
     health_check_endpoint, max_memory, max_cpu, enabled, supervisor_name, status, pid, \
     memory_usage, cpu_usage, last_health_check, restart_count, last_restart";

fn service_from_row(row: &Row<'_>) -> rusqlite::Result<Service> {
    Ok(Service {
        id: row.get("id")?,
        environment_id: row.get("environment_id")?,
        name: row.get("name")?,
        service_type: row.get("service_type")?,
        command: row.get("command")?,
        port: row.get("port")?,
        health_check_endpoint: row.get("health_check_endpoint")?,
        max_memory: row.get("max_memory")?,
        max_cpu: row.get("max_cpu")?,
        enabled: row.get("enabled")?,
        supervisor_name: row.get("supervisor_name")?,
        status: row.get("status")?,
        pid: row.get("pid")?,
        memory_usage: row.get("memory_usage")?,
        cpu_usage: row.get("cpu_usage")?,
        last_health_check: row.get("last_health_check")?,
        restart_count: row.get("restart_count")?,
        last_restart: row.get("last_restart")?,
    })
}

fn list(conn: &Connection, environment_id: i64) -> rusqlite::Result<Vec<Service>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SERVICE_COLUMNS} FROM services WHERE environment_id = ?1 ORDER BY id"
    ))?;
    let rows = stmt.query_map([environment_id], service_from_row)?;
    rows.collect()
}

/// Names needed to derive supervisor identifiers
#[derive(Debug, Clone, Copy)]
pub struct ServiceScope<'a> {
    pub environment_id: i64,
    pub project: &'a str,
    pub environment: &'a str,
    pub start_port: u16,
}

impl Store {
    pub async fn list_services(&self, environment_id: i64) -> Result<Vec<Service>, DeployerError> {
        let db = self.db.lock().await;
        Ok(list(&db, environment_id)?)
    }

    pub async fn get_service(&self, id: i64) -> Result<Service, DeployerError> {
        let db = self.db.lock().await;
        db.query_row(
            &format!("SELECT {SERVICE_COLUMNS} FROM services WHERE id = ?1"),
            [id],
            service_from_row,
        )
        .optional()?
        .ok_or_else(|| DeployerError::NotFound(format!("service #{}", id)))
    }

    /// Apply declared services to an environment.
    ///
    /// Existing rows are matched by name and updated, new names are
    /// inserted, and rows not declared are left untouched. Web services
    /// without a port get the next free port of the environment. Returns the
    /// reconciled rows in declaration order.
    pub async fn reconcile_services(
        &self,
        scope: ServiceScope<'_>,
        specs: &[ServiceSpec],
    ) -> Result<Vec<Service>, DeployerError> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let existing: HashMap<String, Service> = list(&tx, scope.environment_id)?
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        let mut used: HashSet<u16> = existing.values().filter_map(|s| s.port).collect();
        used.extend(specs.iter().filter_map(|s| s.port));

        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let current = existing.get(&spec.name);
            let mut port = spec.port.or_else(|| current.and_then(|s| s.port));
            if port.is_none() && spec.service_type.is_web() {
                let allocated = next_free_port(scope.start_port, &used)?;
                used.insert(allocated);
                port = Some(allocated);
            }
            let program = supervisor_name(scope.project, scope.environment, &spec.name);

            match current {
                Some(service) => {
                    tx.execute(
                        "UPDATE services
                         SET service_type = ?2, command = ?3, port = ?4,
                             health_check_endpoint = ?5, max_memory = ?6, max_cpu = ?7,
                             enabled = 1, supervisor_name = ?8
                         WHERE id = ?1",
                        params![
                            service.id,
                            spec.service_type,
                            spec.command,
                            port,
                            spec.health_check_endpoint,
                            spec.max_memory,
                            spec.max_cpu,
                            program,
                        ],
                    )?;
                    ids.push(service.id);
                }
                None => {
                    tx.execute(
                        "INSERT INTO services (environment_id, name, service_type, command, port,
                                               health_check_endpoint, max_memory, max_cpu,
                                               enabled, supervisor_name, status)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, 'stopped')",
                        params![
                            scope.environment_id,
                            spec.name,
                            spec.service_type,
                            spec.command,
                            port,
                            spec.health_check_endpoint,
                            spec.max_memory,
                            spec.max_cpu,
                            program,
                        ],
                    )?;
                    ids.push(tx.last_insert_rowid());
                }
            }
        }

        let by_id: HashMap<i64, Service> = list(&tx, scope.environment_id)?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();
        tx.commit()?;

        Ok(ids.iter().filter_map(|id| by_id.get(id).cloned()).collect())
    }

    pub async fn set_service_status(
        &self,
        id: i64,
        status: ServiceStatus,
    ) -> Result<(), DeployerError> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE services SET status = ?2 WHERE id = ?1",
            params![id, status],
        )?;
        Ok(())
    }

    /// Record a successful restart with the sampled process state
    pub async fn record_restart(
        &self,
        id: i64,
        pid: Option<u32>,
        memory_mb: Option<f64>,
        cpu_percent: Option<f64>,
    ) -> Result<(), DeployerError> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE services
             SET status = 'running', pid = ?2, memory_usage = ?3, cpu_usage = ?4,
                 restart_count = restart_count + 1, last_restart = ?5
             WHERE id = ?1",
            params![id, pid, memory_mb, cpu_percent, Utc::now()],
        )?;
        Ok(())
    }

    /// Store a probe outcome and touch the service's last check time
    pub async fn record_health_check(
        &self,
        service_id: i64,
        result: &ProbeResult,
    ) -> Result<HealthCheck, DeployerError> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let now = Utc::now();

        tx.execute(
            "INSERT INTO health_checks (service_id, is_healthy, response_time, error_message,
                                        checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                service_id,
                result.is_healthy,
                result.response_time,
                result.error_message,
                now
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE services SET last_health_check = ?2 WHERE id = ?1",
            params![service_id, now],
        )?;
        tx.commit()?;

        Ok(HealthCheck {
            id,
            service_id,
            is_healthy: result.is_healthy,
            response_time: result.response_time,
            error_message: result.error_message.clone(),
            checked_at: now,
        })
    }

    pub async fn list_health_checks(
        &self,
        service_id: i64,
    ) -> Result<Vec<HealthCheck>, DeployerError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, service_id, is_healthy, response_time, error_message, checked_at
             FROM health_checks WHERE service_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([service_id], |row| {
            Ok(HealthCheck {
                id: row.get(0)?,
                service_id: row.get(1)?,
                is_healthy: row.get(2)?,
                response_time: row.get(3)?,
                error_message: row.get(4)?,
                checked_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::project::{EnvironmentName, NewProject};
    use crate::models::service::ServiceType;

    fn spec(name: &str, service_type: ServiceType, port: Option<u16>) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            service_type,
            command: format!("run {}", name),
            port,
            health_check_endpoint: None,
            max_memory: 2048,
            max_cpu: 1.0,
        }
    }

    async fn setup() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let (_, envs) = store
            .create_project(
                NewProject {
                    name: "shop_app".to_string(),
                    repo_url: "repo".to_string(),
                    branch: "main".to_string(),
                    start_port: 8000,
                    deploy_key: None,
                    webhook_secret: "s".to_string(),
                    description: String::new(),
                },
                &[EnvironmentName::Qa],
            )
            .await
            .unwrap();
        (store, envs[0].id)
    }

    fn scope(env: i64) -> ServiceScope<'static> {
        ServiceScope {
            environment_id: env,
            project: "shop_app",
            environment: "qa",
            start_port: 8000,
        }
    }

    #[tokio::test]
    async fn test_reconcile_allocates_around_taken_ports() {
        let (store, env) = setup().await;
        store
            .reconcile_services(
                scope(env),
                &[
                    spec("a", ServiceType::Web, Some(8000)),
                    spec("b", ServiceType::Web, Some(8001)),
                    spec("c", ServiceType::Web, Some(8003)),
                ],
            )
            .await
            .unwrap();

        let services = store
            .reconcile_services(scope(env), &[spec("d", ServiceType::Web, None)])
            .await
            .unwrap();
        assert_eq!(services[0].port, Some(8002));
        assert_eq!(services[0].supervisor_name, "shop-app-qa-d");
    }

    #[tokio::test]
    async fn test_reconcile_updates_by_name_and_keeps_undeclared() {
        let (store, env) = setup().await;
        let first = store
            .reconcile_services(
                scope(env),
                &[
                    spec("web", ServiceType::Web, None),
                    spec("worker", ServiceType::Worker, None),
                ],
            )
            .await
            .unwrap();
        assert_eq!(first[0].port, Some(8000));
        assert_eq!(first[1].port, None);

        let mut changed = spec("web", ServiceType::Web, None);
        changed.command = "gunicorn app:wsgi".to_string();
        let second = store.reconcile_services(scope(env), &[changed]).await.unwrap();

        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].port, Some(8000));
        assert_eq!(second[0].command, "gunicorn app:wsgi");
        assert_eq!(store.list_services(env).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_health_check_touches_service() {
        let (store, env) = setup().await;
        let services = store
            .reconcile_services(scope(env), &[spec("web", ServiceType::Web, None)])
            .await
            .unwrap();
        let id = services[0].id;

        store
            .record_health_check(
                id,
                &ProbeResult {
                    is_healthy: true,
                    response_time: Some(0.01),
                    error_message: None,
                },
            )
            .await
            .unwrap();
        store.record_restart(id, Some(42), Some(12.5), Some(0.5)).await.unwrap();

        let service = store.get_service(id).await.unwrap();
        assert!(service.last_health_check.is_some());
        assert_eq!(service.status, ServiceStatus::Running);
        assert_eq!(service.pid, Some(42));
        assert_eq!(service.restart_count, 1);
        assert_eq!(store.list_health_checks(id).await.unwrap().len(), 1);
    }
}
