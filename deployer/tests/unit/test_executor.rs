//! Deploy pipeline scenarios

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use secrecy::SecretString;

use deployer::deploy::executor::RECOVERY_INITIATOR;
use deployer::errors::DeployerError;
use deployer::manage;
use deployer::models::deployment::{DeploymentStatus, NewDeployment};
use deployer::models::service::ServiceStatus;

use crate::common::{Harness, CONFIG, ENV, PROJECT};

#[tokio::test]
async fn test_happy_path_activates_release() {
    let h = Harness::new().await;
    manage::set_secret(
        &h.store,
        &h.secrets,
        PROJECT,
        ENV,
        "DATABASE_URL",
        SecretString::from("postgres://db/shop".to_string()),
    )
    .await
    .unwrap();

    let deployment = h.deploy().await.unwrap();

    assert_eq!(deployment.status, DeploymentStatus::Active);
    assert!(deployment.completed_at.is_some());
    assert_eq!(deployment.commit_sha.as_deref().map(str::len), Some(40));
    assert_eq!(deployment.initiated_by, "tester");

    // Release materialized and live
    let release = PathBuf::from(deployment.release_path.clone().unwrap());
    assert!(release.join("deploy.yaml").is_file());
    assert!(!release.join(".git").exists());
    assert_eq!(h.current_target(), Some(release.clone()));

    // Hooks ran inside the release with the assembled environment
    assert_eq!(
        std::fs::read_to_string(release.join("pre_deploy.txt")).unwrap().trim(),
        deployment.version
    );
    assert!(release.join("post_deploy.txt").is_file());

    // Dependencies installed from the release's manifest
    assert_eq!(
        *h.runtime.installs.lock().unwrap(),
        vec![release.join("requirements.txt")]
    );

    // Supervisor programs
    let runtime_bin = h.layout.runtime_dir(PROJECT, ENV).path().join("bin");
    let programs = h.supervisor.programs.lock().unwrap().clone();
    let web = &programs["shop-qa-web"];
    assert_eq!(
        web.command,
        format!("{}/gunicorn --bind 127.0.0.1:8000 shop.wsgi", runtime_bin.display())
    );
    assert_eq!(web.directory, h.layout.current_link(PROJECT, ENV));
    assert_eq!(web.user, "deploy");
    assert_eq!(web.environment["PORT"], "8000");
    assert_eq!(web.environment["DATABASE_URL"], "postgres://db/shop");
    assert_eq!(web.environment["DEPLOYMENT_VERSION"], deployment.version);
    let worker = &programs["shop-qa-worker"];
    assert_eq!(
        worker.command,
        format!("{}/celery -A shop worker -Q shop-qa", runtime_bin.display())
    );
    assert!(!worker.environment.contains_key("PORT"));
    assert_eq!(h.supervisor.config_reloads.load(Ordering::SeqCst), 1);

    // Proxy
    let sites = h.proxy.sites.lock().unwrap().clone();
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].ports, vec![8000]);
    assert_eq!(h.proxy.reloads.load(Ordering::SeqCst), 1);

    // Services restarted and probed
    let services = h.store.list_services(h.environment_id).await.unwrap();
    assert_eq!(services.len(), 2);
    for service in &services {
        assert_eq!(service.status, ServiceStatus::Running);
        assert_eq!(service.restart_count, 1);
    }
    let web_service = services.iter().find(|s| s.name == "web").unwrap();
    let checks = h.store.list_health_checks(web_service.id).await.unwrap();
    assert_eq!(checks.len(), 1);
    assert!(checks[0].is_healthy);
    assert_eq!(*h.prober.probes.lock().unwrap(), vec![(8000, "/health/".to_string())]);

    // Parsed config stored on the environment
    let env = h.store.get_environment(h.environment_id).await.unwrap();
    assert_eq!(env.config["name"], "shop");

    let messages = h.log_messages(deployment.id).await;
    assert!(messages.iter().any(|m| m == "[cloning] Fetching source"));
    assert!(messages.iter().any(|m| m == "[testing] Running health checks"));
    assert_eq!(messages.last().unwrap(), "Deployment completed successfully");
}

#[tokio::test]
async fn test_missing_config_fails_without_recovery_target() {
    let h = Harness::new().await;
    h.source.remove_file("deploy.yaml");

    let err = h.deploy().await.unwrap_err();
    assert!(matches!(err, DeployerError::ConfigError(_)));

    let deployments = h.deployments().await;
    assert_eq!(deployments.len(), 1);
    let failed = &deployments[0];
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .contains("No deployment configuration found"));
    assert!(failed.completed_at.is_some());

    let messages = h.log_messages(failed.id).await;
    assert!(messages.iter().any(|m| m.starts_with("Deployment failed:")));
    assert!(messages.iter().any(|m| m == "No previous release to recover to"));
    assert!(h.current_target().is_none());
    assert!(h.supervisor.restarts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_health_failure_rolls_back_to_active_release() {
    let h = Harness::new().await;
    let v1 = h.deploy().await.unwrap();
    let v1_release = PathBuf::from(v1.release_path.clone().unwrap());

    h.set_healthy(false);
    let err = h.deploy().await.unwrap_err();
    assert!(matches!(err, DeployerError::HealthCheckFailure(ref m) if m.contains("web: Status code: 500")));

    let deployments = h.deployments().await;
    assert_eq!(deployments.len(), 3);
    let (first, failed, record) = (&deployments[0], &deployments[1], &deployments[2]);

    assert_eq!(first.id, v1.id);
    assert_eq!(first.status, DeploymentStatus::Active);
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert!(failed.error_message.as_deref().unwrap().starts_with("Health check failed"));

    assert_eq!(record.rollback_from, Some(failed.id));
    assert_eq!(record.initiated_by, RECOVERY_INITIATOR);
    assert_eq!(record.release_path, v1.release_path);
    assert_eq!(record.commit_sha, v1.commit_sha);
    assert!(record.version.starts_with("rollback-"));
    assert_eq!(record.status, DeploymentStatus::Inactive);

    assert_eq!(h.current_target(), Some(v1_release));
    assert_eq!(h.count_with(DeploymentStatus::Active).await, 1);

    let messages = h.log_messages(failed.id).await;
    assert!(messages
        .iter()
        .any(|m| m.starts_with("Recovered with rollback record rollback-")));
}

#[tokio::test]
async fn test_failed_hook_fails_deployment() {
    let h = Harness::new().await;
    h.source.set_file(
        "deploy.yaml",
        &CONFIG.replace(
            "echo $DEPLOYMENT_VERSION > pre_deploy.txt",
            "echo migration exploded >&2; exit 3",
        ),
    );

    let err = h.deploy().await.unwrap_err();
    match err {
        DeployerError::ExternalCommand { message, .. } => {
            assert!(message.contains("migration exploded"))
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.count_with(DeploymentStatus::Failed).await, 1);
    assert!(h.supervisor.programs.lock().unwrap().is_empty());
    assert!(h.current_target().is_none());
}

#[tokio::test]
async fn test_clone_failure_is_recorded() {
    let h = Harness::new().await;
    h.source.fail_clone.store(true, Ordering::SeqCst);

    let err = h.deploy().await.unwrap_err();
    assert!(matches!(err, DeployerError::ExternalCommand { .. }));
    let deployments = h.deployments().await;
    assert_eq!(deployments[0].status, DeploymentStatus::Failed);
    assert!(deployments[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("Repository not found"));
}

#[tokio::test]
async fn test_concurrent_deploy_is_rejected() {
    let h = Harness::new().await;
    let in_flight = h
        .store
        .admit_deployment(NewDeployment::pending(
            h.environment_id,
            "20240101-000000".to_string(),
            "other",
        ))
        .await
        .unwrap();

    let err = h.deploy().await.unwrap_err();
    assert!(matches!(err, DeployerError::Conflict(_)));
    assert!(err.is_rejection());

    let deployments = h.deployments().await;
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].id, in_flight.id);
    assert_eq!(deployments[0].status, DeploymentStatus::Pending);
}

#[tokio::test]
async fn test_unknown_or_inactive_targets_are_not_found() {
    let h = Harness::new().await;
    assert!(matches!(
        h.executor.deploy("nope", ENV, None, "t").await,
        Err(DeployerError::NotFound(_))
    ));
    assert!(matches!(
        h.executor.deploy(PROJECT, "prod", None, "t").await,
        Err(DeployerError::NotFound(_))
    ));
    assert!(matches!(
        h.executor.deploy(PROJECT, "dev", None, "t").await,
        Err(DeployerError::NotFound(_))
    ));

    manage::deregister_project(&h.store, PROJECT).await.unwrap();
    assert!(matches!(h.deploy().await, Err(DeployerError::NotFound(_))));
    assert!(h.deployments().await.is_empty());
}

#[tokio::test]
async fn test_failed_restart_does_not_abort_pipeline() {
    let h = Harness::new().await;
    h.supervisor
        .broken
        .lock()
        .unwrap()
        .push("shop-qa-worker".to_string());

    let deployment = h.deploy().await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Active);

    let services = h.store.list_services(h.environment_id).await.unwrap();
    let worker = services.iter().find(|s| s.name == "worker").unwrap();
    assert_eq!(worker.status, ServiceStatus::Failed);

    let logs = h.store.list_logs(deployment.id).await.unwrap();
    assert!(logs.iter().any(|l| {
        l.level == deployer::models::log::Severity::Error
            && l.message.starts_with("Failed to restart service worker")
    }));
}

#[tokio::test]
async fn test_services_keep_ports_across_deploys() {
    let h = Harness::new().await;
    h.deploy().await.unwrap();
    h.source.set_file(
        "deploy.yaml",
        &format!(
            "{}  - name: api\n    type: web\n    command: gunicorn api.wsgi --bind 127.0.0.1:${{PORT}}\n    health_check: /ping\n",
            CONFIG.trim_end().to_string() + "\n"
        ),
    );
    h.deploy().await.unwrap();

    let services = h.store.list_services(h.environment_id).await.unwrap();
    let port_of = |name: &str| services.iter().find(|s| s.name == name).unwrap().port;
    assert_eq!(port_of("web"), Some(8000));
    assert_eq!(port_of("api"), Some(8001));
    assert_eq!(port_of("worker"), None);

    let sites = h.proxy.sites.lock().unwrap().clone();
    assert_eq!(sites.last().unwrap().ports, vec![8000, 8001]);
}

#[tokio::test]
async fn test_old_releases_are_pruned() {
    let settings = deployer::storage::settings::ExecutorSettings {
        keep_releases: 2,
        ..Default::default()
    };
    let h = Harness::with_settings(settings).await;

    let mut releases = Vec::new();
    for _ in 0..4 {
        let d = h.deploy().await.unwrap();
        releases.push(PathBuf::from(d.release_path.unwrap()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    assert!(!releases[0].exists());
    assert!(!releases[1].exists());
    assert!(releases[2].exists());
    assert!(releases[3].exists());
    assert_eq!(h.current_target(), Some(releases[3].clone()));
}

#[tokio::test]
async fn test_reaped_pipeline_stops_at_next_stage() {
    let h = Harness::new().await;
    *h.runtime.reap_during_install.lock().unwrap() = Some(h.store.clone());

    let err = h.deploy().await.unwrap_err();
    assert!(matches!(err, DeployerError::Conflict(_)));

    let deployments = h.deployments().await;
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].status, DeploymentStatus::Failed);
    assert_eq!(
        deployments[0].error_message.as_deref(),
        Some("Deployment timed out")
    );

    // Nothing past the build stage ran
    assert!(h.supervisor.programs.lock().unwrap().is_empty());
    assert!(h.current_target().is_none());

    *h.runtime.reap_during_install.lock().unwrap() = None;
    let next = h.deploy().await.unwrap();
    assert_eq!(next.status, DeploymentStatus::Active);
    assert_eq!(h.count_with(DeploymentStatus::Active).await, 1);
}

#[tokio::test]
async fn test_worker_only_config_writes_no_proxy_site() {
    let h = Harness::new().await;
    h.source.set_file(
        "deploy.yaml",
        r#"
name: shop
services:
  - name: worker
    type: celery
    command: celery -A shop worker -Q ${QUEUE_NAME}
"#,
    );

    let deployment = h.deploy().await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Active);
    assert!(h.proxy.sites.lock().unwrap().is_empty());
    assert_eq!(h.proxy.reloads.load(Ordering::SeqCst), 0);
    assert!(h.prober.probes.lock().unwrap().is_empty());
    assert!(h.supervisor.programs.lock().unwrap().contains_key("shop-qa-worker"));
}
