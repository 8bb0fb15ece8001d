//! Reaper, monitor and trigger dispatch

use std::time::Duration;

use deploy_api::{DeployRequest, RollbackRequest, TriggerRequest};
use deployer::app::trigger;
use deployer::errors::DeployerError;
use deployer::models::deployment::{DeploymentStatus, NewDeployment};
use deployer::workers::{monitor, reaper};

use crate::common::{Harness, ENV, PROJECT};

#[tokio::test]
async fn test_reaper_fails_stuck_deployments() {
    let h = Harness::new().await;
    let stuck = h
        .store
        .admit_deployment(NewDeployment::pending(
            h.environment_id,
            "stuck".to_string(),
            "ci",
        ))
        .await
        .unwrap();

    // Not old enough yet
    assert_eq!(reaper::sweep(&h.executor, Duration::from_secs(30 * 60)).await, 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(reaper::sweep(&h.executor, Duration::ZERO).await, 1);

    let reaped = h.store.get_deployment(stuck.id).await.unwrap();
    assert_eq!(reaped.status, DeploymentStatus::Failed);
    assert_eq!(
        reaped.error_message.as_deref(),
        Some("Deployment timed out after 0 minutes")
    );

    // The environment accepts deployments again
    h.deploy().await.unwrap();
}

#[tokio::test]
async fn test_manual_cleanup() {
    let h = Harness::new().await;
    let err = h.executor.cleanup_in_flight(PROJECT, ENV).await.unwrap_err();
    assert!(matches!(err, DeployerError::NotFound(_)));

    h.store
        .admit_deployment(NewDeployment::pending(
            h.environment_id,
            "wedged".to_string(),
            "ci",
        ))
        .await
        .unwrap();
    let cleaned = h.executor.cleanup_in_flight(PROJECT, ENV).await.unwrap();
    assert_eq!(cleaned.status, DeploymentStatus::Failed);
    assert_eq!(cleaned.error_message.as_deref(), Some("Manually cleaned up"));
}

#[tokio::test]
async fn test_monitor_records_health_without_touching_deployments() {
    let h = Harness::new().await;
    assert_eq!(monitor::sweep(&h.executor).await, monitor::Round::default());

    let deployment = h.deploy().await.unwrap();
    h.set_healthy(false);

    let round = monitor::sweep(&h.executor).await;
    assert_eq!(
        round,
        monitor::Round {
            environments: 1,
            healthy: 0,
            unhealthy: 1,
        }
    );

    let services = h.store.list_services(h.environment_id).await.unwrap();
    let web = services.iter().find(|s| s.name == "web").unwrap();
    let checks = h.store.list_health_checks(web.id).await.unwrap();
    assert_eq!(checks.len(), 2);
    assert!(!checks[1].is_healthy);
    assert!(web.last_health_check.is_some());
    assert_eq!(
        h.store.get_deployment(deployment.id).await.unwrap().status,
        DeploymentStatus::Active
    );
}

#[tokio::test]
async fn test_reaper_worker_stops_on_shutdown() {
    let h = Harness::new().await;
    let options = reaper::Options {
        interval: Duration::from_secs(3600),
        stuck_after: Duration::from_secs(60),
        initial_delay: Duration::ZERO,
    };
    let (tx, mut rx) = tokio::sync::broadcast::channel::<()>(1);
    let executor = h.executor.clone();

    let handle = tokio::spawn(async move {
        reaper::run(
            &options,
            executor.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = rx.recv().await;
            }),
        )
        .await;
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_trigger_dispatch_and_spawn() {
    let h = Harness::new().await;

    let first = trigger::dispatch(
        &h.executor,
        TriggerRequest::Deploy(DeployRequest {
            project: PROJECT.to_string(),
            environment: ENV.to_string(),
            commit: None,
            initiator: "webhook".to_string(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(first.initiated_by, "webhook");

    let second = trigger::spawn(
        h.executor.clone(),
        TriggerRequest::Deploy(DeployRequest {
            project: PROJECT.to_string(),
            environment: ENV.to_string(),
            commit: Some("abc123".to_string()),
            initiator: "scheduler".to_string(),
        }),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(second.commit_sha.as_deref(), Some("abc123"));

    let record = trigger::dispatch(
        &h.executor,
        TriggerRequest::Rollback(RollbackRequest {
            project: PROJECT.to_string(),
            environment: ENV.to_string(),
            initiator: "ops".to_string(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(record.rollback_from, Some(second.id));
    assert_eq!(
        h.store.get_deployment(first.id).await.unwrap().status,
        DeploymentStatus::Active
    );
}
