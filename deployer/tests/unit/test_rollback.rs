//! Manual rollback and deployment invariants

use std::path::PathBuf;

use deployer::errors::DeployerError;
use deployer::models::deployment::DeploymentStatus;

use crate::common::Harness;

#[tokio::test]
async fn test_rollback_without_active_deployment() {
    let h = Harness::new().await;
    let err = h.rollback().await.unwrap_err();
    assert!(matches!(err, DeployerError::NoActiveDeployment(_)));
    assert!(h.deployments().await.is_empty());
}

#[tokio::test]
async fn test_rollback_with_no_history() {
    let h = Harness::new().await;
    h.deploy().await.unwrap();

    let err = h.rollback().await.unwrap_err();
    assert!(matches!(err, DeployerError::NothingToRollBack(_)));
    assert_eq!(h.deployments().await.len(), 1);
}

#[tokio::test]
async fn test_rollback_round_trip() {
    let h = Harness::new().await;
    let v1 = h.deploy().await.unwrap();
    let v2 = h.deploy().await.unwrap();
    assert_eq!(
        h.store.get_deployment(v1.id).await.unwrap().status,
        DeploymentStatus::Inactive
    );
    let restarts_before = h.supervisor.restarts.lock().unwrap().len();

    let record = h.rollback().await.unwrap();

    assert_eq!(record.rollback_from, Some(v2.id));
    assert_eq!(record.release_path, v1.release_path);
    assert_eq!(record.commit_sha, v1.commit_sha);
    assert!(record.completed_at.is_some());
    assert_eq!(
        h.store.get_deployment(v1.id).await.unwrap().status,
        DeploymentStatus::Active
    );
    assert_eq!(
        h.store.get_deployment(v2.id).await.unwrap().status,
        DeploymentStatus::RolledBack
    );
    assert_eq!(
        h.current_target(),
        Some(PathBuf::from(v1.release_path.clone().unwrap()))
    );

    // Pure switch-and-reload: nothing rebuilt, every service restarted once more
    assert_eq!(h.runtime.installs.lock().unwrap().len(), 2);
    assert_eq!(h.supervisor.restarts.lock().unwrap().len(), restarts_before + 2);

    // The rollback record is never itself a rollback target, and v2 is gone
    // from the candidates, so a second rollback has nowhere to go.
    let err = h.rollback().await.unwrap_err();
    assert!(matches!(err, DeployerError::NothingToRollBack(_)));
}

#[tokio::test]
async fn test_rollback_skips_pruned_releases() {
    let h = Harness::new().await;
    let v1 = h.deploy().await.unwrap();
    let v2 = h.deploy().await.unwrap();
    h.deploy().await.unwrap();
    std::fs::remove_dir_all(v2.release_path.clone().unwrap()).unwrap();

    h.rollback().await.unwrap();
    assert_eq!(
        h.store.get_deployment(v1.id).await.unwrap().status,
        DeploymentStatus::Active
    );
}

#[tokio::test]
async fn test_at_most_one_active_and_in_flight() {
    let h = Harness::new().await;
    h.deploy().await.unwrap();
    h.deploy().await.unwrap();
    h.set_healthy(false);
    h.deploy().await.unwrap_err();
    h.set_healthy(true);
    h.rollback().await.unwrap();
    h.deploy().await.unwrap();

    assert_eq!(h.count_with(DeploymentStatus::Active).await, 1);
    let in_flight = h
        .deployments()
        .await
        .iter()
        .filter(|d| d.status.is_in_flight())
        .count();
    assert_eq!(in_flight, 0);

    let versions: std::collections::HashSet<String> =
        h.deployments().await.into_iter().map(|d| d.version).collect();
    assert_eq!(versions.len(), h.deployments().await.len());
}

#[tokio::test]
async fn test_rollback_rejected_while_deploying() {
    let h = Harness::new().await;
    h.deploy().await.unwrap();
    h.deploy().await.unwrap();
    h.store
        .admit_deployment(deployer::models::deployment::NewDeployment::pending(
            h.environment_id,
            "in-flight".to_string(),
            "other",
        ))
        .await
        .unwrap();

    let err = h.rollback().await.unwrap_err();
    assert!(matches!(err, DeployerError::Conflict(_)));
    assert_eq!(h.count_with(DeploymentStatus::Active).await, 1);
}

#[tokio::test]
async fn test_second_rollback_reaches_older_release() {
    let h = Harness::new().await;
    let v1 = h.deploy().await.unwrap();
    let v2 = h.deploy().await.unwrap();
    let v3 = h.deploy().await.unwrap();

    let first = h.rollback().await.unwrap();
    assert_eq!(first.rollback_from, Some(v3.id));
    assert_eq!(first.release_path, v2.release_path);

    let second = h.rollback().await.unwrap();
    assert_eq!(second.rollback_from, Some(v2.id));
    assert_eq!(second.release_path, v1.release_path);

    for (id, expected) in [
        (v1.id, DeploymentStatus::Active),
        (v2.id, DeploymentStatus::RolledBack),
        (v3.id, DeploymentStatus::RolledBack),
    ] {
        assert_eq!(h.store.get_deployment(id).await.unwrap().status, expected);
    }
    assert_eq!(h.count_with(DeploymentStatus::Active).await, 1);
    assert_eq!(
        h.current_target(),
        Some(PathBuf::from(v1.release_path.clone().unwrap()))
    );
}
