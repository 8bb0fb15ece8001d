//! Trigger dispatch.
//!
//! CLI invocations, webhooks and scheduled jobs all arrive as a
//! [`TriggerRequest`] and reduce to one executor call. The call can be
//! awaited in place or spawned onto the runtime; the executor behaves the
//! same either way.

use std::sync::Arc;

use deploy_api::TriggerRequest;
use tokio::task::JoinHandle;
use tracing::info;

use crate::deploy::executor::DeploymentExecutor;
use crate::errors::DeployerError;
use crate::models::deployment::Deployment;

/// Run a trigger to completion
pub async fn dispatch(
    executor: &DeploymentExecutor,
    request: TriggerRequest,
) -> Result<Deployment, DeployerError> {
    info!(
        "Trigger for {}/{}: {:?}",
        request.project(),
        request.environment(),
        request
    );
    match request {
        TriggerRequest::Deploy(req) => {
            executor
                .deploy(
                    &req.project,
                    &req.environment,
                    req.commit.as_deref(),
                    &req.initiator,
                )
                .await
        }
        TriggerRequest::Rollback(req) => {
            executor
                .rollback(&req.project, &req.environment, &req.initiator)
                .await
        }
    }
}

/// Run a trigger as a background task
pub fn spawn(
    executor: Arc<DeploymentExecutor>,
    request: TriggerRequest,
) -> JoinHandle<Result<Deployment, DeployerError>> {
    tokio::spawn(async move { dispatch(executor.as_ref(), request).await })
}
