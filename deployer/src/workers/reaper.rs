//! Stuck-deployment reaper

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::deploy::executor::DeploymentExecutor;
use crate::storage::settings::ReaperSettings;

/// Reaper worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Sweep interval
    pub interval: Duration,

    /// Age after which an in-flight deployment is failed
    pub stuck_after: Duration,

    /// Delay before the first sweep
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            stuck_after: Duration::from_secs(30 * 60),
            initial_delay: Duration::from_secs(5),
        }
    }
}

impl From<&ReaperSettings> for Options {
    fn from(settings: &ReaperSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs),
            stuck_after: Duration::from_secs(settings.stuck_after_secs),
            ..Self::default()
        }
    }
}

/// One sweep; returns the number of deployments failed
pub async fn sweep(executor: &DeploymentExecutor, stuck_after: Duration) -> usize {
    match executor.reap_stuck(stuck_after).await {
        Ok(reaped) => {
            for deployment in &reaped {
                warn!(
                    "Reaped deployment #{} ({})",
                    deployment.id, deployment.version
                );
            }
            reaped.len()
        }
        Err(e) => {
            error!("Reaper sweep failed: {}", e);
            0
        }
    }
}

/// Run the reaper worker
pub async fn run<S, F>(
    options: &Options,
    executor: &DeploymentExecutor,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Reaper worker starting...");

    tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Reaper worker shutting down...");
            return;
        }
        _ = sleep_fn(options.initial_delay) => {}
    }

    loop {
        let reaped = sweep(executor, options.stuck_after).await;
        debug!("Reaper sweep done, {} deployments failed", reaped);

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Reaper worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}
