//! Periodic health monitor of live environments

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::deploy::executor::DeploymentExecutor;
use crate::storage::settings::MonitorSettings;

/// Monitor worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Probe interval
    pub interval: Duration,

    /// Delay before the first round
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            initial_delay: Duration::from_secs(30),
        }
    }
}

impl From<&MonitorSettings> for Options {
    fn from(settings: &MonitorSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs),
            ..Self::default()
        }
    }
}

/// Result of one monitoring round
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Round {
    pub environments: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Probe every active environment that serves a release
pub async fn sweep(executor: &DeploymentExecutor) -> Round {
    let live = match executor.store().list_live_environments().await {
        Ok(live) => live,
        Err(e) => {
            error!("Failed to list live environments: {}", e);
            return Round::default();
        }
    };

    let mut round = Round::default();
    for (project, environment) in live {
        round.environments += 1;
        match executor
            .check_health(&project.name, environment.name.as_str())
            .await
        {
            Ok(checks) => {
                for (_, check) in &checks {
                    if check.is_healthy {
                        round.healthy += 1;
                    } else {
                        round.unhealthy += 1;
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Health check of {}/{} failed: {}",
                    project.name, environment.name, e
                );
            }
        }
    }
    round
}

/// Run the monitor worker
pub async fn run<S, F>(
    options: &Options,
    executor: &DeploymentExecutor,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Monitor worker starting...");

    tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Monitor worker shutting down...");
            return;
        }
        _ = sleep_fn(options.initial_delay) => {}
    }

    loop {
        let round = sweep(executor).await;
        debug!(
            "Monitor round: {} environments, {} healthy, {} unhealthy",
            round.environments, round.healthy, round.unhealthy
        );

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Monitor worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}
