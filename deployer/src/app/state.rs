//! Application state management

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::deploy::executor::{Adapters, DeploymentExecutor, ExecutorOptions};
use crate::deploy::git::GitCli;
use crate::deploy::health::HttpProber;
use crate::deploy::proxy::Nginx;
use crate::deploy::runtime::PythonVenv;
use crate::deploy::supervisor::Supervisorctl;
use crate::errors::DeployerError;
use crate::secrets::SecretStore;
use crate::storage::settings::Settings;
use crate::store::Store;

/// Everything a command or the daemon needs, built once at start-up
pub struct AppState {
    pub settings: Settings,
    pub store: Store,
    pub secrets: Arc<SecretStore>,
    pub executor: Arc<DeploymentExecutor>,
}

impl AppState {
    /// Open the database, resolve the encryption key and wire the executor
    /// to the host's git, runtime, supervisor, proxy and HTTP prober.
    pub async fn init(settings: Settings) -> Result<Self, DeployerError> {
        info!("Initializing deployer state...");

        let store = Store::open(&settings.database_path).await?;
        let secrets = Arc::new(SecretStore::from_settings(&settings.secrets).await?);

        let exec = &settings.executor;
        let adapters = Adapters {
            source: Arc::new(GitCli::new(Duration::from_secs(exec.git_timeout_secs))),
            runtime: Arc::new(PythonVenv::new(Duration::from_secs(exec.install_timeout_secs))),
            supervisor: Arc::new(Supervisorctl::new(&settings.supervisor)),
            proxy: Arc::new(Nginx::new(&settings.proxy)),
            prober: Arc::new(HttpProber::new(exec.probe_timeout())?),
        };
        let options = ExecutorOptions {
            layout: settings.layout(),
            settings: exec.clone(),
            run_as_user: settings.supervisor.run_as_user.clone(),
        };
        let executor = Arc::new(DeploymentExecutor::new(
            store.clone(),
            secrets.clone(),
            adapters,
            options,
        ));

        Ok(Self {
            settings,
            store,
            secrets,
            executor,
        })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), DeployerError> {
        info!("Shutting down application state...");
        Ok(())
    }
}
