//! Daemon configuration options

use std::time::Duration;

use crate::storage::settings::Settings;
use crate::workers::{monitor, reaper};

/// Main daemon options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Enable the stuck-deployment reaper
    pub enable_reaper: bool,

    /// Enable the health monitor
    pub enable_monitor: bool,

    /// Reaper worker options
    pub reaper: reaper::Options,

    /// Monitor worker options
    pub monitor: monitor::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            enable_reaper: true,
            enable_monitor: true,
            reaper: reaper::Options::default(),
            monitor: monitor::Options::default(),
        }
    }
}

impl From<&Settings> for AppOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            enable_reaper: settings.reaper.enabled,
            enable_monitor: settings.monitor.enabled,
            reaper: reaper::Options::from(&settings.reaper),
            monitor: monitor::Options::from(&settings.monitor),
        }
    }
}

/// Lifecycle options for the daemon
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}
