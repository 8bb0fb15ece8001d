//! Resource sampling of supervised processes

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Point-in-time resource usage of one process
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,

    /// Resident memory in MB
    pub memory_mb: f64,

    /// CPU usage percentage, relative to one core
    pub cpu_percent: f64,
}

/// Sample a running process; `None` if it does not exist.
///
/// CPU usage needs two refreshes a minimum interval apart, so this waits
/// briefly between them.
pub async fn sample_process(pid: u32) -> Option<ProcessSample> {
    let pid = Pid::from_u32(pid);
    let kind = ProcessRefreshKind::nothing().with_memory().with_cpu();
    let mut sys = System::new();

    sys.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, kind);
    sys.process(pid)?;
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    sys.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, kind);

    let process = sys.process(pid)?;
    Some(ProcessSample {
        pid: pid.as_u32(),
        memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
        cpu_percent: f64::from(process.cpu_usage()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sample_own_process() {
        let sample = sample_process(std::process::id()).await.unwrap();
        assert_eq!(sample.pid, std::process::id());
        assert!(sample.memory_mb > 0.0);
        assert!(sample.cpu_percent >= 0.0);
    }

    #[tokio::test]
    async fn test_missing_process() {
        assert!(sample_process(u32::MAX - 1).await.is_none());
    }
}
