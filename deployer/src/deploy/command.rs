//! Bounded execution of external commands

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::errors::DeployerError;
use crate::utils::tail;

/// Characters of stderr/stdout carried into error messages
const ERROR_TAIL: usize = 2000;

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Most useful text for an error report: stderr, else stdout
    pub fn failure_text(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let text = tail(text, ERROR_TAIL);
        if text.is_empty() {
            match self.code {
                Some(code) => format!("exit status {}", code),
                None => "terminated by signal".to_string(),
            }
        } else {
            text
        }
    }
}

/// Run `cmd` to completion within `timeout`, capturing its output.
///
/// The child is killed when the timeout elapses. A non-zero exit is not an
/// error here; see [`run_checked`].
pub async fn run(
    mut cmd: Command,
    label: &str,
    timeout: Duration,
) -> Result<CommandOutput, DeployerError> {
    debug!("Running `{}` (timeout {}s)", label, timeout.as_secs());

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| DeployerError::command(label, format!("failed to start: {}", e)))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(DeployerError::command(label, e.to_string())),
        Err(_) => Err(DeployerError::command(
            label,
            format!("timed out after {}s", timeout.as_secs()),
        )),
    }
}

/// Like [`run`], but a non-zero exit becomes an `ExternalCommand` error
pub async fn run_checked(
    cmd: Command,
    label: &str,
    timeout: Duration,
) -> Result<CommandOutput, DeployerError> {
    let output = run(cmd, label, timeout).await?;
    if !output.success() {
        return Err(DeployerError::command(label, output.failure_text()));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[tokio::test]
    async fn test_captures_output() {
        let output = run(sh("echo out; echo err >&2"), "echo", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error_when_checked() {
        let err = run_checked(sh("echo broken >&2; exit 3"), "fail", Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            DeployerError::ExternalCommand { command, message } => {
                assert_eq!(command, "fail");
                assert_eq!(message, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let err = run(sh("sleep 5"), "sleep", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let err = run(
            Command::new("definitely-not-a-real-binary-xyz"),
            "missing",
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }
}
