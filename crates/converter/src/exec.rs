use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use log::debug;

/// Result of one remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr line, falling back to stdout, for short failure reasons
    pub fn brief(&self) -> String {
        let pick = |s: &str| s.lines().rev().find(|l| !l.trim().is_empty()).map(|l| l.trim().to_string());
        let detail = pick(&self.stderr).or_else(|| pick(&self.stdout));
        match detail {
            Some(line) => format!("exit code {}: {}", self.exit_code, line),
            None => format!("exit code {}", self.exit_code),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error while running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },
}

/// Runs one shell-level command on the remote side
///
/// The channel never interprets output: a non-zero exit code is returned as
/// data, and it is up to the caller to decide what it means.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecOutput, ExecError>;
}

/// Run a prepared process to completion, killing it if `timeout` elapses
///
/// `label` is the command as the caller thinks of it (the remote command
/// line, not the local `ssh ...` wrapper) and is used in errors.
pub(crate) async fn run_process(
    mut cmd: Command,
    label: &str,
    timeout: Duration,
) -> Result<ExecOutput, ExecError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| ExecError::Spawn {
        command: label.to_string(),
        source,
    })?;

    // Dropping the future on timeout drops the child, which kills it
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| ExecError::Io {
            command: label.to_string(),
            source,
        })?,
        Err(_) => {
            return Err(ExecError::Timeout {
                command: label.to_string(),
                after: timeout,
            })
        }
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    debug!("`{}` exit code: {}, stdout length: {}, stderr length: {}", label, exit_code, stdout.len(), stderr.len());

    Ok(ExecOutput {
        exit_code,
        stdout,
        stderr,
    })
}
