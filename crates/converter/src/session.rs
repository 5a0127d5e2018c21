//! The live connection a run works through.
//!
//! A run opens exactly one [`Session`], borrows it for every transfer and
//! remote command, and releases it exactly once when the run ends.
//! [`SshSession`] multiplexes everything over a single OpenSSH ControlMaster
//! so that a pool of workers shares one authenticated connection.
//! [`LocalSession`] runs the "remote" side on this machine.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;
use log::{debug, info, warn};

use crate::config::{ConvertConfig, RemoteConfig, Transport};
use crate::error::RunError;
use crate::exec::{run_process, ExecError, ExecOutput, RemoteExec};
use crate::shell;
use crate::transfer::{file_label, Direction, TransferChannel, TransferError};

/// Transfer and execution channels plus their lifecycle
#[async_trait]
pub trait Session: TransferChannel + RemoteExec {
    /// Human-readable description of the remote end, for logs
    fn describe(&self) -> String;

    /// Release the connection; only the first call has an effect
    async fn release(&self);
}

/// Open the session selected by `cfg.transport`
pub async fn open_session(cfg: &ConvertConfig, run_id: Uuid) -> Result<Arc<dyn Session>, RunError> {
    match cfg.transport {
        Transport::Ssh => {
            let session = SshSession::connect(&cfg.remote, run_id, cfg.transfer_timeout()).await?;
            Ok(Arc::new(session))
        }
        Transport::Local => Ok(Arc::new(LocalSession::new(cfg.transfer_timeout()))),
    }
}

/// OpenSSH ControlMaster connection shared by every operation of a run
pub struct SshSession {
    remote: RemoteConfig,
    control_path: PathBuf,
    log_path: PathBuf,
    transfer_timeout: Duration,
    released: AtomicBool,
}

impl SshSession {
    fn new(remote: &RemoteConfig, run_id: Uuid, transfer_timeout: Duration) -> Self {
        let dir = remote.control_dir.clone().unwrap_or_else(std::env::temp_dir);
        // Unix socket paths are limited to ~100 bytes, keep the name short
        let token = run_id.simple().to_string();
        let token = &token[..12];
        Self {
            remote: remote.clone(),
            control_path: dir.join(format!("rconv-{}.sock", token)),
            log_path: dir.join(format!("rconv-{}.log", token)),
            transfer_timeout,
            released: AtomicBool::new(false),
        }
    }

    /// Start the ControlMaster and confirm it answers
    pub async fn connect(remote: &RemoteConfig, run_id: Uuid, transfer_timeout: Duration) -> Result<Self, RunError> {
        let session = Self::new(remote, run_id, transfer_timeout);
        let destination = remote.destination();
        info!("Connecting to {}...", destination);

        // -f backgrounds the master after authentication. Its stdio stays
        // attached, so nothing is piped here; errors go to the -E log file.
        let mut cmd = Command::new(&remote.ssh_bin);
        cmd.args(session.master_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let wait = Duration::from_secs(remote.connect_timeout_secs + 5);
        let status = match tokio::time::timeout(wait, cmd.status()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                session.released.store(true, Ordering::SeqCst);
                return Err(RunError::Connection {
                    destination,
                    reason: format!("failed to start {}: {}", remote.ssh_bin.display(), e),
                })
            }
            Err(_) => {
                // The master was killed with the timed-out future
                session.released.store(true, Ordering::SeqCst);
                session.cleanup_files();
                return Err(RunError::Connection {
                    destination,
                    reason: format!("no response after {:?}", wait),
                })
            }
        };

        if !status.success() {
            let log = std::fs::read_to_string(&session.log_path).unwrap_or_default();
            let _ = std::fs::remove_file(&session.log_path);
            // Nothing to release, keep Drop from trying
            session.released.store(true, Ordering::SeqCst);
            return Err(RunError::Connection {
                destination,
                reason: format!(
                    "ssh exited with code {}: {}",
                    status.code().unwrap_or(-1),
                    log.lines().last().unwrap_or("no output").trim()
                ),
            });
        }

        let mut check = Command::new(&remote.ssh_bin);
        check.args(session.control_args("check"));
        match run_process(check, "ssh -O check", Duration::from_secs(remote.connect_timeout_secs)).await {
            Ok(out) if out.success() => {}
            Ok(out) => {
                session.release().await;
                return Err(RunError::Connection {
                    destination,
                    reason: format!("control master not answering ({})", out.brief()),
                });
            }
            Err(e) => {
                session.release().await;
                return Err(RunError::Connection {
                    destination,
                    reason: e.to_string(),
                });
            }
        }

        info!("Connected to {}", destination);
        Ok(session)
    }

    fn connection_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.remote.connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-p".to_string(),
            self.remote.port.to_string(),
        ];
        if let Some(identity) = &self.remote.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    fn master_args(&self) -> Vec<String> {
        let mut args = vec![
            "-M".to_string(),
            "-N".to_string(),
            "-f".to_string(),
            "-S".to_string(),
            self.control_path.display().to_string(),
            "-E".to_string(),
            self.log_path.display().to_string(),
        ];
        args.extend(self.connection_args());
        args.push(self.remote.destination());
        args
    }

    /// Arguments for a multiplexed client running `remote_command`
    fn mux_args(&self, remote_command: &str) -> Vec<String> {
        let mut args = vec![
            "-S".to_string(),
            self.control_path.display().to_string(),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
        ];
        args.extend(self.connection_args());
        args.push(self.remote.destination());
        args.push(remote_command.to_string());
        args
    }

    /// Arguments for `ssh -O <op>` against the master
    fn control_args(&self, op: &str) -> Vec<String> {
        vec![
            "-S".to_string(),
            self.control_path.display().to_string(),
            "-O".to_string(),
            op.to_string(),
            self.remote.destination(),
        ]
    }

    fn mux_command(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new(&self.remote.ssh_bin);
        cmd.args(self.mux_args(remote_command));
        cmd
    }

    fn cleanup_files(&self) {
        for p in [&self.control_path, &self.log_path] {
            if let Err(e) = std::fs::remove_file(p) {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!("Failed to remove {}: {}", p.display(), e);
                }
            }
        }
    }
}

/// Grace period between TERM and KILL for a remote command past its deadline
const REMOTE_KILL_AFTER_SECS: u64 = 5;

/// Wrap `command` so the remote host enforces `timeout` on its own
///
/// A command without a tty keeps running when the local ssh client is
/// killed, so the deadline has to be applied on the far side too.
fn with_remote_deadline(command: &str, timeout: Duration) -> Result<String, ExecError> {
    let quoted = shell::quote(command).map_err(|e| ExecError::Spawn {
        command: command.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e.to_string()),
    })?;
    Ok(format!(
        "timeout -k {} {} sh -c {}",
        REMOTE_KILL_AFTER_SECS,
        timeout.as_secs().max(1),
        quoted
    ))
}

#[async_trait]
impl RemoteExec for SshSession {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecOutput, ExecError> {
        debug!("ssh {}: {}", self.remote.destination(), command);
        let wrapped = with_remote_deadline(command, timeout)?;
        run_process(self.mux_command(&wrapped), command, timeout).await
    }
}

#[async_trait]
impl TransferChannel for SshSession {
    async fn push(&self, local: &Path, remote: &str) -> Result<(), TransferError> {
        let label = file_label(remote);
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| TransferError::new(&label, Direction::Push, e))?;
        let quoted = shell::quote(remote)
            .map_err(|e| TransferError::new(&label, Direction::Push, io::Error::new(io::ErrorKind::InvalidInput, e.to_string())))?;

        let mut cmd = self.mux_command(&format!("cat > {}", quoted));
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| TransferError::new(&label, Direction::Push, e))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransferError::remote(&label, Direction::Push, "ssh stdin unavailable"))?;

        let work = async move {
            let copied = tokio::io::copy(&mut file, &mut stdin).await;
            let _ = stdin.shutdown().await;
            drop(stdin);
            let output = child.wait_with_output().await?;
            Ok::<_, io::Error>((copied, output))
        };

        let (copied, output) = match tokio::time::timeout(self.transfer_timeout, work).await {
            Ok(result) => result.map_err(|e| TransferError::new(&label, Direction::Push, e))?,
            Err(_) => return Err(TransferError::timed_out(&label, Direction::Push, self.transfer_timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransferError::remote(
                &label,
                Direction::Push,
                format!("exit code {}: {}", output.status.code().unwrap_or(-1), stderr.trim()),
            ));
        }
        let bytes = copied.map_err(|e| TransferError::new(&label, Direction::Push, e))?;
        debug!("Pushed {} ({} bytes)", label, bytes);
        Ok(())
    }

    async fn pull(&self, remote: &str, local: &Path) -> Result<(), TransferError> {
        let label = file_label(remote);
        let quoted = shell::quote(remote)
            .map_err(|e| TransferError::new(&label, Direction::Pull, io::Error::new(io::ErrorKind::InvalidInput, e.to_string())))?;
        let mut file = tokio::fs::File::create(local)
            .await
            .map_err(|e| TransferError::new(&label, Direction::Pull, e))?;

        let mut cmd = self.mux_command(&format!("cat {}", quoted));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| TransferError::new(&label, Direction::Pull, e))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransferError::remote(&label, Direction::Pull, "ssh stdout unavailable"))?;

        let work = async move {
            let copied = tokio::io::copy(&mut stdout, &mut file).await;
            file.flush().await?;
            let output = child.wait_with_output().await?;
            Ok::<_, io::Error>((copied, output))
        };

        let (copied, output) = match tokio::time::timeout(self.transfer_timeout, work).await {
            Ok(result) => result.map_err(|e| TransferError::new(&label, Direction::Pull, e))?,
            Err(_) => return Err(TransferError::timed_out(&label, Direction::Pull, self.transfer_timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransferError::remote(
                &label,
                Direction::Pull,
                format!("exit code {}: {}", output.status.code().unwrap_or(-1), stderr.trim()),
            ));
        }
        let bytes = copied.map_err(|e| TransferError::new(&label, Direction::Pull, e))?;
        debug!("Pulled {} ({} bytes)", label, bytes);
        Ok(())
    }
}

#[async_trait]
impl Session for SshSession {
    fn describe(&self) -> String {
        format!("ssh://{}:{}", self.remote.destination(), self.remote.port)
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut cmd = Command::new(&self.remote.ssh_bin);
        cmd.args(self.control_args("exit"));
        match run_process(cmd, "ssh -O exit", Duration::from_secs(10)).await {
            Ok(out) if out.success() => debug!("Closed control master {}", self.control_path.display()),
            Ok(out) => warn!("Closing ssh control master returned {}", out.brief()),
            Err(e) => warn!("Failed to close ssh control master: {}", e),
        }
        self.cleanup_files();
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("ssh session dropped without release, closing control master");
        let _ = std::process::Command::new(&self.remote.ssh_bin)
            .args(self.control_args("exit"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        self.cleanup_files();
    }
}

/// Runs the "remote" side through `sh -c` on this machine
pub struct LocalSession {
    transfer_timeout: Duration,
    released: AtomicBool,
}

impl LocalSession {
    pub fn new(transfer_timeout: Duration) -> Self {
        Self {
            transfer_timeout,
            released: AtomicBool::new(false),
        }
    }

    async fn copy(&self, from: &Path, to: &Path, label: &str, direction: Direction) -> Result<(), TransferError> {
        match tokio::time::timeout(self.transfer_timeout, tokio::fs::copy(from, to)).await {
            Ok(Ok(bytes)) => {
                debug!("Copied {} ({} bytes)", label, bytes);
                Ok(())
            }
            Ok(Err(e)) => Err(TransferError::new(label, direction, e)),
            Err(_) => Err(TransferError::timed_out(label, direction, self.transfer_timeout)),
        }
    }
}

#[async_trait]
impl RemoteExec for LocalSession {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecOutput, ExecError> {
        debug!("sh -c: {}", command);
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        run_process(cmd, command, timeout).await
    }
}

#[async_trait]
impl TransferChannel for LocalSession {
    async fn push(&self, local: &Path, remote: &str) -> Result<(), TransferError> {
        self.copy(local, Path::new(remote), &file_label(remote), Direction::Push).await
    }

    async fn pull(&self, remote: &str, local: &Path) -> Result<(), TransferError> {
        self.copy(Path::new(remote), local, &file_label(remote), Direction::Pull).await
    }
}

#[async_trait]
impl Session for LocalSession {
    fn describe(&self) -> String {
        "local shell".to_string()
    }

    async fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}
