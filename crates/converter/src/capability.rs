use std::time::Duration;
use log::{info, warn};
use crate::config::CapabilityConfig;
use crate::error::RunError;
use crate::exec::RemoteExec;

/// What the capability check had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityState {
    /// Probe succeeded, nothing installed
    Present,
    /// Probe failed, install and verify succeeded
    Installed,
}

/// Probe for the remote tool, install it only if absent, then verify
///
/// Idempotent across runs. Any failure is fatal: no item could succeed.
pub async fn ensure_capability<E: RemoteExec + ?Sized>(
    exec: &E,
    cap: &CapabilityConfig,
    timeout: Duration,
) -> Result<CapabilityState, RunError> {
    info!("Ensuring remote tool is available: {}", cap.probe);

    let probe = exec.run(&cap.probe, timeout).await.map_err(|e| RunError::Capability {
        step: "probe",
        reason: e.to_string(),
    })?;
    if probe.success() {
        info!("Remote tool present");
        return Ok(CapabilityState::Present);
    }

    warn!("Remote tool missing ({}), installing...", probe.brief());
    let install = exec.run(&cap.install, timeout).await.map_err(|e| RunError::Capability {
        step: "install",
        reason: e.to_string(),
    })?;
    if !install.success() {
        return Err(RunError::Capability {
            step: "install",
            reason: install.brief(),
        });
    }

    let verify = exec.run(&cap.verify, timeout).await.map_err(|e| RunError::Capability {
        step: "verify",
        reason: e.to_string(),
    })?;
    if !verify.success() {
        return Err(RunError::Capability {
            step: "verify",
            reason: verify.brief(),
        });
    }

    info!("✅ Remote tool installed");
    Ok(CapabilityState::Installed)
}
