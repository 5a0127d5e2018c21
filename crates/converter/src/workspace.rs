use std::time::Duration;
use uuid::Uuid;
use log::{info, warn};
use crate::error::RunError;
use crate::exec::RemoteExec;
use crate::shell;

/// Ephemeral remote scratch directory scoped to a single run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteWorkspace {
    root: String,
}

impl RemoteWorkspace {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }
        Self { root }
    }

    /// `<base>/<prefix>-<run id>`, unique per run
    pub fn for_run(base: &str, prefix: &str, run_id: Uuid) -> Self {
        let base = base.trim_end_matches('/');
        Self::new(format!("{}/{}-{}", base, prefix, run_id.simple()))
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Path of a file directly inside the workspace
    pub fn file_path(&self, file_name: &str) -> String {
        format!("{}/{}", self.root, file_name)
    }

    /// Ensure an empty workspace exists, wiping leftovers from an earlier attempt
    ///
    /// Failure here is fatal for the run.
    pub async fn create<E: RemoteExec + ?Sized>(&self, exec: &E, timeout: Duration) -> Result<(), RunError> {
        let quoted = shell::quote(&self.root)?;
        let cmd = format!("rm -rf {q} && mkdir -p {q}", q = quoted);
        info!("Creating remote workspace: {}", self.root);

        let out = exec.run(&cmd, timeout).await.map_err(|e| RunError::Workspace {
            path: self.root.clone(),
            reason: e.to_string(),
        })?;
        if !out.success() {
            return Err(RunError::Workspace {
                path: self.root.clone(),
                reason: out.brief(),
            });
        }
        Ok(())
    }

    /// Delete the workspace tree; removing a missing workspace is a no-op
    ///
    /// Never fails the run. Returns whether removal succeeded.
    pub async fn remove<E: RemoteExec + ?Sized>(&self, exec: &E, timeout: Duration) -> bool {
        let quoted = match shell::quote(&self.root) {
            Ok(q) => q,
            Err(e) => {
                warn!("Not removing remote workspace {}: {}", self.root, e);
                return false;
            }
        };
        info!("Cleaning up remote workspace: {}", self.root);

        match exec.run(&format!("rm -rf {}", quoted), timeout).await {
            Ok(out) if out.success() => true,
            Ok(out) => {
                warn!("⚠️  Failed to remove remote workspace {}: {}", self.root, out.brief());
                false
            }
            Err(e) => {
                warn!("⚠️  Failed to remove remote workspace {}: {}", self.root, e);
                false
            }
        }
    }
}
