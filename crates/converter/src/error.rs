use thiserror::Error;

/// Faults that abort a whole run
///
/// Per-item faults never surface here; they are recorded on the item and
/// reported through the run summary.
#[derive(Debug, Error)]
pub enum RunError {
    /// The session could not be established or was lost before items ran
    #[error("connection to {destination} failed: {reason}")]
    Connection { destination: String, reason: String },

    /// The per-run remote workspace could not be created
    #[error("could not create remote workspace {path}: {reason}")]
    Workspace { path: String, reason: String },

    /// The remote conversion tool is absent and could not be installed
    #[error("remote capability check failed at {step}: {reason}")]
    Capability { step: &'static str, reason: String },

    /// A path cannot be represented in a shell command (e.g. contains NUL)
    #[error("path cannot be passed to the remote shell: {0:?}")]
    InvalidPath(String),
}
