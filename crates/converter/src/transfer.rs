use std::fmt;
use std::io;
use std::path::Path;
use async_trait::async_trait;
use thiserror::Error;

/// Which way a file was moving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Push => f.write_str("upload"),
            Direction::Pull => f.write_str("download"),
        }
    }
}

/// A whole-file copy between the local side and the workspace failed
#[derive(Debug, Error)]
#[error("{direction} of {file} failed: {cause}")]
pub struct TransferError {
    /// File name being transferred
    pub file: String,
    pub direction: Direction,
    #[source]
    pub cause: io::Error,
}

impl TransferError {
    pub fn new(file: impl Into<String>, direction: Direction, cause: io::Error) -> Self {
        Self {
            file: file.into(),
            direction,
            cause,
        }
    }

    /// Wrap a non-zero exit of the transfer helper process
    pub fn remote(file: impl Into<String>, direction: Direction, detail: impl Into<String>) -> Self {
        Self::new(file, direction, io::Error::new(io::ErrorKind::Other, detail.into()))
    }

    pub fn timed_out(file: impl Into<String>, direction: Direction, after: std::time::Duration) -> Self {
        Self::new(
            file,
            direction,
            io::Error::new(io::ErrorKind::TimedOut, format!("no completion after {:?}", after)),
        )
    }
}

/// Identifier used in transfer errors: the file name, or the whole path if it has none
pub(crate) fn file_label(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Bidirectional whole-file copy over the session
#[async_trait]
pub trait TransferChannel: Send + Sync {
    /// Copy a local file to `remote`, replacing any existing file
    async fn push(&self, local: &Path, remote: &str) -> Result<(), TransferError>;

    /// Copy `remote` to a local file, replacing any existing file
    async fn pull(&self, remote: &str, local: &Path) -> Result<(), TransferError>;
}
