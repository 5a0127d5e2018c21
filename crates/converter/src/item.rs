use std::fmt;
use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Position of a work item in the per-item pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Uploaded,
    Converted,
    Downloaded,
    CleanedUp,
    Failed,
}

impl ItemStatus {
    /// The only status reachable from `self` on the success path
    pub fn next(self) -> Option<ItemStatus> {
        match self {
            ItemStatus::Pending => Some(ItemStatus::Uploaded),
            ItemStatus::Uploaded => Some(ItemStatus::Converted),
            ItemStatus::Converted => Some(ItemStatus::Downloaded),
            ItemStatus::Downloaded => Some(ItemStatus::CleanedUp),
            ItemStatus::CleanedUp | ItemStatus::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::CleanedUp | ItemStatus::Failed)
    }

    /// Local target exists; remote cleanup failing leaves an item at `Downloaded`
    pub fn is_success(self) -> bool {
        matches!(self, ItemStatus::Downloaded | ItemStatus::CleanedUp)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Uploaded => "uploaded",
            ItemStatus::Converted => "converted",
            ItemStatus::Downloaded => "downloaded",
            ItemStatus::CleanedUp => "cleaned_up",
            ItemStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Pipeline step an item failed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Upload,
    Convert,
    Download,
    /// Never dispatched because the run was cancelled
    Cancelled,
    /// The worker handling the item died before reporting
    Aborted,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::Convert => "convert",
            Stage::Download => "download",
            Stage::Cancelled => "cancelled",
            Stage::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why an item ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{name}: cannot move from {from} to {to}")]
    Illegal { name: String, from: ItemStatus, to: ItemStatus },
    #[error("{name}: already terminal ({status})")]
    Terminal { name: String, status: ItemStatus },
}

/// One source file scheduled for remote conversion and local retrieval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// File stem shared by source and target
    pub source_name: String,
    pub local_source_path: PathBuf,
    pub local_target_path: PathBuf,
    pub remote_source_path: String,
    pub remote_target_path: String,
    pub status: ItemStatus,
    /// Set only when `status == Failed`
    pub failure: Option<ItemFailure>,
}

impl WorkItem {
    pub fn new(
        source_name: String,
        local_source_path: PathBuf,
        local_target_path: PathBuf,
        remote_source_path: String,
        remote_target_path: String,
    ) -> Self {
        Self {
            source_name,
            local_source_path,
            local_target_path,
            remote_source_path,
            remote_target_path,
            status: ItemStatus::Pending,
            failure: None,
        }
    }

    /// Move one step along the success path
    pub fn advance(&mut self, to: ItemStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                name: self.source_name.clone(),
                status: self.status,
            });
        }
        if self.status.next() != Some(to) {
            return Err(TransitionError::Illegal {
                name: self.source_name.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Mark the item failed at `stage`; only legal from a non-terminal status
    pub fn fail(&mut self, stage: Stage, reason: impl Into<String>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                name: self.source_name.clone(),
                status: self.status,
            });
        }
        self.status = ItemStatus::Failed;
        self.failure = Some(ItemFailure {
            stage,
            reason: reason.into(),
        });
        Ok(())
    }

    pub fn failure_stage(&self) -> Option<Stage> {
        self.failure.as_ref().map(|f| f.stage)
    }
}
