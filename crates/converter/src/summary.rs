use std::fmt;
use std::path::PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::item::{ItemStatus, Stage, WorkItem};

/// Final state of one item as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReport {
    pub source_name: String,
    pub status: ItemStatus,
    pub local_target: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl From<&WorkItem> for ItemReport {
    fn from(item: &WorkItem) -> Self {
        Self {
            source_name: item.source_name.clone(),
            status: item.status,
            local_target: item.local_target_path.clone(),
            stage: item.failure.as_ref().map(|f| f.stage),
            cause: item.failure.as_ref().map(|f| f.reason.clone()),
        }
    }
}

/// Externally observable result of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Remote workspace root; `None` when nothing needed converting
    pub workspace: Option<String>,
    /// `None` when no workspace was created
    pub workspace_removed: Option<bool>,
    pub cancelled: bool,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<ItemReport>,
}

impl RunSummary {
    /// Summary for a batch with nothing to do
    pub fn empty(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self::from_items(run_id, started_at, &[])
    }

    /// Build counts from the items' final states
    pub fn from_items(run_id: Uuid, started_at: DateTime<Utc>, items: &[WorkItem]) -> Self {
        let items: Vec<ItemReport> = items.iter().map(ItemReport::from).collect();
        let succeeded = items.iter().filter(|r| r.status.is_success()).count();
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            workspace: None,
            workspace_removed: None,
            cancelled: false,
            total: items.len(),
            succeeded,
            failed: items.len() - succeeded,
            items,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemReport> {
        self.items.iter().filter(|r| !r.status.is_success())
    }
}

/// Format a chrono duration as `Xh Ym Zs`
pub fn format_duration(d: chrono::Duration) -> String {
    let hours = d.num_hours();
    let minutes = d.num_minutes() % 60;
    let seconds = d.num_seconds() % 60;
    format!("{}h {}m {}s", hours, minutes, seconds)
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {}", self.run_id)?;
        for r in &self.items {
            match (&r.stage, &r.cause) {
                (Some(stage), Some(cause)) => writeln!(f, "  ✗ {} [{}] {}", r.source_name, stage, cause)?,
                (Some(stage), None) => writeln!(f, "  ✗ {} [{}]", r.source_name, stage)?,
                _ => writeln!(f, "  ✓ {} ({})", r.source_name, r.status)?,
            }
        }
        if self.cancelled {
            writeln!(f, "Run was cancelled before all items were dispatched")?;
        }
        if self.workspace_removed == Some(false) {
            if let Some(ws) = &self.workspace {
                writeln!(f, "Warning: remote workspace {} was not removed", ws)?;
            }
        }
        write!(
            f,
            "Total: {}, succeeded: {}, failed: {} (elapsed {})",
            self.total,
            self.succeeded,
            self.failed,
            format_duration(self.finished_at - self.started_at)
        )
    }
}
