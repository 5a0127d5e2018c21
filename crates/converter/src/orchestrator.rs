//! Drives a batch of work items through upload, convert, download and
//! remote cleanup.
//!
//! Items run on a bounded pool of tasks sharing one session. A failure inside
//! one item's pipeline is recorded on that item and never stops the others.
//! The workspace is removed only after every dispatched item has reached a
//! terminal state.

use std::io;
use std::sync::Arc;
use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use log::{debug, error, info, warn};

use crate::capability::ensure_capability;
use crate::config::ConvertConfig;
use crate::error::RunError;
use crate::exec::RemoteExec;
use crate::item::{ItemStatus, Stage, WorkItem};
use crate::scan::{self, Inventory};
use crate::session::{open_session, Session};
use crate::shell;
use crate::sidecar;
use crate::summary::RunSummary;
use crate::transfer::TransferChannel;
use crate::workspace::RemoteWorkspace;

/// Scan, connect, convert and clean up: one complete run
///
/// Nothing is connected when the inventory is empty. The session is released
/// on every path out of the run once it has been opened.
pub async fn run_conversion(cfg: &ConvertConfig, cancel: CancellationToken) -> Result<RunSummary> {
    cfg.validate()?;
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    let inventory = scan::scan_inventory(cfg)?;
    if inventory.pending.is_empty() {
        info!("Nothing to convert!");
        return Ok(RunSummary::empty(run_id, started_at));
    }
    info!(
        "Need to convert {} files (skipping {} existing .{} outputs)",
        inventory.pending.len(),
        inventory.converted.len(),
        cfg.target_ext
    );

    let session = open_session(cfg, run_id).await?;
    info!("Session open: {}", session.describe());

    let orchestrator = Orchestrator::new(cfg.clone(), session.clone());
    let outcome = orchestrator.execute(run_id, started_at, inventory, cancel).await;
    session.release().await;

    Ok(outcome?)
}

/// Owns the session and workspace for the duration of a run
pub struct Orchestrator {
    pipeline: Pipeline,
}

impl Orchestrator {
    pub fn new(cfg: ConvertConfig, session: Arc<dyn Session>) -> Self {
        Self {
            pipeline: Pipeline {
                cfg: Arc::new(cfg),
                session,
            },
        }
    }

    /// Run the batch: capability check, workspace, items, workspace removal
    ///
    /// Only run-level faults (capability, workspace creation) return `Err`;
    /// item faults are reported in the summary.
    pub async fn execute(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        inventory: Inventory,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let cfg = &self.pipeline.cfg;
        let session = &*self.pipeline.session;

        if let Some(cap) = &cfg.capability {
            ensure_capability(session, cap, cfg.setup_timeout()).await?;
        }

        let workspace = RemoteWorkspace::for_run(&cfg.workspace_base, &cfg.workspace_prefix, run_id);
        if let Err(e) = workspace.create(session, cfg.command_timeout()).await {
            error!("❌ {}", e);
            workspace.remove(session, cfg.command_timeout()).await;
            return Err(e);
        }

        let items = inventory.into_work_items(&workspace);

        let run_cancel = cancel.child_token();
        let timer = cfg.run_timeout().map(|limit| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        warn!("⏰ Run timeout of {:?} reached, no new items will start", limit);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });

        let (items, cancelled) = self.process_all(items, &run_cancel).await;

        if let Some(timer) = timer {
            timer.abort();
        }

        let removed = workspace.remove(session, cfg.command_timeout()).await;

        let mut summary = RunSummary::from_items(run_id, started_at, &items);
        summary.workspace = Some(workspace.root().to_string());
        summary.workspace_removed = Some(removed);
        summary.cancelled = cancelled;

        info!(
            "Run {} finished: {} total, {} succeeded, {} failed",
            run_id, summary.total, summary.succeeded, summary.failed
        );
        Ok(summary)
    }

    /// Dispatch every item onto the pool and join them all
    ///
    /// Returns items in their original order and whether dispatch stopped
    /// early because of cancellation.
    async fn process_all(&self, items: Vec<WorkItem>, cancel: &CancellationToken) -> (Vec<WorkItem>, bool) {
        let total = items.len();
        let workers = self.pipeline.cfg.workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        info!("Starting conversion of {} item(s) with {} worker(s)", total, workers);

        enum Slot {
            Running(WorkItem, JoinHandle<WorkItem>),
            Done(WorkItem),
        }

        let mut slots = Vec::with_capacity(total);
        let mut cancelled = false;

        for (index, mut item) in items.into_iter().enumerate() {
            let permit = if cancelled {
                None
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                }
            };

            let Some(permit) = permit else {
                if !cancelled {
                    warn!("🛑 Run cancelled, {} item(s) will not be started", total - index);
                    cancelled = true;
                }
                if let Err(e) = item.fail(Stage::Cancelled, "run cancelled before the item started") {
                    error!("{}", e);
                }
                slots.push(Slot::Done(item));
                continue;
            };

            let pipeline = self.pipeline.clone();
            let tag = format!("[{}/{}] {}", index + 1, total, item.source_name);
            let snapshot = item.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                pipeline.run_item(item, &tag).await
            });
            slots.push(Slot::Running(snapshot, handle));
        }

        let mut finished = Vec::with_capacity(total);
        for slot in slots {
            match slot {
                Slot::Done(item) => finished.push(item),
                Slot::Running(mut snapshot, handle) => match handle.await {
                    Ok(item) => finished.push(item),
                    Err(e) => {
                        error!("❌ Worker for {} died: {}", snapshot.source_name, e);
                        if let Err(e) = snapshot.fail(Stage::Aborted, format!("worker task failed: {}", e)) {
                            error!("{}", e);
                        }
                        finished.push(snapshot);
                    }
                },
            }
        }

        (finished, cancelled)
    }
}

/// Shared, cheaply clonable state each item task works with
#[derive(Clone)]
struct Pipeline {
    cfg: Arc<ConvertConfig>,
    session: Arc<dyn Session>,
}

impl Pipeline {
    /// Take one item to a terminal state
    async fn run_item(&self, mut item: WorkItem, tag: &str) -> WorkItem {
        match self.drive(&mut item, tag).await {
            Ok(()) => {
                if self.cfg.failure_notes {
                    if let Err(e) = sidecar::clear_why_txt(&item.local_source_path) {
                        warn!("{} {}", tag, e);
                    }
                }
            }
            Err((stage, reason)) => {
                error!("❌ {} failed at {}: {}", tag, stage, reason);
                if self.cfg.failure_notes {
                    if let Err(e) = sidecar::write_why_txt(&item.local_source_path, &format!("{}: {}", stage, reason)) {
                        warn!("{} {}", tag, e);
                    }
                }
                if let Err(e) = item.fail(stage, reason) {
                    error!("{}", e);
                }
                // Remote copies are disposable; the workspace removal gets them anyway
                self.discard_remote(&item, tag).await;
            }
        }
        item
    }

    /// The success path; `Err` carries the stage that failed and why
    async fn drive(&self, item: &mut WorkItem, tag: &str) -> Result<(), (Stage, String)> {
        let cfg = &self.cfg;

        info!("{} Uploading...", tag);
        self.session
            .push(&item.local_source_path, &item.remote_source_path)
            .await
            .map_err(|e| (Stage::Upload, e.to_string()))?;
        item.advance(ItemStatus::Uploaded).map_err(|e| (Stage::Upload, e.to_string()))?;

        info!("{} Converting...", tag);
        let cmd = shell::render_convert_command(&cfg.convert_command, &item.remote_source_path, &item.remote_target_path)
            .map_err(|e| (Stage::Convert, e.to_string()))?;
        let out = self
            .session
            .run(&cmd, cfg.command_timeout())
            .await
            .map_err(|e| (Stage::Convert, e.to_string()))?;
        if !out.success() {
            debug!("{} convert stderr: {}", tag, out.stderr);
            return Err((Stage::Convert, out.brief()));
        }
        item.advance(ItemStatus::Converted).map_err(|e| (Stage::Convert, e.to_string()))?;

        info!("{} Downloading...", tag);
        self.download(item).await.map_err(|e| (Stage::Download, e))?;
        item.advance(ItemStatus::Downloaded).map_err(|e| (Stage::Download, e.to_string()))?;

        // Best effort: the item already counts as converted
        match shell::remove_files_command(&[&item.remote_source_path, &item.remote_target_path]) {
            Ok(cmd) => match self.session.run(&cmd, cfg.command_timeout()).await {
                Ok(out) if out.success() => {
                    if let Err(e) = item.advance(ItemStatus::CleanedUp) {
                        error!("{}", e);
                    }
                }
                Ok(out) => warn!("{} Remote cleanup failed: {}", tag, out.brief()),
                Err(e) => warn!("{} Remote cleanup failed: {}", tag, e),
            },
            Err(e) => warn!("{} Remote cleanup skipped: {}", tag, e),
        }

        info!("✅ {} Done", tag);
        Ok(())
    }

    /// Pull into `<target>.part` and rename into place only once complete
    async fn download(&self, item: &WorkItem) -> Result<(), String> {
        let partial = sidecar::partial_path(&item.local_target_path);

        let result = async {
            self.session
                .pull(&item.remote_target_path, &partial)
                .await
                .map_err(|e| e.to_string())?;

            let min = self.cfg.min_target_bytes;
            if min > 0 {
                let size = tokio::fs::metadata(&partial)
                    .await
                    .map_err(|e| format!("cannot stat {}: {}", partial.display(), e))?
                    .len();
                if size < min {
                    return Err(format!("output is {} bytes, below the {} byte minimum", size, min));
                }
            }

            tokio::fs::rename(&partial, &item.local_target_path)
                .await
                .map_err(|e| format!("cannot move {} into place: {}", partial.display(), e))
        }
        .await;

        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&partial).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove partial download {}: {}", partial.display(), e);
                }
            }
        }
        result
    }

    async fn discard_remote(&self, item: &WorkItem, tag: &str) {
        let cmd = match shell::remove_files_command(&[&item.remote_source_path, &item.remote_target_path]) {
            Ok(cmd) => cmd,
            Err(e) => {
                debug!("{} {}", tag, e);
                return;
            }
        };
        match self.session.run(&cmd, self.cfg.command_timeout()).await {
            Ok(out) if out.success() => {}
            Ok(out) => debug!("{} Remote discard failed: {}", tag, out.brief()),
            Err(e) => debug!("{} Remote discard failed: {}", tag, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use async_trait::async_trait;
    use crate::config::{CapabilityConfig, Transport};
    use crate::exec::{ExecError, ExecOutput, RemoteExec};
    use crate::session::LocalSession;
    use crate::transfer::{Direction, TransferChannel, TransferError};

    /// Local session that can be told to fail transfers of particular files
    struct FlakySession {
        inner: LocalSession,
        fail_push: HashSet<String>,
        fail_pull: HashSet<String>,
        fail_cleanup: bool,
    }

    impl FlakySession {
        fn new() -> Self {
            Self {
                inner: LocalSession::new(Duration::from_secs(10)),
                fail_push: HashSet::new(),
                fail_pull: HashSet::new(),
                fail_cleanup: false,
            }
        }
    }

    fn name_of(path: &str) -> String {
        Path::new(path).file_name().unwrap().to_string_lossy().into_owned()
    }

    #[async_trait]
    impl TransferChannel for FlakySession {
        async fn push(&self, local: &Path, remote: &str) -> Result<(), TransferError> {
            if self.fail_push.contains(&name_of(remote)) {
                return Err(TransferError::remote(name_of(remote), Direction::Push, "connection reset"));
            }
            self.inner.push(local, remote).await
        }

        async fn pull(&self, remote: &str, local: &Path) -> Result<(), TransferError> {
            if self.fail_pull.contains(&name_of(remote)) {
                // leave a partial file behind, like an interrupted copy would
                fs::write(local, b"half").unwrap();
                return Err(TransferError::remote(name_of(remote), Direction::Pull, "connection reset"));
            }
            self.inner.pull(remote, local).await
        }
    }

    #[async_trait]
    impl RemoteExec for FlakySession {
        async fn run(&self, command: &str, timeout: Duration) -> Result<ExecOutput, ExecError> {
            if self.fail_cleanup && command.starts_with("rm -f ") {
                return Ok(ExecOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: "permission denied".to_string(),
                });
            }
            self.inner.run(command, timeout).await
        }
    }

    #[async_trait]
    impl Session for FlakySession {
        fn describe(&self) -> String {
            "flaky local".to_string()
        }

        async fn release(&self) {
            self.inner.release().await;
        }
    }

    struct Fixture {
        local: tempfile::TempDir,
        remote: tempfile::TempDir,
        cfg: ConvertConfig,
    }

    fn fixture(sources: &[&str], targets: &[&str]) -> Fixture {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        for s in sources {
            fs::write(local.path().join(format!("{}.wav", s)), format!("audio:{}", s)).unwrap();
        }
        for t in targets {
            fs::write(local.path().join(format!("{}.mp3", t)), b"existing").unwrap();
        }
        let cfg = ConvertConfig {
            local_dir: local.path().to_path_buf(),
            transport: Transport::Local,
            workspace_base: remote.path().display().to_string(),
            capability: None,
            convert_command: "cp {input} {output}".to_string(),
            command_timeout_secs: 20,
            ..Default::default()
        };
        Fixture { local, remote, cfg }
    }

    async fn run_with(fx: &Fixture, session: Arc<dyn Session>, cancel: CancellationToken) -> Result<RunSummary, RunError> {
        let inventory = scan::scan_inventory(&fx.cfg).unwrap();
        Orchestrator::new(fx.cfg.clone(), session)
            .execute(Uuid::new_v4(), Utc::now(), inventory, cancel)
            .await
    }

    fn local_session() -> Arc<dyn Session> {
        Arc::new(LocalSession::new(Duration::from_secs(10)))
    }

    fn workspace_is_gone(fx: &Fixture) -> bool {
        fs::read_dir(fx.remote.path()).unwrap().count() == 0
    }

    fn stage_of(summary: &RunSummary, name: &str) -> Option<Stage> {
        summary.items.iter().find(|r| r.source_name == name).and_then(|r| r.stage)
    }

    #[tokio::test]
    async fn test_reference_scenario_convert_failure() {
        let mut fx = fixture(&["a", "b", "c"], &["a"]);
        fx.cfg.convert_command =
            "case {input} in */c.wav) echo 'bad input' >&2; exit 3;; esac; cp {input} {output}".to_string();

        let summary = run_with(&fx, local_session(), CancellationToken::new()).await.unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(stage_of(&summary, "c"), Some(Stage::Convert));
        assert!(summary.items[1].cause.as_deref().unwrap().contains("bad input"));
        assert_eq!(summary.items[0].status, ItemStatus::CleanedUp);

        let dir = fx.local.path();
        assert_eq!(fs::read(dir.join("a.mp3")).unwrap(), b"existing");
        assert_eq!(fs::read(dir.join("b.mp3")).unwrap(), b"audio:b");
        assert!(!dir.join("c.mp3").exists());
        assert!(!dir.join("c.mp3.part").exists());

        assert_eq!(summary.workspace_removed, Some(true));
        assert!(workspace_is_gone(&fx));
    }

    #[tokio::test]
    async fn test_convert_timeout_fails_item_and_batch_continues() {
        let mut fx = fixture(&["fast", "slow", "steady"], &[]);
        fx.cfg.convert_command = "case {input} in */slow.wav) sleep 5;; esac; cp {input} {output}".to_string();
        fx.cfg.command_timeout_secs = 1;

        let summary = run_with(&fx, local_session(), CancellationToken::new()).await.unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(stage_of(&summary, "slow"), Some(Stage::Convert));
        assert!(summary.items[1].cause.as_deref().unwrap().contains("timed out"));

        let dir = fx.local.path();
        assert!(!dir.join("slow.mp3").exists());
        assert!(!dir.join("slow.mp3.part").exists());
        assert_eq!(fs::read(dir.join("fast.mp3")).unwrap(), b"audio:fast");
        assert_eq!(fs::read(dir.join("steady.mp3")).unwrap(), b"audio:steady");
    }

    #[tokio::test]
    async fn test_placeholder_text_in_file_name_converts_normally() {
        let fx = fixture(&["{output}", "plain"], &[]);

        let summary = run_with(&fx, local_session(), CancellationToken::new()).await.unwrap();

        assert_eq!(summary.succeeded, 2, "{}", summary);
        assert_eq!(fs::read(fx.local.path().join("{output}.mp3")).unwrap(), b"audio:{output}");
        assert!(workspace_is_gone(&fx));
    }

    #[tokio::test]
    async fn test_upload_failure_does_not_stop_batch() {
        let fx = fixture(&["w", "x", "y", "z"], &[]);
        let mut session = FlakySession::new();
        session.fail_push.insert("x.wav".to_string());

        let summary = run_with(&fx, Arc::new(session), CancellationToken::new()).await.unwrap();

        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(stage_of(&summary, "x"), Some(Stage::Upload));
        for s in ["w", "y", "z"] {
            assert!(fx.local.path().join(format!("{}.mp3", s)).exists());
        }
        assert!(!fx.local.path().join("x.mp3").exists());
        assert!(workspace_is_gone(&fx));
    }

    #[tokio::test]
    async fn test_download_failure_leaves_no_local_target() {
        let fx = fixture(&["p", "q"], &[]);
        let mut session = FlakySession::new();
        session.fail_pull.insert("q.mp3".to_string());

        let summary = run_with(&fx, Arc::new(session), CancellationToken::new()).await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(stage_of(&summary, "q"), Some(Stage::Download));
        assert!(!fx.local.path().join("q.mp3").exists());
        assert!(!fx.local.path().join("q.mp3.part").exists());
        assert!(workspace_is_gone(&fx));
    }

    #[tokio::test]
    async fn test_cleanup_failure_keeps_item_successful() {
        let fx = fixture(&["m"], &[]);
        let mut session = FlakySession::new();
        session.fail_cleanup = true;

        let summary = run_with(&fx, Arc::new(session), CancellationToken::new()).await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.items[0].status, ItemStatus::Downloaded);
        assert!(summary.items[0].stage.is_none());
        assert!(fx.local.path().join("m.mp3").exists());
    }

    #[tokio::test]
    async fn test_undersized_output_is_rejected() {
        let mut fx = fixture(&["tiny"], &[]);
        fx.cfg.min_target_bytes = 1024;

        let summary = run_with(&fx, local_session(), CancellationToken::new()).await.unwrap();

        assert_eq!(stage_of(&summary, "tiny"), Some(Stage::Download));
        assert!(!fx.local.path().join("tiny.mp3").exists());
        assert!(!fx.local.path().join("tiny.mp3.part").exists());
    }

    #[tokio::test]
    async fn test_parallel_workers_convert_everything() {
        let mut fx = fixture(&["a1", "a2", "a3", "a4", "a5", "a6"], &[]);
        fx.cfg.workers = 3;

        let summary = run_with(&fx, local_session(), CancellationToken::new()).await.unwrap();

        assert_eq!(summary.total, 6);
        assert_eq!(summary.succeeded, 6);
        let names: Vec<_> = summary.items.iter().map(|r| r.source_name.as_str()).collect();
        assert_eq!(names, vec!["a1", "a2", "a3", "a4", "a5", "a6"]);
        assert!(workspace_is_gone(&fx));
    }

    #[tokio::test]
    async fn test_cancelled_run_still_cleans_up_and_accounts_for_all() {
        let fx = fixture(&["r", "s", "t"], &[]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = run_with(&fx, local_session(), cancel).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.failed, 3);
        assert!(summary.items.iter().all(|r| r.stage == Some(Stage::Cancelled)));
        assert!(workspace_is_gone(&fx));
    }

    #[tokio::test]
    async fn test_run_timeout_stops_dispatch() {
        let mut fx = fixture(&["u1", "u2", "u3"], &[]);
        fx.cfg.convert_command = "sleep 0.3; cp {input} {output}".to_string();
        fx.cfg.run_timeout_secs = Some(0);

        let summary = run_with(&fx, local_session(), CancellationToken::new()).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.succeeded + summary.failed, 3);
        assert!(summary.failures().all(|r| r.stage == Some(Stage::Cancelled)));
        assert!(workspace_is_gone(&fx));
    }

    #[tokio::test]
    async fn test_failure_notes_written_and_cleared() {
        let mut fx = fixture(&["n"], &[]);
        fx.cfg.failure_notes = true;
        fx.cfg.convert_command = "exit 9; {input} {output}".to_string();

        run_with(&fx, local_session(), CancellationToken::new()).await.unwrap();
        let note = fx.local.path().join("n.why.txt");
        assert!(fs::read_to_string(&note).unwrap().starts_with("convert: exit code 9"));

        fx.cfg.convert_command = "cp {input} {output}".to_string();
        let summary = run_with(&fx, local_session(), CancellationToken::new()).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(!note.exists());
    }

    #[tokio::test]
    async fn test_capability_failure_aborts_before_workspace() {
        let mut fx = fixture(&["k"], &[]);
        fx.cfg.capability = Some(CapabilityConfig {
            probe: "false".to_string(),
            install: "exit 100".to_string(),
            verify: "true".to_string(),
        });

        let err = run_with(&fx, local_session(), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunError::Capability { .. }));
        assert!(workspace_is_gone(&fx));
        assert!(!fx.local.path().join("k.mp3").exists());
    }

    #[tokio::test]
    async fn test_workspace_failure_is_fatal() {
        let mut fx = fixture(&["k"], &[]);
        let blocker = fx.remote.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        fx.cfg.workspace_base = blocker.display().to_string();

        let err = run_with(&fx, local_session(), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunError::Workspace { .. }));
    }

    #[tokio::test]
    async fn test_run_conversion_end_to_end_and_rerun_is_empty() {
        let fx = fixture(&["e1", "e2"], &[]);

        let first = run_conversion(&fx.cfg, CancellationToken::new()).await.unwrap();
        assert_eq!((first.total, first.succeeded), (2, 2));

        let second = run_conversion(&fx.cfg, CancellationToken::new()).await.unwrap();
        assert_eq!(second.total, 0);
        assert!(second.workspace.is_none());
        assert!(workspace_is_gone(&fx));
    }
}
