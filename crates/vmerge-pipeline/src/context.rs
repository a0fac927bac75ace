//! Per-request run context.
//!
//! Holds everything one merge run owns exclusively: its scratch directory,
//! its cancellation signal and its resource budgets. Nothing here is shared
//! between runs.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vmerge_media::fs_utils::count_files;
use vmerge_media::ByteBudget;
use vmerge_models::RunId;

use crate::error::{AbortReason, PipelineError, PipelineResult};

/// Resource limits of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunBudget {
    pub max_total_bytes: u64,
    pub max_wall_clock: Duration,
}

#[derive(Debug)]
struct CancelState {
    tx: watch::Sender<bool>,
    reason: OnceLock<AbortReason>,
}

impl CancelState {
    fn trigger(&self, reason: AbortReason) {
        let _ = self.reason.set(reason);
        self.tx.send_replace(true);
    }
}

/// Cloneable handle that cancels one run from outside.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.state.trigger(AbortReason::Cancelled);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.tx.borrow()
    }
}

#[derive(Debug)]
pub struct RunContext {
    run_id: RunId,
    scratch: Option<TempDir>,
    scratch_path: PathBuf,
    cancel: Arc<CancelState>,
    budget: RunBudget,
    bytes: ByteBudget,
    started: Instant,
}

impl RunContext {
    /// Create the run's scratch directory under `work_dir`.
    pub async fn create(work_dir: &Path, budget: RunBudget) -> PipelineResult<Self> {
        let run_id = RunId::new();
        tokio::fs::create_dir_all(work_dir).await?;

        let scratch = tempfile::Builder::new()
            .prefix(&format!("run-{}-", run_id.short()))
            .tempdir_in(work_dir)?;
        let scratch_path = scratch.path().to_path_buf();

        debug!(run_id = %run_id, scratch = %scratch_path.display(), "Created run scratch directory");

        let (tx, _) = watch::channel(false);
        Ok(Self {
            run_id,
            scratch: Some(scratch),
            scratch_path,
            cancel: Arc::new(CancelState {
                tx,
                reason: OnceLock::new(),
            }),
            budget,
            bytes: ByteBudget::new(budget.max_total_bytes),
            started: Instant::now(),
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn scratch_path(&self) -> &Path {
        &self.scratch_path
    }

    pub fn budget(&self) -> RunBudget {
        self.budget
    }

    /// Byte allowance shared by this run's fetches.
    pub fn byte_budget(&self) -> &ByteBudget {
        &self.bytes
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wall-clock budget left.
    pub fn remaining(&self) -> Duration {
        self.budget.max_wall_clock.saturating_sub(self.elapsed())
    }

    /// A fresh receiver of the cancellation signal.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.tx.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            state: self.cancel.clone(),
        }
    }

    pub fn cancel(&self, reason: AbortReason) {
        self.cancel.trigger(reason);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.tx.borrow()
    }

    /// Why the run was cancelled, if it was.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        if self.is_cancelled() {
            Some(self.cancel.reason.get().copied().unwrap_or(AbortReason::Cancelled))
        } else {
            None
        }
    }

    /// Error to report when a stage ended because the run was cancelled.
    pub fn abort_error(&self) -> Option<PipelineError> {
        self.abort_reason().map(PipelineError::Aborted)
    }

    /// Remove the scratch directory and everything in it. Idempotent.
    ///
    /// Returns whether the directory is gone afterwards.
    pub async fn teardown(&mut self) -> bool {
        // Stop anything still holding a receiver
        self.cancel.tx.send_replace(true);

        let Some(scratch) = self.scratch.take() else {
            return true;
        };

        let leftover = count_files(&self.scratch_path).await;
        let path = self.scratch_path.clone();
        let removed = match tokio::task::spawn_blocking(move || scratch.close()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(run_id = %self.run_id, "Failed to remove scratch directory {}: {}", path.display(), e);
                vmerge_media::fs_utils::remove_dir_quietly(&path).await
            }
            Err(e) => {
                warn!(run_id = %self.run_id, "Scratch cleanup task failed: {}", e);
                vmerge_media::fs_utils::remove_dir_quietly(&path).await
            }
        };

        info!(
            run_id = %self.run_id,
            files_removed = leftover,
            removed,
            "Run scratch directory released"
        );
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget() -> RunBudget {
        RunBudget {
            max_total_bytes: 1024,
            max_wall_clock: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_scratch_is_exclusive_and_removed() {
        let work = tempfile::tempdir().unwrap();
        let mut a = RunContext::create(work.path(), budget()).await.unwrap();
        let b = RunContext::create(work.path(), budget()).await.unwrap();

        assert_ne!(a.scratch_path(), b.scratch_path());
        assert!(a.scratch_path().starts_with(work.path()));

        tokio::fs::write(a.scratch_path().join("clip_00.mp4"), b"x").await.unwrap();
        let path = a.scratch_path().to_path_buf();
        assert!(a.teardown().await);
        assert!(!path.exists());
        assert!(a.teardown().await);
        assert!(b.scratch_path().exists());
    }

    #[tokio::test]
    async fn test_cancel_handle_propagates() {
        let work = tempfile::tempdir().unwrap();
        let ctx = RunContext::create(work.path(), budget()).await.unwrap();
        let mut rx = ctx.cancel_signal();
        assert!(!ctx.is_cancelled());

        ctx.cancel_handle().cancel();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert_eq!(ctx.abort_reason(), Some(AbortReason::Cancelled));
    }

    #[tokio::test]
    async fn test_first_abort_reason_wins() {
        let work = tempfile::tempdir().unwrap();
        let ctx = RunContext::create(work.path(), budget()).await.unwrap();
        ctx.cancel(AbortReason::DeadlineExceeded);
        ctx.cancel(AbortReason::Cancelled);
        assert_eq!(ctx.abort_reason(), Some(AbortReason::DeadlineExceeded));
    }
}
