//! Run state machine.
//!
//! `Idle -> Fetching -> Probing -> Validating -> Planning -> Executing ->
//! Uploading -> Done`, with `Failed(kind)` reachable from every non-terminal
//! state. Transitions are one-way.

use std::fmt;

use tracing::info;

use crate::error::{PipelineError, PipelineResult};

/// Failure class of a terminated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Validation,
    Fetch,
    Probe,
    Plan,
    Execution,
    Upload,
    Cancelled,
    DeadlineExceeded,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::Fetch => "fetch",
            FailureKind::Probe => "probe",
            FailureKind::Plan => "plan",
            FailureKind::Execution => "execution",
            FailureKind::Upload => "upload",
            FailureKind::Cancelled => "cancelled",
            FailureKind::DeadlineExceeded => "deadline_exceeded",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Fetching,
    Probing,
    Validating,
    Planning,
    Executing,
    Uploading,
    Done,
    Failed(FailureKind),
}

impl RunState {
    /// Lowercase stage name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Fetching => "fetching",
            RunState::Probing => "probing",
            RunState::Validating => "validating",
            RunState::Planning => "planning",
            RunState::Executing => "executing",
            RunState::Uploading => "uploading",
            RunState::Done => "done",
            RunState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed(_))
    }

    /// The single forward successor of a non-terminal state.
    pub fn next(&self) -> Option<RunState> {
        match self {
            RunState::Idle => Some(RunState::Fetching),
            RunState::Fetching => Some(RunState::Probing),
            RunState::Probing => Some(RunState::Validating),
            RunState::Validating => Some(RunState::Planning),
            RunState::Planning => Some(RunState::Executing),
            RunState::Executing => Some(RunState::Uploading),
            RunState::Uploading => Some(RunState::Done),
            RunState::Done | RunState::Failed(_) => None,
        }
    }

    pub fn can_transition_to(&self, target: RunState) -> bool {
        match target {
            RunState::Failed(_) => !self.is_terminal(),
            other => self.next() == Some(other),
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Failed(kind) => write!(f, "failed({})", kind),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Current state plus the path taken to reach it.
#[derive(Debug, Clone)]
pub struct StateMachine {
    run_id: String,
    history: Vec<RunState>,
}

impl StateMachine {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            history: vec![RunState::Idle],
        }
    }

    pub fn current(&self) -> RunState {
        self.history.last().copied().unwrap_or(RunState::Idle)
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    pub fn advance(&mut self, target: RunState) -> PipelineResult<()> {
        let from = self.current();
        if !from.can_transition_to(target) {
            return Err(PipelineError::internal(format!(
                "illegal run state transition {} -> {}",
                from, target
            )));
        }
        info!(run_id = %self.run_id, from = %from, to = %target, "Run state changed");
        self.history.push(target);
        Ok(())
    }

    /// Move into `Failed(kind)`. A no-op once the run is terminal.
    pub fn fail(&mut self, kind: FailureKind) {
        if !self.current().is_terminal() {
            let from = self.current();
            info!(run_id = %self.run_id, from = %from, kind = %kind, "Run failed");
            self.history.push(RunState::Failed(kind));
        }
    }
}
