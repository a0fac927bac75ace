//! Pipeline error taxonomy.

use std::fmt;

use thiserror::Error;

use vmerge_media::{
    ExecutionError, FetchError, PlanError, ProbeError, ValidationError,
};
use vmerge_storage::StorageError;

use crate::state::FailureKind;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Why a run was stopped before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Cancelled,
    DeadlineExceeded,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Cancelled => f.write_str("cancelled"),
            AbortReason::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Fetch(#[from] FetchError),

    #[error("{0}")]
    Probe(#[from] ProbeError),

    #[error("{0}")]
    Plan(#[from] PlanError),

    #[error("{0}")]
    Execution(#[from] ExecutionError),

    #[error("Failed to store merged video: {0}")]
    Upload(#[from] StorageError),

    #[error("Merge aborted: {0}")]
    Aborted(AbortReason),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The terminal state this error drives the run into.
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::Validation(_) => FailureKind::Validation,
            PipelineError::Fetch(_) => FailureKind::Fetch,
            PipelineError::Probe(_) => FailureKind::Probe,
            PipelineError::Plan(_) => FailureKind::Plan,
            PipelineError::Execution(_) => FailureKind::Execution,
            PipelineError::Upload(_) => FailureKind::Upload,
            PipelineError::Aborted(AbortReason::Cancelled) => FailureKind::Cancelled,
            PipelineError::Aborted(AbortReason::DeadlineExceeded) => FailureKind::DeadlineExceeded,
            PipelineError::Io(_) | PipelineError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Clip index the failure refers to, when there is one.
    pub fn position(&self) -> Option<usize> {
        match self {
            PipelineError::Validation(e) => e.position,
            PipelineError::Fetch(e) => Some(e.position),
            PipelineError::Probe(e) => Some(e.position),
            PipelineError::Plan(e) => e.position,
            _ => None,
        }
    }

    /// Transcoder diagnostics attached to an execution failure.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            PipelineError::Execution(e) => e.diagnostics.as_deref(),
            _ => None,
        }
    }
}
