//! Error types for media operations.
//!
//! `MediaError` covers the subprocess and filesystem plumbing. Each pipeline
//! component has its own typed error carrying a `reason` so callers can map
//! failures without string matching.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while invoking external tools.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{0} not found in PATH")]
    ToolNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaError {
    pub fn tool_not_found(program: impl Into<String>) -> Self {
        Self::ToolNotFound(program.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Why a clip download failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailure {
    InvalidUrl,
    Timeout,
    HttpStatus(u16),
    SizeExceeded,
    ConnectionReset,
    UnsupportedContentType,
    Io,
    Cancelled,
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::InvalidUrl => write!(f, "invalid_url"),
            FetchFailure::Timeout => write!(f, "timeout"),
            FetchFailure::HttpStatus(code) => write!(f, "http_status {}", code),
            FetchFailure::SizeExceeded => write!(f, "size_exceeded"),
            FetchFailure::ConnectionReset => write!(f, "connection_reset"),
            FetchFailure::UnsupportedContentType => write!(f, "unsupported_content_type"),
            FetchFailure::Io => write!(f, "io"),
            FetchFailure::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("Clip {position}: download failed ({reason}): {message}")]
pub struct FetchError {
    pub position: usize,
    pub reason: FetchFailure,
    pub message: String,
}

impl FetchError {
    pub fn new(position: usize, reason: FetchFailure, message: impl Into<String>) -> Self {
        Self {
            position,
            reason,
            message: message.into(),
        }
    }
}

/// Why clip inspection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    NotAVideo,
    Corrupt,
    ToolFailure,
    Cancelled,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeFailure::NotAVideo => "not_a_video",
            ProbeFailure::Corrupt => "corrupt",
            ProbeFailure::ToolFailure => "tool_failure",
            ProbeFailure::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("Clip {position}: unsupported or corrupt media ({reason}): {message}")]
pub struct ProbeError {
    pub position: usize,
    pub reason: ProbeFailure,
    pub message: String,
}

impl ProbeError {
    pub fn new(position: usize, reason: ProbeFailure, message: impl Into<String>) -> Self {
        Self {
            position,
            reason,
            message: message.into(),
        }
    }
}

/// The input constraint a request violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationConstraint {
    ClipCount,
    UrlFormat,
    TotalDuration,
    TransitionRange,
    OutputFormat,
}

impl fmt::Display for ValidationConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationConstraint::ClipCount => "clip_count",
            ValidationConstraint::UrlFormat => "url_format",
            ValidationConstraint::TotalDuration => "total_duration",
            ValidationConstraint::TransitionRange => "transition_range",
            ValidationConstraint::OutputFormat => "output_format",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub constraint: ValidationConstraint,
    /// Summed clip duration, when it was measured
    pub measured_total: Option<f64>,
    /// Offending clip, when a single clip is at fault
    pub position: Option<usize>,
    pub message: String,
}

impl ValidationError {
    pub fn new(constraint: ValidationConstraint, message: impl Into<String>) -> Self {
        Self {
            constraint,
            measured_total: None,
            position: None,
            message: message.into(),
        }
    }

    pub fn at(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_total(mut self, total: f64) -> Self {
        self.measured_total = Some(total);
        self
    }
}

/// Why composition planning failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanFailure {
    IncompatibleGeometry,
    TransitionTooLong,
}

impl fmt::Display for PlanFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanFailure::IncompatibleGeometry => f.write_str("incompatible_geometry"),
            PlanFailure::TransitionTooLong => f.write_str("transition_too_long"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("Cannot plan merge ({reason}): {message}")]
pub struct PlanError {
    pub reason: PlanFailure,
    pub position: Option<usize>,
    pub message: String,
}

impl PlanError {
    pub fn geometry(position: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            reason: PlanFailure::IncompatibleGeometry,
            position,
            message: message.into(),
        }
    }

    pub fn transition(position: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            reason: PlanFailure::TransitionTooLong,
            position,
            message: message.into(),
        }
    }
}

/// Why the transcode step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionFailure {
    Timeout,
    ToolFailure,
    OutputMismatch,
    Cancelled,
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionFailure::Timeout => "timeout",
            ExecutionFailure::ToolFailure => "tool_failure",
            ExecutionFailure::OutputMismatch => "output_mismatch",
            ExecutionFailure::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("Transcode failed ({reason}): {message}")]
pub struct ExecutionError {
    pub reason: ExecutionFailure,
    pub message: String,
    /// Tail of the transcoder's diagnostic stream
    pub diagnostics: Option<String>,
}

impl ExecutionError {
    pub fn new(reason: ExecutionFailure, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        let diagnostics = diagnostics.into();
        if !diagnostics.trim().is_empty() {
            self.diagnostics = Some(diagnostics);
        }
        self
    }
}
