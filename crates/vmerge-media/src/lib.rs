#![deny(unreachable_patterns)]
//! Media plumbing and the merge algorithm core.
//!
//! This crate provides:
//! - A narrow subprocess seam ([`ToolInvoker`]) for FFmpeg and FFprobe
//! - Type-safe FFmpeg command building and `-progress pipe:2` parsing
//! - Clip download with size, type and time limits
//! - Clip inspection, request admission and duration validation
//! - Composition planning (geometry, chained crossfade offsets, audio policy)
//! - Filter graph serialization and the single transcode run

pub mod command;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod filters;
pub mod fs_utils;
pub mod planner;
pub mod probe;
pub mod progress;
pub mod validate;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use command::{
    check_ffmpeg, check_ffprobe, wait_cancelled, FfmpegCommand, ProcessInvoker, ToolInvocation,
    ToolInvoker, ToolOutput,
};
pub use error::{
    ExecutionError, ExecutionFailure, FetchError, FetchFailure, MediaError, MediaResult,
    PlanError, PlanFailure, ProbeError, ProbeFailure, ValidationConstraint, ValidationError,
};
pub use executor::{TranscodeExecutor, OUTPUT_FILE_NAME};
pub use fetch::{ByteBudget, ClipFetcher};
pub use filters::{build_filter_graph, FilterGraph};
pub use planner::CompositionPlanner;
pub use probe::{MediaInfo, MediaProbe};
pub use progress::FfmpegProgress;
pub use validate::DurationValidator;
