//! Shared data models for the vmerge service.
//!
//! This crate provides Serde-serializable types for:
//! - Merge requests and responses (HTTP schema)
//! - Output quality and aspect ratio selection
//! - Clip lifecycle records (request, fetched, probed)
//! - Merge plans produced by the composition planner
//! - Encoding configuration

pub mod clip;
pub mod encoding;
pub mod format;
pub mod merge;
pub mod plan;
pub mod run;

// Re-export common types
pub use clip::{ClipMetadata, ClipRequest, FetchedClip, ProbedClip};
pub use encoding::EncodingConfig;
pub use format::{AspectRatio, FormatParseError, FrameSize, Quality};
pub use merge::{
    ErrorResponse, MergeOptions, MergeRequest, MergeResponse, MergeResult, MAX_CLIPS,
    MAX_TOTAL_DURATION_SECS, MAX_TRANSITION_SECS, MIN_CLIPS, MIN_TRANSITION_SECS,
};
pub use plan::{AudioJunction, AudioMode, MergePlan, ScalePad, SegmentPlan};
pub use run::RunId;
